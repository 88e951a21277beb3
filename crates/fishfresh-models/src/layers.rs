//! Fully connected layers, activations and the Adam update.

use ndarray::{Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// `y = x · kernel + bias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// `[inputs, outputs]`.
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseLayer {
    /// Glorot-uniform kernel, zero bias.
    pub fn glorot<R: Rng>(inputs: usize, outputs: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (inputs + outputs) as f32).sqrt();
        let kernel = Array2::from_shape_fn((inputs, outputs), |_| rng.gen_range(-limit..limit));
        Self { kernel, bias: Array1::zeros(outputs) }
    }

    #[must_use]
    pub fn inputs(&self) -> usize {
        self.kernel.nrows()
    }

    #[must_use]
    pub fn outputs(&self) -> usize {
        self.kernel.ncols()
    }

    #[must_use]
    pub fn forward(&self, input: ArrayView2<'_, f32>) -> Array2<f32> {
        input.dot(&self.kernel) + &self.bias
    }

    /// Parameter gradients for upstream gradient `grad_out` at `input`.
    #[must_use]
    pub fn gradients(&self, input: ArrayView2<'_, f32>, grad_out: ArrayView2<'_, f32>) -> DenseGrads {
        DenseGrads { kernel: input.t().dot(&grad_out), bias: grad_out.sum_axis(Axis(0)) }
    }

    /// Gradient with respect to the layer input.
    #[must_use]
    pub fn backward_input(&self, grad_out: ArrayView2<'_, f32>) -> Array2<f32> {
        grad_out.dot(&self.kernel.t())
    }
}

#[derive(Debug, Clone)]
pub struct DenseGrads {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

#[must_use]
pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Zero `grad` wherever the pre-activation was not positive.
pub fn relu_backward(grad: &mut Array2<f32>, pre_activation: &Array2<f32>) {
    Zip::from(grad).and(pre_activation).for_each(|g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
}

/// Row-wise softmax.
#[must_use]
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Moment estimates for one parameter tensor.
#[derive(Debug, Clone)]
pub struct AdamSlot<D: Dimension> {
    m: Array<f32, D>,
    v: Array<f32, D>,
}

impl<D: Dimension> AdamSlot<D> {
    #[must_use]
    pub fn zeros_like(param: &Array<f32, D>) -> Self {
        Self { m: Array::zeros(param.raw_dim()), v: Array::zeros(param.raw_dim()) }
    }
}

/// Adam with the usual defaults (beta1 0.9, beta2 0.999, epsilon 1e-7).
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    pub learning_rate: f64,
    pub step: u64,
}

impl Adam {
    const BETA1: f32 = 0.9;
    const BETA2: f32 = 0.999;
    const EPSILON: f32 = 1e-7;

    #[must_use]
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate, step: 0 }
    }

    /// Advance the shared step counter once per batch, before the updates.
    pub fn begin_step(&mut self) {
        self.step += 1;
    }

    pub fn update<D: Dimension>(&self, param: &mut Array<f32, D>, grad: &Array<f32, D>, slot: &mut AdamSlot<D>) {
        let t = i32::try_from(self.step.max(1)).unwrap_or(i32::MAX);
        let correction1 = 1.0 - Self::BETA1.powi(t);
        let correction2 = 1.0 - Self::BETA2.powi(t);
        let lr = self.learning_rate as f32;

        Zip::from(param).and(grad).and(&mut slot.m).and(&mut slot.v).for_each(|p, &g, m, v| {
            *m = Self::BETA1 * *m + (1.0 - Self::BETA1) * g;
            *v = Self::BETA2 * *v + (1.0 - Self::BETA2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + Self::EPSILON);
        });
    }
}

/// Adam moments for one [`DenseLayer`].
#[derive(Debug, Clone)]
pub struct DenseSlots {
    pub kernel: AdamSlot<ndarray::Ix2>,
    pub bias: AdamSlot<ndarray::Ix1>,
}

impl DenseSlots {
    #[must_use]
    pub fn for_layer(layer: &DenseLayer) -> Self {
        Self { kernel: AdamSlot::zeros_like(&layer.kernel), bias: AdamSlot::zeros_like(&layer.bias) }
    }

    pub fn apply(&mut self, adam: &Adam, layer: &mut DenseLayer, grads: &DenseGrads) {
        adam.update(&mut layer.kernel, &grads.kernel, &mut self.kernel);
        adam.update(&mut layer.bias, &grads.bias, &mut self.bias);
    }
}
