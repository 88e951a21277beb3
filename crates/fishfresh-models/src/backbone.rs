//! Patch backbone: the image is pooled onto a coarse grid, each cell is
//! described by its per-channel mean and spread, and a stack of per-cell
//! layers (a projection followed by residual blocks) lifts that into the
//! feature space. Global average pooling closes the backbone.

use crate::layers::{relu, relu_backward, Adam, DenseLayer, DenseSlots};
use fishfresh_training::model::BackboneTrainability;
use fishfresh_training::{TrainingError, TrainingResult};
use ndarray::{s, Array2, Array4, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Grid cells per image side (capped by the image size).
pub const GRID: usize = 8;
/// Mean and standard deviation per RGB channel.
pub const CELL_FEATURES: usize = 6;
pub const FEATURE_WIDTH: usize = 32;

/// Grid actually used for a `[height, width]` input.
#[must_use]
pub fn grid_for(height: usize, width: usize) -> (usize, usize) {
    (GRID.min(height).max(1), GRID.min(width).max(1))
}

/// Cell descriptors for a batch, `[n * cells, CELL_FEATURES]`, sample-major.
#[must_use]
pub fn cell_features(images: &Array4<f32>) -> Array2<f32> {
    let (n, height, width, _) = images.dim();
    let (gh, gw) = grid_for(height, width);
    let cells = gh * gw;
    let mut out = Array2::zeros((n * cells, CELL_FEATURES));

    for (i, image) in images.axis_iter(Axis(0)).enumerate() {
        for gy in 0..gh {
            let (y0, y1) = (gy * height / gh, ((gy + 1) * height / gh).max(gy * height / gh + 1));
            for gx in 0..gw {
                let (x0, x1) = (gx * width / gw, ((gx + 1) * width / gw).max(gx * width / gw + 1));
                let patch = image.slice(s![y0..y1, x0..x1, ..]);
                let row = i * cells + gy * gw + gx;
                for c in 0..3 {
                    let channel = patch.index_axis(Axis(2), c);
                    let mean = channel.mean().unwrap_or(0.0);
                    let var = channel.mapv(|v| (v - mean).powi(2)).mean().unwrap_or(0.0);
                    out[[row, c]] = mean;
                    out[[row, 3 + c]] = var.sqrt();
                }
            }
        }
    }
    out
}

/// Activations kept from a forward pass for the backward pass.
#[derive(Debug, Clone)]
pub struct BackboneCache {
    pub cells: usize,
    /// Input to each layer.
    inputs: Vec<Array2<f32>>,
    /// Pre-activation of each layer.
    pre: Vec<Array2<f32>>,
    /// Per-sample pooled features, `[n, FEATURE_WIDTH]`.
    pub pooled: Array2<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBackbone {
    pub layers: Vec<DenseLayer>,
    /// Per-layer trainable flag.
    pub trainable: Vec<bool>,
}

impl PatchBackbone {
    /// `depth` layers, all frozen.
    pub fn new<R: Rng>(depth: usize, rng: &mut R) -> Self {
        let layers = (0..depth)
            .map(|i| {
                let inputs = if i == 0 { CELL_FEATURES } else { FEATURE_WIDTH };
                DenseLayer::glorot(inputs, FEATURE_WIDTH, rng)
            })
            .collect();
        Self { layers, trainable: vec![false; depth] }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn trainability(&self) -> BackboneTrainability {
        let last = self.trainable.iter().rev().take_while(|t| **t).count();
        if last == 0 {
            BackboneTrainability::Frozen
        } else {
            BackboneTrainability::PartiallyUnfrozen { last }
        }
    }

    pub fn set_trainability(&mut self, trainability: BackboneTrainability) -> TrainingResult<()> {
        let depth = self.depth();
        let last = match trainability {
            BackboneTrainability::Frozen => 0,
            BackboneTrainability::PartiallyUnfrozen { last } if last <= depth => last,
            BackboneTrainability::PartiallyUnfrozen { last } => {
                return Err(TrainingError::Backend(format!("cannot unfreeze {last} of {depth} backbone layers")));
            }
        };
        for (i, flag) in self.trainable.iter_mut().enumerate() {
            *flag = i >= depth - last;
        }
        Ok(())
    }

    /// Index of the first trainable layer, if any.
    fn first_trainable(&self) -> Option<usize> {
        self.trainable.iter().position(|t| *t)
    }

    pub fn forward(&self, images: &Array4<f32>) -> BackboneCache {
        let n = images.len_of(Axis(0));
        let (gh, gw) = grid_for(images.len_of(Axis(1)), images.len_of(Axis(2)));
        let cells = gh * gw;

        let mut inputs = Vec::with_capacity(self.depth());
        let mut pre = Vec::with_capacity(self.depth());
        let mut h = cell_features(images);
        for (i, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(h.view());
            let next = if i == 0 { relu(&z) } else { &h + &relu(&z) };
            inputs.push(h);
            pre.push(z);
            h = next;
        }

        let pooled = h
            .into_shape_with_order((n, cells, FEATURE_WIDTH))
            .map(|a| a.mean_axis(Axis(1)).unwrap_or_else(|| Array2::zeros((n, FEATURE_WIDTH))))
            .unwrap_or_else(|_| Array2::zeros((n, FEATURE_WIDTH)));
        BackboneCache { cells, inputs, pre, pooled }
    }

    /// Backpropagate `grad_pooled` (`[n, FEATURE_WIDTH]`) and update the
    /// trainable layers. Frozen layers below the first trainable one are not visited.
    pub fn backward(&mut self, cache: &BackboneCache, grad_pooled: &Array2<f32>, adam: &Adam, slots: &mut [DenseSlots]) {
        let Some(first) = self.first_trainable() else {
            return;
        };
        let cells = cache.cells;
        let scale = 1.0 / cells as f32;

        // un-pool: every cell of a sample receives grad / cells
        let n = grad_pooled.nrows();
        let mut grad_h = Array2::zeros((n * cells, FEATURE_WIDTH));
        for (i, g) in grad_pooled.rows().into_iter().enumerate() {
            grad_h.slice_mut(s![i * cells..(i + 1) * cells, ..]).assign(&(&g * scale));
        }

        for i in (first..self.depth()).rev() {
            let mut grad_z = grad_h.clone();
            relu_backward(&mut grad_z, &cache.pre[i]);
            let layer = &self.layers[i];
            let grads = layer.gradients(cache.inputs[i].view(), grad_z.view());
            if i > first {
                let through = layer.backward_input(grad_z.view());
                // residual blocks pass the gradient straight through as well
                grad_h = if i == 0 { through } else { grad_h + through };
            }
            if self.trainable[i] {
                slots[i].apply(adam, &mut self.layers[i], &grads);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_cell_features_on_solid_and_split_images() {
        let mut images = Array4::zeros((1, 2, 2, 3));
        images.slice_mut(s![0, .., 0, 0]).fill(1.0);
        let features = cell_features(&images);
        assert_eq!(features.dim(), (4, CELL_FEATURES));
        // top-left cell is pure red, no spread
        assert!((features[[0, 0]] - 1.0).abs() < 1e-6);
        assert!(features[[0, 3]].abs() < 1e-6);
        assert!(features[[1, 0]].abs() < 1e-6);
    }

    #[test]
    fn test_trainability_flags() {
        let mut backbone = PatchBackbone::new(5, &mut StdRng::seed_from_u64(1));
        assert_eq!(backbone.trainability(), BackboneTrainability::Frozen);

        backbone.set_trainability(BackboneTrainability::PartiallyUnfrozen { last: 2 }).unwrap();
        assert_eq!(backbone.trainable, vec![false, false, false, true, true]);
        assert_eq!(backbone.trainability(), BackboneTrainability::PartiallyUnfrozen { last: 2 });

        assert!(backbone.set_trainability(BackboneTrainability::PartiallyUnfrozen { last: 6 }).is_err());
        backbone.set_trainability(BackboneTrainability::Frozen).unwrap();
        assert!(backbone.trainable.iter().all(|t| !t));
    }

    #[test]
    fn test_frozen_layers_do_not_change() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut backbone = PatchBackbone::new(3, &mut rng);
        backbone.set_trainability(BackboneTrainability::PartiallyUnfrozen { last: 1 }).unwrap();
        let before = backbone.clone();

        let images = Array4::from_shape_fn((2, 4, 4, 3), |(n, y, x, c)| ((n + y + x + c) % 3) as f32 / 2.0);
        let cache = backbone.forward(&images);
        assert_eq!(cache.pooled.dim(), (2, FEATURE_WIDTH));

        let mut slots: Vec<DenseSlots> = backbone.layers.iter().map(DenseSlots::for_layer).collect();
        let mut adam = Adam::new(0.01);
        adam.begin_step();
        backbone.backward(&cache, &Array2::ones((2, FEATURE_WIDTH)), &adam, &mut slots);

        assert_eq!(backbone.layers[0], before.layers[0]);
        assert_eq!(backbone.layers[1], before.layers[1]);
        assert_ne!(backbone.layers[2], before.layers[2]);
    }
}
