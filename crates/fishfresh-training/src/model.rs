//! Model assembly and the contract a training backend implements.
//!
//! The orchestrator never touches tensors beyond the batch boundary: a backend
//! builds a [`MultiTaskModel`] from a [`ModelSpec`], and the controller drives
//! it through compile, train/eval steps, weight snapshots, backbone toggles and
//! save/load.

use crate::config::{StageConfig, TrainingConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::pipeline::Batch;
use crate::taxonomy::Taxonomy;
use ndarray::{Array2, Array4, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const FRESHNESS_OUTPUT: &str = "fresh_out";
pub const SPECIES_OUTPUT: &str = "species_out";

/// Random train-time perturbations; the stage is the identity at inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AugmentationSpec {
    pub horizontal_flip: bool,
    /// Max rotation as a fraction of a full turn.
    pub rotation: f32,
    pub zoom: f32,
    pub translate_height: f32,
    pub translate_width: f32,
    pub brightness: f32,
    pub contrast: f32,
}

impl Default for AugmentationSpec {
    fn default() -> Self {
        Self {
            horizontal_flip: true,
            rotation: 0.10,
            zoom: 0.10,
            translate_height: 0.10,
            translate_width: 0.10,
            brightness: 0.10,
            contrast: 0.10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneSpec {
    pub name: String,
    pub layers: usize,
}

/// Shared block between pooling and the heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseBlockSpec {
    pub dropout_in: f32,
    pub units: usize,
    pub l2: f32,
    pub dropout_out: f32,
}

impl Default for DenseBlockSpec {
    fn default() -> Self {
        Self { dropout_in: 0.5, units: 128, l2: 1e-4, dropout_out: 0.4 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadSpec {
    pub name: String,
    pub classes: usize,
}

/// input → augmentation → backbone → global average pooling → dense block →
/// {`fresh_out`, `species_out`} softmax heads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// `[height, width, channels]`.
    pub input_shape: [usize; 3],
    pub augmentation: AugmentationSpec,
    pub backbone: BackboneSpec,
    pub dense: DenseBlockSpec,
    pub freshness_head: HeadSpec,
    pub species_head: HeadSpec,
    pub seed: u64,
}

impl ModelSpec {
    #[must_use]
    pub fn assemble(freshness: &Taxonomy, species: &Taxonomy, config: &TrainingConfig) -> Self {
        let [height, width] = config.image_size;
        Self {
            input_shape: [height as usize, width as usize, 3],
            augmentation: AugmentationSpec::default(),
            backbone: BackboneSpec { name: config.backbone.name.clone(), layers: config.backbone.layers },
            dense: DenseBlockSpec::default(),
            freshness_head: HeadSpec { name: FRESHNESS_OUTPUT.to_string(), classes: freshness.len() },
            species_head: HeadSpec { name: SPECIES_OUTPUT.to_string(), classes: species.len() },
            seed: config.seed,
        }
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.input_shape.iter().any(|d| *d == 0) || self.input_shape[2] != 3 {
            return Err(TrainingError::InvalidSpec(format!("unsupported input shape {:?}", self.input_shape)));
        }
        if self.freshness_head.classes == 0 || self.species_head.classes == 0 {
            return Err(TrainingError::InvalidSpec("heads need at least one class".to_string()));
        }
        if self.backbone.layers == 0 || self.dense.units == 0 {
            return Err(TrainingError::InvalidSpec("backbone and dense block must be non-empty".to_string()));
        }
        for rate in [self.dense.dropout_in, self.dense.dropout_out] {
            if !(0.0..1.0).contains(&rate) {
                return Err(TrainingError::InvalidSpec(format!("dropout {rate} must be in [0, 1)")));
            }
        }
        Ok(())
    }
}

/// Which backbone layers receive gradient updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneTrainability {
    Frozen,
    /// The trailing `last` layers train, the rest stay frozen.
    PartiallyUnfrozen { last: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Optimizer {
    Adam { learning_rate: f64 },
}

/// Categorical cross-entropy for one head.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadLoss {
    pub label_smoothing: f32,
    pub weight: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub optimizer: Optimizer,
    pub freshness_loss: HeadLoss,
    pub species_loss: HeadLoss,
}

impl CompileSpec {
    /// Adam plus smoothed cross-entropy on both heads, equally weighted.
    #[must_use]
    pub fn for_stage(stage: &StageConfig) -> Self {
        let loss = HeadLoss { label_smoothing: stage.label_smoothing, weight: 1.0 };
        Self {
            optimizer: Optimizer::Adam { learning_rate: stage.learning_rate },
            freshness_loss: loss,
            species_loss: loss,
        }
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        match self.optimizer {
            Optimizer::Adam { learning_rate } => learning_rate,
        }
    }
}

/// Softmax outputs, `[n, classes]` per head.
#[derive(Debug, Clone)]
pub struct Predictions {
    pub freshness: Array2<f32>,
    pub species: Array2<f32>,
}

/// Sums over the samples of one batch; folded into [`EpochMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepMetrics {
    pub samples: usize,
    pub freshness_loss_sum: f64,
    pub species_loss_sum: f64,
    pub freshness_correct: usize,
    pub species_correct: usize,
}

impl StepMetrics {
    pub fn merge(&mut self, other: &StepMetrics) {
        self.samples += other.samples;
        self.freshness_loss_sum += other.freshness_loss_sum;
        self.species_loss_sum += other.species_loss_sum;
        self.freshness_correct += other.freshness_correct;
        self.species_correct += other.species_correct;
    }

    /// Sample-weighted means. An empty pass yields NaN losses and zero accuracy.
    #[must_use]
    pub fn finish(&self, spec: &CompileSpec) -> EpochMetrics {
        let n = self.samples as f64;
        let freshness = HeadMetrics {
            loss: self.freshness_loss_sum / n,
            accuracy: if self.samples == 0 { 0.0 } else { self.freshness_correct as f64 / n },
        };
        let species = HeadMetrics {
            loss: self.species_loss_sum / n,
            accuracy: if self.samples == 0 { 0.0 } else { self.species_correct as f64 / n },
        };
        EpochMetrics {
            loss: f64::from(spec.freshness_loss.weight) * freshness.loss
                + f64::from(spec.species_loss.weight) * species.loss,
            freshness,
            species,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub freshness: HeadMetrics,
    pub species: HeadMetrics,
}

/// Smoothed categorical cross-entropy summed over rows, plus correct-prediction count.
#[must_use]
pub fn cross_entropy(probs: ArrayView2<'_, f32>, targets: ArrayView2<'_, f32>, label_smoothing: f32) -> (f64, usize) {
    const EPS: f32 = 1e-7;
    let classes = targets.len_of(Axis(1)) as f32;
    let mut loss = 0.0f64;
    let mut correct = 0;

    for (p_row, t_row) in probs.outer_iter().zip(targets.outer_iter()) {
        for (&p, &t) in p_row.iter().zip(t_row.iter()) {
            let smoothed = t * (1.0 - label_smoothing) + label_smoothing / classes;
            loss -= f64::from(smoothed) * f64::from(p.clamp(EPS, 1.0 - EPS).ln());
        }
        if crate::dataset::argmax(p_row) == crate::dataset::argmax(t_row) {
            correct += 1;
        }
    }
    (loss, correct)
}

/// Score predictions against a batch with the compiled losses.
#[must_use]
pub fn score_predictions(predictions: &Predictions, batch: &Batch, spec: &CompileSpec) -> StepMetrics {
    let (freshness_loss_sum, freshness_correct) =
        cross_entropy(predictions.freshness.view(), batch.freshness.view(), spec.freshness_loss.label_smoothing);
    let (species_loss_sum, species_correct) =
        cross_entropy(predictions.species.view(), batch.species.view(), spec.species_loss.label_smoothing);
    StepMetrics {
        samples: batch.len(),
        freshness_loss_sum,
        species_loss_sum,
        freshness_correct,
        species_correct,
    }
}

/// A compiled, trainable two-head model.
pub trait MultiTaskModel: Send {
    /// Full parameter snapshot, used to restore the best epoch.
    type Weights: Clone + Send;

    fn compile(&mut self, spec: &CompileSpec) -> TrainingResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    /// One optimizer update on `batch` (augmentation and dropout active).
    fn train_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics>;

    /// Inference-mode scoring of `batch` with the compiled losses.
    fn eval_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics>;

    fn predict(&self, images: &Array4<f32>) -> TrainingResult<Predictions>;

    fn weights(&self) -> Self::Weights;

    fn set_weights(&mut self, weights: Self::Weights);

    /// Output widths of the `(freshness, species)` heads.
    fn head_classes(&self) -> (usize, usize);

    /// Number of backbone layers, or `None` when the model has no backbone handle.
    fn backbone_layers(&self) -> Option<usize>;

    fn backbone_trainability(&self) -> Option<BackboneTrainability>;

    fn set_backbone_trainability(&mut self, trainability: BackboneTrainability) -> TrainingResult<()>;

    /// Write the full model state (spec, weights, trainable flags) to `path`.
    fn save(&self, path: &Path) -> TrainingResult<()>;
}

/// Builds and loads models of one implementation.
pub trait ModelBackend: Send + Sync {
    type Model: MultiTaskModel;

    fn id(&self) -> &'static str;

    fn build(&self, spec: &ModelSpec) -> TrainingResult<Self::Model>;

    fn load(&self, path: &Path) -> TrainingResult<Self::Model>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_assemble_sizes_heads_from_taxonomies() {
        let config = TrainingConfig { image_size: [32, 48], ..Default::default() };
        let freshness = Taxonomy::from_names(["borderline", "fresh", "not_fresh"]).unwrap();
        let species = Taxonomy::from_names(["bangus", "tilapia"]).unwrap();

        let spec = ModelSpec::assemble(&freshness, &species, &config);
        assert_eq!(spec.input_shape, [32, 48, 3]);
        assert_eq!(spec.freshness_head.classes, 3);
        assert_eq!(spec.freshness_head.name, "fresh_out");
        assert_eq!(spec.species_head.classes, 2);
        spec.validate().unwrap();
    }

    #[test]
    fn test_cross_entropy_with_smoothing() {
        let probs = array![[0.5f32, 0.5], [0.9, 0.1]];
        let targets = array![[1.0f32, 0.0], [0.0, 1.0]];

        let (loss, correct) = cross_entropy(probs.view(), targets.view(), 0.0);
        let expected = -(0.5f64.ln()) - (0.1f32 as f64).ln();
        assert!((loss - expected).abs() < 1e-5);
        assert_eq!(correct, 1);

        let (smoothed, _) = cross_entropy(probs.view(), targets.view(), 0.2);
        assert!(smoothed < loss);
    }

    #[test]
    fn test_step_metrics_finish_weights_by_samples() {
        let spec = CompileSpec::for_stage(&StageConfig::default());
        let mut total = StepMetrics::default();
        total.merge(&StepMetrics {
            samples: 3,
            freshness_loss_sum: 3.0,
            species_loss_sum: 1.5,
            freshness_correct: 3,
            species_correct: 0,
        });
        total.merge(&StepMetrics {
            samples: 1,
            freshness_loss_sum: 1.0,
            species_loss_sum: 0.5,
            freshness_correct: 0,
            species_correct: 1,
        });

        let metrics = total.finish(&spec);
        assert!((metrics.freshness.loss - 1.0).abs() < 1e-12);
        assert!((metrics.freshness.accuracy - 0.75).abs() < 1e-12);
        assert!((metrics.species.accuracy - 0.25).abs() < 1e-12);
        assert!((metrics.loss - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_trainability_serde_shape() {
        let json = serde_json::to_value(BackboneTrainability::PartiallyUnfrozen { last: 20 }).unwrap();
        assert_eq!(json, serde_json::json!({"partially_unfrozen": {"last": 20}}));
        let frozen: BackboneTrainability = serde_json::from_str("\"frozen\"").unwrap();
        assert_eq!(frozen, BackboneTrainability::Frozen);
    }
}
