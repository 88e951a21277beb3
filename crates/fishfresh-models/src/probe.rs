use crate::augment::augment_batch;
use crate::backbone::{PatchBackbone, FEATURE_WIDTH};
use crate::layers::{relu, relu_backward, softmax, Adam, DenseLayer, DenseSlots};
use fishfresh_training::model::{
    score_predictions, BackboneTrainability, CompileSpec, ModelSpec, Optimizer, Predictions, StepMetrics,
};
use fishfresh_training::{Batch, ModelBackend, MultiTaskModel, TrainingError, TrainingResult};
use ndarray::{Array2, Array4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

pub const BACKEND_ID: &str = "patch-probe";
const FORMAT_VERSION: u32 = 1;

/// Every learned parameter of the probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeWeights {
    pub backbone: PatchBackbone,
    pub dense: DenseLayer,
    pub freshness: DenseLayer,
    pub species: DenseLayer,
}

/// Checkpoint file contents.
#[derive(Debug, Serialize, Deserialize)]
struct SavedProbe {
    format_version: u32,
    backend: String,
    spec: ModelSpec,
    weights: ProbeWeights,
    compile: Option<CompileSpec>,
}

struct AdamState {
    adam: Adam,
    backbone: Vec<DenseSlots>,
    dense: DenseSlots,
    freshness: DenseSlots,
    species: DenseSlots,
}

impl AdamState {
    fn new(learning_rate: f64, weights: &ProbeWeights) -> Self {
        Self {
            adam: Adam::new(learning_rate),
            backbone: weights.backbone.layers.iter().map(DenseSlots::for_layer).collect(),
            dense: DenseSlots::for_layer(&weights.dense),
            freshness: DenseSlots::for_layer(&weights.freshness),
            species: DenseSlots::for_layer(&weights.species),
        }
    }
}

/// Dropout mask scaled so the expected activation is unchanged.
fn dropout_mask<R: Rng>(rows: usize, cols: usize, rate: f32, rng: &mut R) -> Array2<f32> {
    if rate <= 0.0 {
        return Array2::ones((rows, cols));
    }
    let keep = 1.0 - rate;
    Array2::from_shape_fn((rows, cols), |_| if rng.gen_bool(f64::from(keep)) { 1.0 / keep } else { 0.0 })
}

fn smoothed(targets: &Array2<f32>, smoothing: f32) -> Array2<f32> {
    let classes = targets.ncols() as f32;
    targets.mapv(|t| t * (1.0 - smoothing) + smoothing / classes)
}

/// Reference two-head classifier trained with plain ndarray math.
pub struct PatchProbeModel {
    spec: ModelSpec,
    weights: ProbeWeights,
    compile: Option<CompileSpec>,
    optimizer: Option<AdamState>,
    rng: StdRng,
}

impl PatchProbeModel {
    pub fn new(spec: ModelSpec) -> TrainingResult<Self> {
        spec.validate()?;
        let mut rng = StdRng::seed_from_u64(spec.seed);
        let weights = ProbeWeights {
            backbone: PatchBackbone::new(spec.backbone.layers, &mut rng),
            dense: DenseLayer::glorot(FEATURE_WIDTH, spec.dense.units, &mut rng),
            freshness: DenseLayer::glorot(spec.dense.units, spec.freshness_head.classes, &mut rng),
            species: DenseLayer::glorot(spec.dense.units, spec.species_head.classes, &mut rng),
        };
        Ok(Self { spec, weights, compile: None, optimizer: None, rng })
    }

    #[must_use]
    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn load(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path)?;
        let saved: SavedProbe = serde_json::from_slice(&bytes)
            .map_err(|e| TrainingError::Checkpoint(format!("{} is not a probe checkpoint: {e}", path.display())))?;
        if saved.format_version != FORMAT_VERSION || saved.backend != BACKEND_ID {
            return Err(TrainingError::Checkpoint(format!(
                "unsupported checkpoint {} (backend {}, format {})",
                path.display(),
                saved.backend,
                saved.format_version
            )));
        }
        saved.spec.validate()?;

        let rng = StdRng::seed_from_u64(saved.spec.seed.wrapping_add(1));
        let mut model = Self { spec: saved.spec, weights: saved.weights, compile: None, optimizer: None, rng };
        if let Some(compile) = saved.compile {
            model.compile(&compile)?;
        }
        Ok(model)
    }

    fn check_images(&self, images: &Array4<f32>) -> TrainingResult<()> {
        let [height, width, channels] = self.spec.input_shape;
        let (_, h, w, c) = images.dim();
        if (h, w, c) != (height, width, channels) {
            return Err(TrainingError::Backend(format!(
                "batch shape [{h}, {w}, {c}] does not match model input {:?}",
                self.spec.input_shape
            )));
        }
        Ok(())
    }

    /// Input shape plus one-hot widths against the head sizes.
    fn check_batch(&self, batch: &Batch) -> TrainingResult<()> {
        self.check_images(&batch.images)?;
        let expected = self.head_classes();
        let got = (batch.freshness.ncols(), batch.species.ncols());
        if got != expected {
            return Err(TrainingError::Backend(format!(
                "label widths (freshness {}, species {}) do not match model heads (freshness {}, species {})",
                got.0, got.1, expected.0, expected.1
            )));
        }
        Ok(())
    }

    fn heads(&self, hidden: &Array2<f32>) -> Predictions {
        Predictions {
            freshness: softmax(&self.weights.freshness.forward(hidden.view())),
            species: softmax(&self.weights.species.forward(hidden.view())),
        }
    }

    fn compiled(&self) -> TrainingResult<CompileSpec> {
        self.compile.ok_or_else(|| TrainingError::Backend("model used before compile".to_string()))
    }
}

impl MultiTaskModel for PatchProbeModel {
    type Weights = ProbeWeights;

    fn compile(&mut self, spec: &CompileSpec) -> TrainingResult<()> {
        let learning_rate = spec.learning_rate();
        if !learning_rate.is_finite() || learning_rate < 0.0 {
            return Err(TrainingError::Backend(format!("invalid learning rate {learning_rate}")));
        }
        self.compile = Some(*spec);
        self.optimizer = Some(AdamState::new(learning_rate, &self.weights));
        debug!(learning_rate, "compiled patch probe");
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.as_ref().map_or(0.0, |o| o.adam.learning_rate)
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.adam.learning_rate = learning_rate;
        }
    }

    fn train_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics> {
        self.check_batch(batch)?;
        let compile = self.compiled()?;
        let n = batch.len();
        if n == 0 {
            return Ok(StepMetrics::default());
        }

        let images = augment_batch(&batch.images, &self.spec.augmentation, &mut self.rng);
        let cache = self.weights.backbone.forward(&images);

        let mask_in = dropout_mask(n, FEATURE_WIDTH, self.spec.dense.dropout_in, &mut self.rng);
        let pooled = &cache.pooled * &mask_in;
        let pre_dense = self.weights.dense.forward(pooled.view());
        let mask_out = dropout_mask(n, self.spec.dense.units, self.spec.dense.dropout_out, &mut self.rng);
        let hidden = relu(&pre_dense) * &mask_out;
        let predictions = self.heads(&hidden);
        let metrics = score_predictions(&predictions, batch, &compile);

        // d(mean loss)/d(logits) for softmax + cross-entropy
        let scale = 1.0 / n as f32;
        let grad_fresh = (&predictions.freshness - &smoothed(&batch.freshness, compile.freshness_loss.label_smoothing))
            * (scale * compile.freshness_loss.weight);
        let grad_species = (&predictions.species - &smoothed(&batch.species, compile.species_loss.label_smoothing))
            * (scale * compile.species_loss.weight);

        let fresh_grads = self.weights.freshness.gradients(hidden.view(), grad_fresh.view());
        let species_grads = self.weights.species.gradients(hidden.view(), grad_species.view());
        let mut grad_hidden =
            self.weights.freshness.backward_input(grad_fresh.view()) + self.weights.species.backward_input(grad_species.view());
        grad_hidden *= &mask_out;
        relu_backward(&mut grad_hidden, &pre_dense);

        let mut dense_grads = self.weights.dense.gradients(pooled.view(), grad_hidden.view());
        let l2 = self.spec.dense.l2;
        dense_grads.kernel.zip_mut_with(&self.weights.dense.kernel, |g, &w| *g += 2.0 * l2 * w);
        let grad_pooled = self.weights.dense.backward_input(grad_hidden.view()) * &mask_in;

        let Some(optimizer) = self.optimizer.as_mut() else {
            return Err(TrainingError::Backend("model used before compile".to_string()));
        };
        optimizer.adam.begin_step();
        let adam = optimizer.adam;
        optimizer.freshness.apply(&adam, &mut self.weights.freshness, &fresh_grads);
        optimizer.species.apply(&adam, &mut self.weights.species, &species_grads);
        optimizer.dense.apply(&adam, &mut self.weights.dense, &dense_grads);
        self.weights.backbone.backward(&cache, &grad_pooled, &adam, &mut optimizer.backbone);

        Ok(metrics)
    }

    fn eval_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics> {
        self.check_batch(batch)?;
        let compile = self.compiled()?;
        let predictions = self.predict(&batch.images)?;
        Ok(score_predictions(&predictions, batch, &compile))
    }

    fn predict(&self, images: &Array4<f32>) -> TrainingResult<Predictions> {
        self.check_images(images)?;
        let cache = self.weights.backbone.forward(images);
        let hidden = relu(&self.weights.dense.forward(cache.pooled.view()));
        Ok(self.heads(&hidden))
    }

    fn weights(&self) -> ProbeWeights {
        self.weights.clone()
    }

    fn set_weights(&mut self, weights: ProbeWeights) {
        self.weights = weights;
    }

    fn head_classes(&self) -> (usize, usize) {
        (self.spec.freshness_head.classes, self.spec.species_head.classes)
    }

    fn backbone_layers(&self) -> Option<usize> {
        Some(self.weights.backbone.depth())
    }

    fn backbone_trainability(&self) -> Option<BackboneTrainability> {
        Some(self.weights.backbone.trainability())
    }

    fn set_backbone_trainability(&mut self, trainability: BackboneTrainability) -> TrainingResult<()> {
        self.weights.backbone.set_trainability(trainability)?;
        debug!(?trainability, "backbone trainability changed");
        Ok(())
    }

    fn save(&self, path: &Path) -> TrainingResult<()> {
        let saved = SavedProbe {
            format_version: FORMAT_VERSION,
            backend: BACKEND_ID.to_string(),
            spec: self.spec.clone(),
            weights: self.weights.clone(),
            // keep any plateau-reduced rate
            compile: self
                .compile
                .map(|c| CompileSpec { optimizer: Optimizer::Adam { learning_rate: self.learning_rate() }, ..c }),
        };
        std::fs::write(path, serde_json::to_vec(&saved)?)?;
        Ok(())
    }
}

/// Builds and loads [`PatchProbeModel`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatchProbeBackend;

impl ModelBackend for PatchProbeBackend {
    type Model = PatchProbeModel;

    fn id(&self) -> &'static str {
        BACKEND_ID
    }

    fn build(&self, spec: &ModelSpec) -> TrainingResult<PatchProbeModel> {
        PatchProbeModel::new(spec.clone())
    }

    fn load(&self, path: &Path) -> TrainingResult<PatchProbeModel> {
        PatchProbeModel::load(path)
    }
}
