//! Training configuration.
//!
//! Every knob the controller reads lives here and is passed in explicitly, so
//! several configurations can coexist in one process (and in tests).

use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Freshness grades in index order.
pub const DEFAULT_FRESHNESS_CLASSES: [&str; 3] = ["borderline", "fresh", "not_fresh"];

/// Image extensions accepted by the dataset builder (compared case-insensitively).
pub const DEFAULT_IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// Name of the config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "fishfresh.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub data_root: PathBuf,
    pub models_dir: PathBuf,
    pub checkpoint_name: String,
    pub labels_name: String,
    pub freshness_classes: Vec<String>,
    pub extensions: Vec<String>,
    /// `[height, width]` every image is resized to.
    pub image_size: [u32; 2],
    pub batch_size: usize,
    pub shuffle_buffer: usize,
    pub prefetch: usize,
    pub decode_workers: usize,
    pub seed: u64,
    pub resume: bool,
    pub head: StageConfig,
    pub finetune: FinetuneConfig,
    pub early_stopping: EarlyStoppingConfig,
    pub lr_plateau: PlateauConfig,
    pub backbone: BackboneConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("datasets"),
            models_dir: PathBuf::from("models"),
            checkpoint_name: "multitask_probe.ckpt".to_string(),
            labels_name: "multitask_labels.json".to_string(),
            freshness_classes: DEFAULT_FRESHNESS_CLASSES.iter().map(|s| (*s).to_string()).collect(),
            extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|s| (*s).to_string()).collect(),
            image_size: [224, 224],
            batch_size: 32,
            shuffle_buffer: 1000,
            prefetch: 2,
            decode_workers: 4,
            seed: 42,
            resume: true,
            head: StageConfig::default(),
            finetune: FinetuneConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
            lr_plateau: PlateauConfig::default(),
            backbone: BackboneConfig::default(),
        }
    }
}

/// Settings for the frozen-backbone stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub epochs: u32,
    pub learning_rate: f64,
    pub label_smoothing: f32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self { epochs: 25, learning_rate: 1e-4, label_smoothing: 0.1 }
    }
}

/// Settings for the partial fine-tune stage (also used when resuming).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuneConfig {
    pub epochs: u32,
    pub learning_rate: f64,
    pub label_smoothing: f32,
    /// Number of trailing backbone layers made trainable.
    pub unfreeze_last: usize,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self { epochs: 10, learning_rate: 1e-5, label_smoothing: 0.05, unfreeze_last: 20 }
    }
}

impl FinetuneConfig {
    #[must_use]
    pub fn as_stage(&self) -> StageConfig {
        StageConfig {
            epochs: self.epochs,
            learning_rate: self.learning_rate,
            label_smoothing: self.label_smoothing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub patience: u32,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self { patience: 6 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: u32,
    pub min_delta: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self { factor: 0.5, patience: 2, min_delta: 1e-4, min_lr: 1e-6 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub name: String,
    pub layers: usize,
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self { name: "patch_probe".to_string(), layers: 24 }
    }
}

impl TrainingConfig {
    /// Load configuration from a TOML file. Missing keys fall back to defaults.
    pub fn load_from_file(path: &Path) -> TrainingResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Use `explicit` when given, else `./fishfresh.toml` when present, else defaults.
    pub fn discover_and_load(explicit: Option<&Path>) -> TrainingResult<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            tracing::debug!(path = %local.display(), "loading local training config");
            return Self::load_from_file(&local);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> TrainingResult<()> {
        if self.freshness_classes.is_empty() {
            return Err(TrainingError::InvalidSpec("freshness_classes must not be empty".to_string()));
        }
        let unique: HashSet<&String> = self.freshness_classes.iter().collect();
        if unique.len() != self.freshness_classes.len() {
            return Err(TrainingError::InvalidSpec("freshness_classes must not repeat".to_string()));
        }
        if self.extensions.is_empty() {
            return Err(TrainingError::InvalidSpec("extensions must not be empty".to_string()));
        }
        if self.image_size[0] == 0 || self.image_size[1] == 0 {
            return Err(TrainingError::InvalidSpec("image_size must be >= 1 in both dimensions".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::InvalidSpec("batch_size must be >= 1".to_string()));
        }
        if self.decode_workers == 0 {
            return Err(TrainingError::InvalidSpec("decode_workers must be >= 1".to_string()));
        }
        if self.checkpoint_name.trim().is_empty() || self.labels_name.trim().is_empty() {
            return Err(TrainingError::InvalidSpec("checkpoint_name and labels_name are required".to_string()));
        }
        validate_stage("head", &self.head)?;
        validate_stage("finetune", &self.finetune.as_stage())?;
        let plateau = &self.lr_plateau;
        if !(plateau.factor > 0.0 && plateau.factor < 1.0) {
            return Err(TrainingError::InvalidSpec("lr_plateau.factor must be in (0, 1)".to_string()));
        }
        if !plateau.min_lr.is_finite() || plateau.min_lr < 0.0 {
            return Err(TrainingError::InvalidSpec("lr_plateau.min_lr must be >= 0".to_string()));
        }
        if self.backbone.layers == 0 {
            return Err(TrainingError::InvalidSpec("backbone.layers must be >= 1".to_string()));
        }
        Ok(())
    }
}

fn validate_stage(name: &str, stage: &StageConfig) -> TrainingResult<()> {
    if !stage.learning_rate.is_finite() || stage.learning_rate <= 0.0 {
        return Err(TrainingError::InvalidSpec(format!("{name}.learning_rate must be > 0")));
    }
    if !(0.0..1.0).contains(&stage.label_smoothing) {
        return Err(TrainingError::InvalidSpec(format!("{name}.label_smoothing must be in [0, 1)")));
    }
    Ok(())
}
