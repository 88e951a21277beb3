//! Fishfresh Training
//!
//! Backend-agnostic orchestration for the two-head (freshness + species)
//! image classifier:
//! - Discovering and persisting the label taxonomy (`TaxonomyStore`)
//! - Indexing the split directories and streaming decoded batches (`ImageDataset`)
//! - The model contract a backend implements (`ModelBackend`, `MultiTaskModel`)
//! - The two-stage training state machine and its callbacks (`TrainingController`)
//! - Checkpoint metadata, manifests and evaluation of a saved checkpoint

pub mod artifacts;
pub mod atomic;
pub mod callbacks;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod restructure;
pub mod state;
pub mod store;
pub mod taxonomy;

pub use artifacts::{ArtifactKind, RunId, StageReport, TrainingArtifact, TrainingManifest};
pub use callbacks::{EarlyStopping, EarlyStoppingDecision, EpochLogs, ModelCheckpoint, Monitor, ReduceLrOnPlateau};
pub use checkpoint::{check_head_widths, load_meta, save_checkpoint, CheckpointMeta};
pub use config::{StageConfig, TrainingConfig};
pub use controller::{PreparedData, TrainingController, TrainingReport};
pub use dataset::{list_samples, LabelBundle, Sample};
pub use error::{TrainingError, TrainingResult};
pub use evaluate::{evaluate_checkpoint, EvaluationReport};
pub use layout::{Split, TrainingLayout};
pub use model::{
    BackboneTrainability, CompileSpec, EpochMetrics, HeadMetrics, ModelBackend, ModelSpec, MultiTaskModel,
    Predictions, StepMetrics,
};
pub use pipeline::{Batch, BatchStream, ImageDataset, PipelineOptions};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, StdoutProgressSink, TracingProgressSink};
pub use restructure::{relocate_stray_images, RestructureReport};
pub use state::{TrainingState, TransitionGuards};
pub use store::{Reconciliation, TaxonomyRecord, TaxonomySource, TaxonomyStore};
pub use taxonomy::{discover_species, Taxonomy, UNKNOWN_SPECIES};
