//! Checkpoint writes and the metadata sidecar stored next to them.
//!
//! The sidecar records the backbone's trainability at save time so a resumed
//! run can restore it without inspecting layer names.

use crate::atomic::{replace_with, write_json_atomic};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::TrainingLayout;
use crate::model::{BackboneTrainability, MultiTaskModel};
use crate::state::TrainingState;
use crate::taxonomy::Taxonomy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub backend: String,
    pub stage: TrainingState,
    /// Run-wide epoch that produced the checkpoint.
    pub epoch: u32,
    pub monitor: String,
    pub best_value: f64,
    /// `None` when the model has no backbone handle.
    pub backbone: Option<BackboneTrainability>,
    pub saved_at: DateTime<Utc>,
}

/// Overwrite the checkpoint and its sidecar, each through a temp file.
pub fn save_checkpoint<M: MultiTaskModel>(
    model: &M,
    layout: &TrainingLayout,
    meta: &CheckpointMeta,
) -> TrainingResult<()> {
    layout.ensure_models_dir()?;
    replace_with(&layout.checkpoint_path(), |tmp| model.save(tmp))?;
    write_json_atomic(&layout.checkpoint_meta_path(), meta)
}

/// A loaded checkpoint only fits the taxonomy its heads were sized for.
pub fn check_head_widths<M: MultiTaskModel>(
    model: &M,
    path: &Path,
    freshness: &Taxonomy,
    species: &Taxonomy,
) -> TrainingResult<()> {
    let (fresh_out, species_out) = model.head_classes();
    if (fresh_out, species_out) != (freshness.len(), species.len()) {
        return Err(TrainingError::Checkpoint(format!(
            "{} has heads sized freshness {fresh_out} / species {species_out}, but the agreed taxonomy has {} / {}; \
             retrain without resume",
            path.display(),
            freshness.len(),
            species.len()
        )));
    }
    Ok(())
}

/// `None` when no sidecar exists (e.g. a checkpoint copied in by hand).
pub fn load_meta(path: &Path) -> TrainingResult<Option<CheckpointMeta>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}
