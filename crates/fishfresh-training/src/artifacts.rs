use crate::callbacks::EpochLogs;
use crate::error::{TrainingError, TrainingResult};
use crate::state::TrainingState;
use crate::store::{TaxonomyRecord, TaxonomySource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier for one training invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Checkpoint,
    CheckpointMeta,
    TaxonomyRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

/// Outcome of one training stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub state: TrainingState,
    pub epochs_planned: u32,
    pub epochs_run: u32,
    pub stopped_early: bool,
    /// Stage-local epoch with the best monitored value.
    pub best_epoch: Option<u32>,
    pub best_value: Option<f64>,
    pub final_learning_rate: f64,
    pub checkpoints_saved: u32,
    #[serde(default)]
    pub history: Vec<EpochLogs>,
}

/// Summary of the last run, written next to the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub backend: String,
    pub taxonomy: TaxonomyRecord,
    pub taxonomy_source: TaxonomySource,
    pub states: Vec<TrainingState>,
    pub stages: Vec<StageReport>,
    pub best_val_freshness_accuracy: Option<f64>,
    pub artifacts: Vec<TrainingArtifact>,
}

pub fn sha256_file(path: &Path) -> TrainingResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> TrainingResult<TrainingArtifact> {
    if !path.exists() {
        return Err(TrainingError::Checkpoint(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path, sha256: hash })
}

/// Artifacts among `candidates` that exist on disk.
pub fn collect_artifacts(candidates: Vec<(ArtifactKind, PathBuf)>) -> TrainingResult<Vec<TrainingArtifact>> {
    candidates
        .into_iter()
        .filter(|(_, path)| path.exists())
        .map(|(kind, path)| make_artifact(kind, path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sha256_file_matches_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("labels.json");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_collect_artifacts_skips_missing() {
        let temp = TempDir::new().unwrap();
        let present = temp.path().join("model.ckpt");
        std::fs::write(&present, b"weights").unwrap();

        let artifacts = collect_artifacts(vec![
            (ArtifactKind::Checkpoint, present.clone()),
            (ArtifactKind::CheckpointMeta, temp.path().join("missing.json")),
        ])
        .unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].path, present);
        assert!(make_artifact(ArtifactKind::TaxonomyRecord, temp.path().join("nope")).is_err());
    }
}
