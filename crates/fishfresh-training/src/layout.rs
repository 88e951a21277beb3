use crate::config::TrainingConfig;
use crate::error::TrainingResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A corpus split directory under the data root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Validation,
    Testing,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Testing];

    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Testing => "testing",
        }
    }
}

impl std::fmt::Display for Split {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Filesystem layout for the corpus and the training artifacts.
///
/// Corpus: `<data_root>/<split>/<freshness>/<species>/<image>`.
/// Artifacts: `<models_dir>/{checkpoint, checkpoint.meta.json, labels, training_manifest.json}`.
#[derive(Debug, Clone)]
pub struct TrainingLayout {
    data_root: PathBuf,
    models_dir: PathBuf,
    checkpoint_name: String,
    labels_name: String,
}

impl TrainingLayout {
    #[must_use]
    pub fn new(data_root: PathBuf, models_dir: PathBuf) -> Self {
        let defaults = TrainingConfig::default();
        Self {
            data_root,
            models_dir,
            checkpoint_name: defaults.checkpoint_name,
            labels_name: defaults.labels_name,
        }
    }

    #[must_use]
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            models_dir: config.models_dir.clone(),
            checkpoint_name: config.checkpoint_name.clone(),
            labels_name: config.labels_name.clone(),
        }
    }

    #[must_use]
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    #[must_use]
    pub fn split_dir(&self, split: Split) -> PathBuf {
        self.data_root.join(split.dir_name())
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.models_dir.join(&self.checkpoint_name)
    }

    #[must_use]
    pub fn checkpoint_meta_path(&self) -> PathBuf {
        self.models_dir.join(format!("{}.meta.json", self.checkpoint_name))
    }

    #[must_use]
    pub fn labels_path(&self) -> PathBuf {
        self.models_dir.join(&self.labels_name)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.models_dir.join("training_manifest.json")
    }

    pub fn ensure_models_dir(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.models_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let temp = TempDir::new().unwrap();
        let layout = TrainingLayout::new(temp.path().join("datasets"), temp.path().join("models"));

        assert!(layout.split_dir(Split::Validation).ends_with("datasets/validation"));
        assert!(layout.checkpoint_path().ends_with("models/multitask_probe.ckpt"));
        assert!(layout.checkpoint_meta_path().ends_with("models/multitask_probe.ckpt.meta.json"));
        assert!(layout.labels_path().ends_with("models/multitask_labels.json"));

        layout.ensure_models_dir().unwrap();
        assert!(layout.models_dir().is_dir());
    }
}
