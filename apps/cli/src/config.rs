//! CLI configuration loading and merging.

use anyhow::{Context, Result};
use clap::Args;
use fishfresh_training::TrainingConfig;
use std::path::{Path, PathBuf};

/// Directory flags shared by the commands.
#[derive(Args, Debug, Clone, Default)]
pub struct PathOverrides {
    /// Dataset root containing the split folders
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Directory for the checkpoint, taxonomy record and manifest
    #[arg(long)]
    pub models_dir: Option<PathBuf>,
}

/// Load and merge training configuration.
///
/// Configuration precedence:
/// 1. CLI arguments
/// 2. Config file (`--config`, else ./fishfresh.toml)
/// 3. Defaults
pub fn load_config(explicit: Option<&Path>, overrides: &PathOverrides) -> Result<TrainingConfig> {
    let mut config = TrainingConfig::discover_and_load(explicit).with_context(|| match explicit {
        Some(path) => format!("Failed to load config {}", path.display()),
        None => "Failed to load training config".to_string(),
    })?;
    apply_overrides(&mut config, overrides);
    config.validate().context("Invalid training config")?;
    Ok(config)
}

fn apply_overrides(config: &mut TrainingConfig, overrides: &PathOverrides) {
    if let Some(data_root) = &overrides.data_root {
        config.data_root.clone_from(data_root);
    }
    if let Some(models_dir) = &overrides.models_dir {
        config.models_dir.clone_from(models_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_override_file_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.toml");
        std::fs::write(&path, "data_root = \"from-file\"\nmodels_dir = \"file-models\"\nbatch_size = 4\n").unwrap();

        let overrides = PathOverrides { data_root: Some(PathBuf::from("from-flag")), models_dir: None };
        let config = load_config(Some(&path), &overrides).unwrap();

        assert_eq!(config.data_root, PathBuf::from("from-flag"));
        assert_eq!(config.models_dir, PathBuf::from("file-models"));
        assert_eq!(config.batch_size, 4);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = load_config(Some(&temp.path().join("nope.toml")), &PathOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to load config"));
    }
}
