//! One-off corpus cleanup: images dropped directly into a freshness folder
//! have no species, so they are moved into its `unknown/` folder.

use crate::dataset::is_allowed_extension;
use crate::error::TrainingResult;
use crate::layout::Split;
use crate::taxonomy::{Taxonomy, UNKNOWN_SPECIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedImage {
    pub from: PathBuf,
    pub to: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestructureReport {
    pub moved: Vec<MovedImage>,
    /// Split or freshness directories that did not exist.
    pub skipped: Vec<PathBuf>,
}

/// First free name in `dir` for `file_name`, appending `_1`, `_2`, ... to the stem.
fn free_target(dir: &Path, file_name: &Path) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = file_name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let suffix = file_name.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
    (1..)
        .map(|i| dir.join(format!("{stem}_{i}{suffix}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

pub fn relocate_stray_images(
    data_root: &Path,
    splits: &[Split],
    freshness: &Taxonomy,
    extensions: &[String],
) -> TrainingResult<RestructureReport> {
    let mut report = RestructureReport::default();

    for split in splits {
        let split_dir = data_root.join(split.dir_name());
        if !split_dir.is_dir() {
            debug!(path = %split_dir.display(), "split not found; skipping");
            report.skipped.push(split_dir);
            continue;
        }

        for class in freshness.names() {
            let class_dir = split_dir.join(class);
            if !class_dir.is_dir() {
                debug!(path = %class_dir.display(), "freshness folder not found; skipping");
                report.skipped.push(class_dir);
                continue;
            }

            let mut strays: Vec<PathBuf> = std::fs::read_dir(&class_dir)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_allowed_extension(path, extensions))
                .collect();
            if strays.is_empty() {
                continue;
            }
            strays.sort();

            let unknown_dir = class_dir.join(UNKNOWN_SPECIES);
            std::fs::create_dir_all(&unknown_dir)?;
            for from in strays {
                let Some(file_name) = from.file_name().map(PathBuf::from) else {
                    continue;
                };
                let to = free_target(&unknown_dir, &file_name);
                std::fs::rename(&from, &to)?;
                debug!(from = %from.display(), to = %to.display(), "moved stray image");
                report.moved.push(MovedImage { from, to });
            }
        }
    }

    info!(moved = report.moved.len(), skipped = report.skipped.len(), "restructure complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["jpg".to_string(), "png".to_string()]
    }

    #[test]
    fn test_moves_strays_with_collision_rename() {
        let temp = TempDir::new().unwrap();
        let fresh = temp.path().join("train").join("fresh");
        std::fs::create_dir_all(fresh.join("unknown")).unwrap();
        std::fs::create_dir_all(fresh.join("tilapia")).unwrap();
        std::fs::write(fresh.join("unknown").join("a.JPG"), b"old").unwrap();
        std::fs::write(fresh.join("a.JPG"), b"new").unwrap();
        std::fs::write(fresh.join("b.png"), b"b").unwrap();
        std::fs::write(fresh.join("notes.txt"), b"keep").unwrap();
        std::fs::write(fresh.join("tilapia").join("c.jpg"), b"c").unwrap();

        let freshness = Taxonomy::from_names(["fresh", "not_fresh"]).unwrap();
        let report = relocate_stray_images(temp.path(), &[Split::Train], &freshness, &extensions()).unwrap();

        assert_eq!(report.moved.len(), 2);
        assert_eq!(std::fs::read(fresh.join("unknown").join("a_1.JPG")).unwrap(), b"new");
        assert_eq!(std::fs::read(fresh.join("unknown").join("a.JPG")).unwrap(), b"old");
        assert!(fresh.join("unknown").join("b.png").exists());
        assert!(fresh.join("notes.txt").exists());
        assert!(fresh.join("tilapia").join("c.jpg").exists());
        assert_eq!(report.skipped, vec![temp.path().join("train").join("not_fresh")]);
    }

    #[test]
    fn test_missing_split_is_skipped_and_no_unknown_created() {
        let temp = TempDir::new().unwrap();
        let fresh = temp.path().join("validation").join("fresh");
        std::fs::create_dir_all(fresh.join("bangus")).unwrap();

        let freshness = Taxonomy::from_names(["fresh"]).unwrap();
        let report =
            relocate_stray_images(temp.path(), &[Split::Train, Split::Validation], &freshness, &extensions()).unwrap();

        assert!(report.moved.is_empty());
        assert_eq!(report.skipped, vec![temp.path().join("train")]);
        assert!(!fresh.join("unknown").exists());
    }
}
