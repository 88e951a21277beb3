//! Write-then-rename helpers for files the controller shares with readers.

use crate::error::TrainingResult;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Sibling path used while a file is being written.
///
/// Lives in the same directory so the final rename never crosses filesystems.
#[must_use]
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

/// Write `bytes` to `path` through a temporary sibling and a rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> TrainingResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let temp_path = temp_path_for(path);
    let written = std::fs::write(&temp_path, bytes).and_then(|()| std::fs::rename(&temp_path, path));
    if let Err(err) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err.into());
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Run `write` against a temporary path, then rename the result over `path`.
///
/// Used for artifacts whose bytes are produced by a collaborator (model saves).
pub fn replace_with<F>(path: &Path, write: F) -> TrainingResult<()>
where
    F: FnOnce(&Path) -> TrainingResult<()>,
{
    let temp_path = temp_path_for(path);
    if let Err(err) = write(&temp_path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(err.into());
    }
    Ok(())
}
