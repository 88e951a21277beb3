//! Integration tests for the `fishfresh restructure` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_restructure_moves_stray_images() {
    let temp_dir = TempDir::new().unwrap();
    let fresh = temp_dir.path().join("datasets/train/fresh");
    fs::create_dir_all(fresh.join("bangus")).unwrap();
    fs::write(fresh.join("stray.jpg"), b"not decoded").unwrap();
    fs::write(fresh.join("notes.txt"), b"left alone").unwrap();

    let mut cmd = Command::cargo_bin("fishfresh").unwrap();
    cmd.current_dir(temp_dir.path())
        .arg("restructure")
        .assert()
        .success()
        .stdout(predicate::str::contains("Moved 1 images"));

    assert!(fresh.join("unknown/stray.jpg").exists());
    assert!(!fresh.join("stray.jpg").exists());
    assert!(fresh.join("notes.txt").exists());
}

#[test]
fn test_restructure_reports_missing_splits() {
    let temp_dir = TempDir::new().unwrap();

    let mut cmd = Command::cargo_bin("fishfresh").unwrap();
    cmd.current_dir(temp_dir.path())
        .args(["restructure", "--data-root", "absent"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[skip]"))
        .stdout(predicate::str::contains("Nothing to move"));
}
