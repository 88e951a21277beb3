//! Integration tests for the `fishfresh taxonomy` command.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn fishfresh(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("fishfresh").unwrap();
    cmd.current_dir(temp_dir.path());
    cmd
}

fn json_report(temp_dir: &TempDir) -> serde_json::Value {
    let output = fishfresh(temp_dir)
        .args(["--log-level", "error", "taxonomy", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).unwrap()
}

fn species_dirs(temp_dir: &TempDir, dirs: &[(&str, &str)]) {
    for (freshness, species) in dirs {
        fs::create_dir_all(temp_dir.path().join("datasets/train").join(freshness).join(species)).unwrap();
    }
}

#[test]
fn test_taxonomy_discovers_sorted_species() {
    let temp_dir = TempDir::new().unwrap();
    species_dirs(&temp_dir, &[("fresh", "tilapia"), ("not_fresh", "bangus"), ("borderline", "tilapia")]);

    fishfresh(&temp_dir)
        .arg("taxonomy")
        .assert()
        .success()
        .stdout(predicate::str::contains("Label taxonomy"))
        .stdout(predicate::str::contains("(none)"));

    let report = json_report(&temp_dir);
    assert_eq!(report["discovered_species"], serde_json::json!(["bangus", "tilapia"]));
    assert_eq!(report["source"], "discovered");
    assert!(report["stored"].is_null());
}

#[test]
fn test_taxonomy_prefers_stored_record() {
    let temp_dir = TempDir::new().unwrap();
    species_dirs(&temp_dir, &[("fresh", "alumahan"), ("fresh", "tilapia")]);
    let models = temp_dir.path().join("models");
    fs::create_dir_all(&models).unwrap();
    fs::write(
        models.join("multitask_labels.json"),
        r#"{"freshness_classes": ["borderline", "fresh", "not_fresh"], "species_classes": ["tilapia", "bangus"]}"#,
    )
    .unwrap();

    let report = json_report(&temp_dir);

    assert_eq!(report["agreed_species"], serde_json::json!(["tilapia", "bangus"]));
    assert_eq!(report["source"], "reused");
    assert_eq!(report["ignored_species"], serde_json::json!(["alumahan"]));
}

#[test]
fn test_taxonomy_custom_models_dir() {
    let temp_dir = TempDir::new().unwrap();
    species_dirs(&temp_dir, &[("fresh", "bangus")]);

    fishfresh(&temp_dir)
        .args(["taxonomy", "--models-dir", "elsewhere"])
        .assert()
        .success()
        .stdout(predicate::str::contains("elsewhere"));
}
