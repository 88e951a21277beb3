//! Restructure command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use fishfresh_training::{relocate_stray_images, Split, Taxonomy, TrainingConfig};

pub fn execute(config: &TrainingConfig) -> Result<()> {
    let freshness = Taxonomy::new(config.freshness_classes.clone()).context("Invalid freshness classes")?;
    println!("{}", "Moving unlabeled species images into 'unknown/'...".bold().cyan());

    let report = relocate_stray_images(&config.data_root, &Split::ALL, &freshness, &config.extensions)
        .with_context(|| format!("Failed to restructure {}", config.data_root.display()))?;

    for skipped in &report.skipped {
        println!("  {} {}", "[skip]".dimmed(), skipped.display());
    }
    for moved in &report.moved {
        println!("  {} -> {}", moved.from.display().to_string().dimmed(), moved.to.display());
    }

    if report.moved.is_empty() {
        println!("{}", "✓ Nothing to move".green().bold());
    } else {
        println!("{}", format!("✓ Moved {} images", report.moved.len()).green().bold());
    }
    Ok(())
}
