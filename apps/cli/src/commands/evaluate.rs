//! Evaluation command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use fishfresh_models::PatchProbeBackend;
use fishfresh_training::{evaluate_checkpoint, TrainingConfig};

pub async fn execute(config: TrainingConfig, json_output: bool) -> Result<()> {
    let report = evaluate_checkpoint(&PatchProbeBackend, &config).await.context("Evaluation failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("{}", "Test split evaluation".bold().cyan());
    println!("  Checkpoint: {}", report.checkpoint.display().to_string().dimmed());
    println!("  Samples:    {}", report.samples);
    println!();
    println!("{:<12} {:>10} {:>10}", "Head", "Loss", "Accuracy");
    println!("{}", "─".repeat(34));
    for (name, head) in [("freshness", report.metrics.freshness), ("species", report.metrics.species)] {
        println!("{:<12} {:>10.4} {:>10}", name, head.loss, format!("{:.4}", head.accuracy).green());
    }
    println!();

    println!("{}", "Support".bold());
    for (name, count) in report.freshness_classes.iter().zip(&report.freshness_support) {
        println!("  {:<20} {}", name, count);
    }
    for (name, count) in report.species_classes.iter().zip(&report.species_support) {
        println!("  {:<20} {}", name.dimmed(), count);
    }
    println!();
    Ok(())
}
