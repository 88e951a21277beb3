//! Training command implementation.

use anyhow::{Context, Result};
use colored::Colorize;
use fishfresh_models::PatchProbeBackend;
use fishfresh_training::{
    ProgressSink, StdoutProgressSink, TaxonomySource, TracingProgressSink, TrainingConfig, TrainingController,
};
use serde_json::json;

pub async fn execute(config: TrainingConfig, json_output: bool) -> Result<()> {
    let controller = TrainingController::new(PatchProbeBackend, config).context("Failed to set up training")?;

    if !json_output {
        println!();
        println!("{}", "Training multi-task model".bold().cyan());
        println!("  Data:   {}", controller.layout().data_root().display().to_string().dimmed());
        println!("  Models: {}", controller.layout().models_dir().display().to_string().dimmed());
        println!();
    }

    // JSON mode keeps stdout parseable; progress goes through the log instead.
    let sink: &dyn ProgressSink = if json_output { &TracingProgressSink } else { &StdoutProgressSink };
    let report = controller.run(sink).await.context("Training failed")?;

    if json_output {
        let out = json!({
            "run_id": report.run_id,
            "states": report.states,
            "stages": report.stages,
            "taxonomy": report.taxonomy.record(),
            "taxonomy_source": report.taxonomy.source,
            "ignored_species": report.taxonomy.ignored_species,
            "best_val_freshness_accuracy": report.best_val_freshness_accuracy,
            "checkpoint_path": report.checkpoint_path,
            "manifest_path": report.manifest_path,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let states: Vec<String> = report.states.iter().map(ToString::to_string).collect();
    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Run:       {}", report.run_id.to_string().cyan());
    println!("  States:    {}", states.join(" -> "));
    println!("  Freshness: {}", report.taxonomy.freshness);
    let source = match report.taxonomy.source {
        TaxonomySource::Reused => "reused",
        TaxonomySource::Discovered => "discovered",
    };
    println!("  Species:   {} {}", report.taxonomy.species, format!("({source})").dimmed());
    if !report.taxonomy.ignored_species.is_empty() {
        println!(
            "  {}",
            format!("Ignored species not in stored taxonomy: {}", report.taxonomy.ignored_species.join(", ")).yellow()
        );
    }
    for stage in &report.stages {
        let stop = if stage.stopped_early { " (stopped early)".yellow().to_string() } else { String::new() };
        println!(
            "  {:<15} {}/{} epochs, {} checkpoint(s){}",
            stage.state.to_string(),
            stage.epochs_run,
            stage.epochs_planned,
            stage.checkpoints_saved,
            stop
        );
    }
    match report.best_val_freshness_accuracy {
        Some(best) => println!("  Best val_fresh_out_accuracy: {}", format!("{best:.4}").green()),
        None => println!("  {}", "No checkpoint was written".yellow()),
    }
    println!("  Checkpoint: {}", report.checkpoint_path.display().to_string().dimmed());
    println!("  Manifest:   {}", report.manifest_path.display().to_string().dimmed());
    println!();
    Ok(())
}
