//! Taxonomy inspection command.
//!
//! Read-only: shows what a training run would agree on without writing the
//! record.

use anyhow::{Context, Result};
use colored::Colorize;
use fishfresh_training::store::reconcile;
use fishfresh_training::{discover_species, Split, Taxonomy, TaxonomyStore, TrainingConfig, TrainingLayout};
use serde_json::json;

pub fn execute(config: &TrainingConfig, json_output: bool) -> Result<()> {
    let layout = TrainingLayout::from_config(config);
    let freshness = Taxonomy::new(config.freshness_classes.clone()).context("Invalid freshness classes")?;
    let discovered = discover_species(&layout.split_dir(Split::Train), &freshness);
    let store = TaxonomyStore::new(layout.labels_path());
    let stored = store.load().with_context(|| format!("Failed to read {}", store.path().display()))?;
    let agreed = reconcile(stored.as_ref(), &freshness, discovered.clone());

    if json_output {
        let out = json!({
            "freshness_classes": freshness.names(),
            "discovered_species": discovered.names(),
            "stored": stored,
            "agreed_species": agreed.species.names(),
            "source": agreed.source,
            "ignored_species": agreed.ignored_species,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Label taxonomy".bold().cyan());
    println!("  Record:     {}", store.path().display().to_string().dimmed());
    println!("  Freshness:  {}", freshness);
    println!("  Discovered: {}", discovered);
    match &stored {
        Some(record) => println!("  Stored:     [{}]", record.species_classes.join(", ")),
        None => println!("  Stored:     {}", "(none)".dimmed()),
    }
    println!("  Agreed:     {}", agreed.species.to_string().green());
    if agreed.replaced_prior {
        println!("  {}", "Stored freshness ordering differs; the next run will replace the record.".yellow());
    }
    if !agreed.ignored_species.is_empty() {
        println!("  {}", format!("Ignored: {}", agreed.ignored_species.join(", ")).yellow());
    }
    println!();
    Ok(())
}
