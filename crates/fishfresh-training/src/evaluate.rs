use crate::checkpoint::check_head_widths;
use crate::config::TrainingConfig;
use crate::controller::run_pass;
use crate::dataset::class_counts;
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{Split, TrainingLayout};
use crate::model::{CompileSpec, EpochMetrics, HeadLoss, ModelBackend, MultiTaskModel, Optimizer};
use crate::pipeline::{ImageDataset, PipelineOptions};
use crate::store::TaxonomyStore;
use crate::taxonomy::Taxonomy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Test-split scores of a saved checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub checkpoint: PathBuf,
    pub samples: usize,
    pub metrics: EpochMetrics,
    pub freshness_classes: Vec<String>,
    pub species_classes: Vec<String>,
    /// Test samples per freshness class, in taxonomy order.
    pub freshness_support: Vec<usize>,
    pub species_support: Vec<usize>,
}

/// Losses reported without smoothing so they are comparable across runs.
fn evaluation_compile_spec() -> CompileSpec {
    let loss = HeadLoss { label_smoothing: 0.0, weight: 1.0 };
    CompileSpec { optimizer: Optimizer::Adam { learning_rate: 0.0 }, freshness_loss: loss, species_loss: loss }
}

/// Score the checkpoint on the testing split under the stored taxonomy.
pub async fn evaluate_checkpoint<B: ModelBackend>(backend: &B, config: &TrainingConfig) -> TrainingResult<EvaluationReport> {
    config.validate()?;
    let layout = TrainingLayout::from_config(config);

    let store = TaxonomyStore::new(layout.labels_path());
    let record = store.load()?.ok_or_else(|| {
        TrainingError::InvalidSpec(format!("no taxonomy record at {}; train first", store.path().display()))
    })?;
    let freshness = Taxonomy::new(record.freshness_classes.clone())?;
    let species = Taxonomy::new(record.species_classes.clone())?;

    let checkpoint = layout.checkpoint_path();
    if !checkpoint.is_file() {
        return Err(TrainingError::InvalidSpec(format!("no checkpoint at {}; train first", checkpoint.display())));
    }

    let testing_dir = layout.split_dir(Split::Testing);
    let dataset = ImageDataset::from_split(
        &testing_dir,
        &freshness,
        &species,
        &config.extensions,
        PipelineOptions::evaluation(config),
    );
    if dataset.is_empty() {
        return Err(TrainingError::Dataset(format!("no images found in testing split under {}", testing_dir.display())));
    }

    let mut model = backend.load(&checkpoint)?;
    check_head_widths(&model, &checkpoint, &freshness, &species)?;
    let compile = evaluation_compile_spec();
    model.compile(&compile)?;

    let metrics = run_pass(&mut model, dataset.batches(0), false, &compile).await?;
    let (freshness_support, species_support) = class_counts(dataset.samples(), freshness.len(), species.len());
    info!(
        samples = dataset.len(),
        fresh_acc = metrics.freshness.accuracy,
        species_acc = metrics.species.accuracy,
        "evaluated checkpoint"
    );

    Ok(EvaluationReport {
        checkpoint,
        samples: dataset.len(),
        metrics,
        freshness_classes: record.freshness_classes,
        species_classes: record.species_classes,
        freshness_support,
        species_support,
    })
}
