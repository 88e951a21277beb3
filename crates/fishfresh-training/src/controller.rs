//! Two-stage training driver.
//!
//! The controller owns the run: it reconciles the taxonomy, builds the split
//! streams, walks the [`TrainingState`] machine and is the only writer of the
//! checkpoint, its sidecar and the run manifest.

use crate::artifacts::{collect_artifacts, ArtifactKind, RunId, StageReport, TrainingManifest};
use crate::atomic::write_json_atomic;
use crate::callbacks::{EarlyStopping, EarlyStoppingDecision, EpochLogs, ModelCheckpoint, Monitor, ReduceLrOnPlateau};
use crate::checkpoint::{check_head_widths, load_meta, save_checkpoint, CheckpointMeta};
use crate::config::{StageConfig, TrainingConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::{Split, TrainingLayout};
use crate::model::{BackboneTrainability, CompileSpec, EpochMetrics, ModelBackend, ModelSpec, MultiTaskModel, StepMetrics};
use crate::pipeline::{BatchStream, ImageDataset, PipelineOptions};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::state::{TrainingState, TransitionGuards};
use crate::store::{Reconciliation, TaxonomyStore};
use crate::taxonomy::{discover_species, Taxonomy};
use chrono::Utc;
use futures::StreamExt;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Taxonomy and split streams agreed for one run.
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub taxonomy: Reconciliation,
    pub train: ImageDataset,
    pub validation: ImageDataset,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub run_id: RunId,
    pub states: Vec<TrainingState>,
    pub stages: Vec<StageReport>,
    pub taxonomy: Reconciliation,
    /// Best monitored value the checkpoint on disk corresponds to.
    pub best_val_freshness_accuracy: Option<f64>,
    pub checkpoint_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Trainability recorded by the checkpoint being resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeBackbone {
    /// Sidecar present; `None` means the saved model had no backbone handle.
    Recorded(Option<BackboneTrainability>),
    /// No sidecar; ask the loaded model.
    Unknown,
}

pub struct TrainingController<B: ModelBackend> {
    backend: B,
    config: TrainingConfig,
    layout: TrainingLayout,
    freshness: Taxonomy,
}

impl<B: ModelBackend> TrainingController<B> {
    pub fn new(backend: B, config: TrainingConfig) -> TrainingResult<Self> {
        config.validate()?;
        let freshness = Taxonomy::new(config.freshness_classes.clone())?;
        let layout = TrainingLayout::from_config(&config);
        Ok(Self { backend, config, layout, freshness })
    }

    #[must_use]
    pub fn layout(&self) -> &TrainingLayout {
        &self.layout
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Rescan the train split, reconcile the species ordering with the stored
    /// record and index both training splits.
    pub fn prepare(&self) -> TrainingResult<PreparedData> {
        let train_dir = self.layout.split_dir(Split::Train);
        if !train_dir.is_dir() {
            return Err(TrainingError::Dataset(format!("train split not found: {}", train_dir.display())));
        }

        let discovered = discover_species(&train_dir, &self.freshness);
        let store = TaxonomyStore::new(self.layout.labels_path());
        let taxonomy = store.resolve(&self.freshness, discovered)?;
        info!(
            freshness = %taxonomy.freshness,
            species = %taxonomy.species,
            source = ?taxonomy.source,
            "taxonomy agreed"
        );

        let train = ImageDataset::from_split(
            &train_dir,
            &taxonomy.freshness,
            &taxonomy.species,
            &self.config.extensions,
            PipelineOptions::training(&self.config),
        );
        let validation = ImageDataset::from_split(
            &self.layout.split_dir(Split::Validation),
            &taxonomy.freshness,
            &taxonomy.species,
            &self.config.extensions,
            PipelineOptions::evaluation(&self.config),
        );

        for (split, dataset) in [(Split::Train, &train), (Split::Validation, &validation)] {
            if dataset.is_empty() {
                return Err(TrainingError::Dataset(format!(
                    "no images found in {} split under {}",
                    split,
                    self.layout.split_dir(split).display()
                )));
            }
            info!(split = %split, samples = dataset.len(), batches = dataset.num_batches(), "indexed split");
        }

        Ok(PreparedData { taxonomy, train, validation })
    }

    pub async fn run(&self, progress: &dyn ProgressSink) -> TrainingResult<TrainingReport> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        progress.on_event(ProgressEvent::Started { run_id: run_id.clone() });

        let data = self.prepare()?;

        let mut guards = TransitionGuards {
            checkpoint_exists: self.layout.checkpoint_path().is_file(),
            resume_enabled: self.config.resume,
            backbone_available: false,
        };
        if guards.checkpoint_exists && !guards.resume_enabled {
            warn!(path = %self.layout.checkpoint_path().display(), "resume disabled; existing checkpoint will be replaced");
        }

        let mut states = Vec::new();
        let mut state = TrainingState::entry(guards);
        self.enter(state, &run_id, &mut states, progress);

        let (mut model, resume_backbone, seeded_best) = if state == TrainingState::Resumed {
            self.load_for_resume(&data.taxonomy)?
        } else {
            let spec = ModelSpec::assemble(&data.taxonomy.freshness, &data.taxonomy.species, &self.config);
            spec.validate()?;
            let model = self.backend.build(&spec)?;
            (model, ResumeBackbone::Unknown, None)
        };
        guards.backbone_available = model.backbone_layers().is_some();

        if state == TrainingState::FreshStart {
            state = state.next(guards);
            self.enter(state, &run_id, &mut states, progress);
        }

        let mut checkpoint = ModelCheckpoint::new(Monitor::ValFreshnessAccuracy).with_best(seeded_best);
        let mut stages = Vec::new();
        let mut global_epoch = 0;

        while state.is_training() {
            let stage = self.configure_stage(state, &mut model, resume_backbone)?;
            let report = self
                .run_stage(state, &stage, &mut model, &data, &mut checkpoint, &mut global_epoch, &run_id, progress)
                .await?;
            stages.push(report);

            state = state.next(guards);
            self.enter(state, &run_id, &mut states, progress);
        }

        let manifest = TrainingManifest {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            backend: self.backend.id().to_string(),
            taxonomy: data.taxonomy.record(),
            taxonomy_source: data.taxonomy.source,
            states: states.clone(),
            stages: stages.clone(),
            best_val_freshness_accuracy: checkpoint.best(),
            artifacts: collect_artifacts(vec![
                (ArtifactKind::Checkpoint, self.layout.checkpoint_path()),
                (ArtifactKind::CheckpointMeta, self.layout.checkpoint_meta_path()),
                (ArtifactKind::TaxonomyRecord, self.layout.labels_path()),
            ])?,
        };
        let manifest_path = self.layout.manifest_path();
        self.layout.ensure_models_dir()?;
        write_json_atomic(&manifest_path, &manifest)?;

        progress.on_event(ProgressEvent::Finished { run_id: run_id.clone() });
        info!(run_id = %run_id, best = ?checkpoint.best(), "training finished");

        Ok(TrainingReport {
            run_id,
            states,
            stages,
            taxonomy: data.taxonomy,
            best_val_freshness_accuracy: checkpoint.best(),
            checkpoint_path: self.layout.checkpoint_path(),
            manifest_path,
        })
    }

    fn enter(&self, state: TrainingState, run_id: &RunId, states: &mut Vec<TrainingState>, progress: &dyn ProgressSink) {
        info!(state = %state, "entering state");
        states.push(state);
        progress.on_event(ProgressEvent::StateEntered { run_id: run_id.clone(), state });
    }

    fn load_for_resume(&self, taxonomy: &Reconciliation) -> TrainingResult<(B::Model, ResumeBackbone, Option<f64>)> {
        let path = self.layout.checkpoint_path();
        info!(path = %path.display(), "resuming from checkpoint");
        let model = self.backend.load(&path)?;
        check_head_widths(&model, &path, &taxonomy.freshness, &taxonomy.species)?;

        match load_meta(&self.layout.checkpoint_meta_path())? {
            Some(meta) => {
                if meta.backend != self.backend.id() {
                    warn!(saved = %meta.backend, current = self.backend.id(), "checkpoint was written by another backend");
                }
                Ok((model, ResumeBackbone::Recorded(meta.backbone), Some(meta.best_value)))
            }
            None => {
                warn!("checkpoint sidecar missing; best value resets and backbone state is read from the model");
                Ok((model, ResumeBackbone::Unknown, None))
            }
        }
    }

    /// Set backbone trainability for `state` and return the stage settings.
    fn configure_stage(
        &self,
        state: TrainingState,
        model: &mut B::Model,
        resume_backbone: ResumeBackbone,
    ) -> TrainingResult<StageConfig> {
        match state {
            TrainingState::StageHead => {
                if model.backbone_layers().is_some() {
                    model.set_backbone_trainability(BackboneTrainability::Frozen)?;
                }
                Ok(self.config.head.clone())
            }
            TrainingState::StageFinetune => {
                self.unfreeze_tail(model, self.config.finetune.unfreeze_last)?;
                Ok(self.config.finetune.as_stage())
            }
            TrainingState::Resumed => {
                let recorded = match resume_backbone {
                    ResumeBackbone::Recorded(recorded) => recorded,
                    ResumeBackbone::Unknown => model.backbone_trainability(),
                };
                match recorded {
                    Some(BackboneTrainability::PartiallyUnfrozen { last }) => self.unfreeze_tail(model, last)?,
                    Some(BackboneTrainability::Frozen) => {
                        self.unfreeze_tail(model, self.config.finetune.unfreeze_last)?;
                    }
                    None => warn!("backbone not identifiable in checkpoint; skipping unfreeze"),
                }
                Ok(self.config.finetune.as_stage())
            }
            TrainingState::FreshStart | TrainingState::Finished => {
                Err(TrainingError::InvalidSpec(format!("state {state} does not train")))
            }
        }
    }

    fn unfreeze_tail(&self, model: &mut B::Model, requested: usize) -> TrainingResult<()> {
        let Some(layers) = model.backbone_layers() else {
            warn!("model exposes no backbone; skipping unfreeze");
            return Ok(());
        };
        let last = requested.min(layers);
        model.set_backbone_trainability(BackboneTrainability::PartiallyUnfrozen { last })?;
        info!(last, layers, "unfroze trailing backbone layers");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        state: TrainingState,
        stage: &StageConfig,
        model: &mut B::Model,
        data: &PreparedData,
        checkpoint: &mut ModelCheckpoint,
        global_epoch: &mut u32,
        run_id: &RunId,
        progress: &dyn ProgressSink,
    ) -> TrainingResult<StageReport> {
        let compile = CompileSpec::for_stage(stage);
        model.compile(&compile)?;
        info!(
            state = %state,
            epochs = stage.epochs,
            learning_rate = stage.learning_rate,
            label_smoothing = stage.label_smoothing,
            "compiled model"
        );

        let mut early = EarlyStopping::new(Monitor::ValFreshnessAccuracy, self.config.early_stopping.patience);
        let mut plateau = ReduceLrOnPlateau::new(Monitor::ValFreshnessLoss, self.config.lr_plateau.clone());
        let mut best_weights = None;
        let mut report = StageReport {
            state,
            epochs_planned: stage.epochs,
            epochs_run: 0,
            stopped_early: false,
            best_epoch: None,
            best_value: None,
            final_learning_rate: model.learning_rate(),
            checkpoints_saved: 0,
            history: Vec::new(),
        };

        for stage_epoch in 1..=stage.epochs {
            *global_epoch += 1;
            let epoch = *global_epoch;
            let learning_rate = model.learning_rate();

            let train = run_pass(model, data.train.batches(u64::from(epoch)), true, &compile).await?;
            let val = run_pass(model, data.validation.batches(u64::from(epoch)), false, &compile).await?;
            let logs = EpochLogs { state, stage_epoch, epoch, train, val, learning_rate };
            report.epochs_run = stage_epoch;
            report.history.push(logs);
            progress.on_event(ProgressEvent::Epoch { run_id: run_id.clone(), epochs: stage.epochs, logs });

            if checkpoint.on_epoch_end(&logs) {
                let value = Monitor::ValFreshnessAccuracy.value(&logs);
                let meta = CheckpointMeta {
                    backend: self.backend.id().to_string(),
                    stage: state,
                    epoch,
                    monitor: checkpoint.monitor().name().to_string(),
                    best_value: value,
                    backbone: model.backbone_trainability(),
                    saved_at: Utc::now(),
                };
                save_checkpoint(model, &self.layout, &meta)?;
                report.checkpoints_saved += 1;
                info!(epoch, value, path = %self.layout.checkpoint_path().display(), "checkpoint saved");
                progress.on_event(ProgressEvent::CheckpointSaved { run_id: run_id.clone(), epoch, value });
            }

            match early.on_epoch_end(&logs) {
                EarlyStoppingDecision::Continue { improved } => {
                    if improved {
                        best_weights = Some(model.weights());
                    }
                }
                EarlyStoppingDecision::Stop => {
                    report.stopped_early = true;
                    if let Some(weights) = best_weights.take() {
                        model.set_weights(weights);
                    }
                    info!(state = %state, epoch = stage_epoch, best_epoch = ?early.best_epoch(), "early stopping");
                    progress.on_event(ProgressEvent::EarlyStopped {
                        run_id: run_id.clone(),
                        state,
                        epoch,
                        best_epoch: early.best_epoch(),
                    });
                    break;
                }
            }

            if let Some(next_lr) = plateau.on_epoch_end(&logs, learning_rate) {
                model.set_learning_rate(next_lr);
                info!(epoch, from = learning_rate, to = next_lr, "reduced learning rate on plateau");
                progress.on_event(ProgressEvent::LearningRateReduced {
                    run_id: run_id.clone(),
                    epoch,
                    from: learning_rate,
                    to: next_lr,
                });
            }
        }

        report.best_epoch = early.best_epoch();
        report.best_value = early.best();
        report.final_learning_rate = model.learning_rate();
        Ok(report)
    }
}

/// One pass over `batches`, updating the model when `train` is set.
pub(crate) async fn run_pass<M: MultiTaskModel>(
    model: &mut M,
    mut batches: BatchStream,
    train: bool,
    compile: &CompileSpec,
) -> TrainingResult<EpochMetrics> {
    let mut totals = StepMetrics::default();
    let mut steps = 0usize;
    while let Some(batch) = batches.next().await {
        let batch = batch?;
        let step = if train { model.train_step(&batch)? } else { model.eval_step(&batch)? };
        totals.merge(&step);
        steps += 1;
    }
    debug!(train, steps, samples = totals.samples, "pass complete");
    Ok(totals.finish(compile))
}
