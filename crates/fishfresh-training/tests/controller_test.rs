//! Integration tests for the training controller.
//!
//! A scripted backend replays fixed validation scores so the state machine,
//! checkpoint policy and resume path can be checked without real training.

use fishfresh_training::config::{EarlyStoppingConfig, FinetuneConfig};
use fishfresh_training::{
    evaluate_checkpoint, load_meta, BackboneTrainability, Batch, CompileSpec, ModelBackend, ModelSpec,
    MultiTaskModel, Predictions, RecordingProgressSink, StageConfig, StepMetrics, TaxonomySource, TrainingConfig,
    TrainingController, TrainingError, TrainingManifest, TrainingResult, TrainingState,
};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Everything the scripted model was asked to do.
#[derive(Debug, Default)]
struct Journal {
    /// `(accuracy, loss)` returned by successive validation passes.
    val_script: VecDeque<(f64, f64)>,
    compiled: Vec<CompileSpec>,
    trainability: Vec<BackboneTrainability>,
    saved_steps: Vec<u64>,
    restored_steps: Vec<u64>,
    builds: usize,
    loads: usize,
}

#[derive(Clone)]
struct ScriptedBackend {
    journal: Arc<Mutex<Journal>>,
    layers: Option<usize>,
}

impl ScriptedBackend {
    fn new(layers: Option<usize>, script: &[(f64, f64)]) -> Self {
        let journal = Journal { val_script: script.iter().copied().collect(), ..Default::default() };
        Self { journal: Arc::new(Mutex::new(journal)), layers }
    }

    fn journal(&self) -> std::sync::MutexGuard<'_, Journal> {
        self.journal.lock().unwrap()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedModel {
    steps: u64,
    layers: Option<usize>,
    trainability: Option<BackboneTrainability>,
    freshness: usize,
    species: usize,
}

struct ScriptedModel {
    journal: Arc<Mutex<Journal>>,
    /// Number of optimizer updates applied; doubles as the weights.
    steps: u64,
    layers: Option<usize>,
    trainability: Option<BackboneTrainability>,
    learning_rate: f64,
    freshness: usize,
    species: usize,
}

impl MultiTaskModel for ScriptedModel {
    type Weights = u64;

    fn compile(&mut self, spec: &CompileSpec) -> TrainingResult<()> {
        self.learning_rate = spec.learning_rate();
        self.journal.lock().unwrap().compiled.push(*spec);
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn train_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics> {
        self.steps += 1;
        let n = batch.len();
        Ok(StepMetrics { samples: n, freshness_loss_sum: n as f64, species_loss_sum: n as f64, ..Default::default() })
    }

    fn eval_step(&mut self, batch: &Batch) -> TrainingResult<StepMetrics> {
        let (accuracy, loss) = self.journal.lock().unwrap().val_script.pop_front().unwrap_or((0.0, 1.0));
        let n = batch.len();
        Ok(StepMetrics {
            samples: n,
            freshness_loss_sum: loss * n as f64,
            species_loss_sum: loss * n as f64,
            freshness_correct: (accuracy * n as f64).round() as usize,
            species_correct: 0,
        })
    }

    fn predict(&self, images: &Array4<f32>) -> TrainingResult<Predictions> {
        let n = images.len_of(Axis(0));
        Ok(Predictions {
            freshness: Array2::from_elem((n, self.freshness), 1.0 / self.freshness as f32),
            species: Array2::from_elem((n, self.species), 1.0 / self.species as f32),
        })
    }

    fn weights(&self) -> u64 {
        self.steps
    }

    fn set_weights(&mut self, weights: u64) {
        self.journal.lock().unwrap().restored_steps.push(weights);
        self.steps = weights;
    }

    fn head_classes(&self) -> (usize, usize) {
        (self.freshness, self.species)
    }

    fn backbone_layers(&self) -> Option<usize> {
        self.layers
    }

    fn backbone_trainability(&self) -> Option<BackboneTrainability> {
        self.trainability
    }

    fn set_backbone_trainability(&mut self, trainability: BackboneTrainability) -> TrainingResult<()> {
        if self.layers.is_none() {
            return Err(TrainingError::Backend("no backbone".to_string()));
        }
        self.trainability = Some(trainability);
        self.journal.lock().unwrap().trainability.push(trainability);
        Ok(())
    }

    fn save(&self, path: &Path) -> TrainingResult<()> {
        let saved = SavedModel {
            steps: self.steps,
            layers: self.layers,
            trainability: self.trainability,
            freshness: self.freshness,
            species: self.species,
        };
        std::fs::write(path, serde_json::to_vec(&saved)?)?;
        self.journal.lock().unwrap().saved_steps.push(self.steps);
        Ok(())
    }
}

impl ModelBackend for ScriptedBackend {
    type Model = ScriptedModel;

    fn id(&self) -> &'static str {
        "scripted"
    }

    fn build(&self, spec: &ModelSpec) -> TrainingResult<ScriptedModel> {
        self.journal().builds += 1;
        Ok(ScriptedModel {
            journal: Arc::clone(&self.journal),
            steps: 0,
            layers: self.layers,
            trainability: self.layers.map(|_| BackboneTrainability::Frozen),
            learning_rate: 0.0,
            freshness: spec.freshness_head.classes,
            species: spec.species_head.classes,
        })
    }

    fn load(&self, path: &Path) -> TrainingResult<ScriptedModel> {
        self.journal().loads += 1;
        let saved: SavedModel = serde_json::from_slice(&std::fs::read(path)?)?;
        Ok(ScriptedModel {
            journal: Arc::clone(&self.journal),
            steps: saved.steps,
            layers: saved.layers,
            trainability: saved.trainability,
            learning_rate: 0.0,
            freshness: saved.freshness,
            species: saved.species,
        })
    }
}

fn write_image(path: &Path, shade: u8) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    RgbImage::from_pixel(6, 6, Rgb([shade, shade / 2, 255 - shade])).save(path).unwrap();
}

/// Two images per (freshness, species) pair in `split`.
fn seed_split(root: &Path, split: &str, pairs: &[(&str, &str)]) {
    for (i, (fresh, species)) in pairs.iter().enumerate() {
        for j in 0..2u8 {
            let shade = (i as u8) * 40 + j * 10;
            write_image(&root.join(split).join(fresh).join(species).join(format!("img_{j}.png")), shade);
        }
    }
}

fn seed_corpus(root: &Path) {
    let pairs = [("fresh", "bangus"), ("not_fresh", "tilapia")];
    seed_split(root, "train", &pairs);
    seed_split(root, "validation", &pairs);
}

fn config(temp: &TempDir) -> TrainingConfig {
    TrainingConfig {
        data_root: temp.path().join("datasets"),
        models_dir: temp.path().join("models"),
        image_size: [4, 4],
        batch_size: 8,
        shuffle_buffer: 8,
        prefetch: 1,
        decode_workers: 2,
        head: StageConfig { epochs: 3, learning_rate: 1e-4, label_smoothing: 0.1 },
        finetune: FinetuneConfig { epochs: 2, learning_rate: 1e-5, label_smoothing: 0.05, unfreeze_last: 3 },
        early_stopping: EarlyStoppingConfig { patience: 10 },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fresh_run_walks_both_stages_and_saves_best_only() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    seed_corpus(&config.data_root);

    let backend = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (0.25, 0.9), (0.75, 0.8), (0.5, 0.7), (0.75, 0.6)]);
    let controller = TrainingController::new(backend.clone(), config.clone()).unwrap();
    let sink = RecordingProgressSink::default();
    let report = controller.run(&sink).await.unwrap();

    use TrainingState::*;
    assert_eq!(report.states, vec![FreshStart, StageHead, StageFinetune, Finished]);
    assert_eq!(sink.entered_states(), report.states);
    assert_eq!(report.best_val_freshness_accuracy, Some(0.75));

    {
        let journal = backend.journal();
        assert_eq!(journal.builds, 1);
        assert_eq!(journal.loads, 0);
        // one train batch per epoch: saved after epochs 1 and 3 only
        assert_eq!(journal.saved_steps, vec![1, 3]);
        assert_eq!(
            journal.trainability,
            vec![BackboneTrainability::Frozen, BackboneTrainability::PartiallyUnfrozen { last: 3 }]
        );
        let rates: Vec<f64> = journal.compiled.iter().map(CompileSpec::learning_rate).collect();
        assert_eq!(rates, vec![1e-4, 1e-5]);
        assert!((journal.compiled[0].freshness_loss.label_smoothing - 0.1).abs() < 1e-6);
        assert!((journal.compiled[1].species_loss.label_smoothing - 0.05).abs() < 1e-6);
    }

    assert_eq!(report.stages.len(), 2);
    assert_eq!(report.stages[0].checkpoints_saved, 2);
    assert_eq!(report.stages[1].checkpoints_saved, 0);
    assert_eq!(report.stages[1].history.last().unwrap().epoch, 5);

    let meta = load_meta(&controller.layout().checkpoint_meta_path()).unwrap().unwrap();
    assert_eq!(meta.stage, StageHead);
    assert_eq!(meta.epoch, 3);
    assert_eq!(meta.backbone, Some(BackboneTrainability::Frozen));
    assert!((meta.best_value - 0.75).abs() < 1e-12);

    let manifest: TrainingManifest =
        serde_json::from_slice(&std::fs::read(&report.manifest_path).unwrap()).unwrap();
    assert_eq!(manifest.backend, "scripted");
    assert_eq!(manifest.taxonomy.species_classes, vec!["bangus", "tilapia"]);
    assert_eq!(manifest.artifacts.len(), 3);
    assert!(!temp.path().join("models").join(".multitask_probe.ckpt.tmp").exists());
}

#[tokio::test]
async fn test_resume_skips_head_stage_and_keeps_best() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    seed_corpus(&config.data_root);

    let first = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (0.75, 0.9), (0.5, 0.8), (0.5, 0.7), (0.5, 0.6)]);
    TrainingController::new(first, config.clone())
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    let second = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (1.0, 0.9)]);
    let controller = TrainingController::new(second.clone(), config).unwrap();
    let report = controller.run(&RecordingProgressSink::default()).await.unwrap();

    assert_eq!(report.states, vec![TrainingState::Resumed, TrainingState::Finished]);
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].epochs_run, 2);

    let journal = second.journal();
    assert_eq!(journal.builds, 0);
    assert_eq!(journal.loads, 1);
    let rates: Vec<f64> = journal.compiled.iter().map(CompileSpec::learning_rate).collect();
    assert_eq!(rates, vec![1e-5]);
    // saved while frozen, so resume applies the fine-tune unfreeze
    assert_eq!(journal.trainability, vec![BackboneTrainability::PartiallyUnfrozen { last: 3 }]);
    // 0.5 does not beat the stored 0.75; 1.0 does
    assert_eq!(journal.saved_steps.len(), 1);
    drop(journal);

    let meta = load_meta(&controller.layout().checkpoint_meta_path()).unwrap().unwrap();
    assert_eq!(meta.stage, TrainingState::Resumed);
    assert_eq!(meta.backbone, Some(BackboneTrainability::PartiallyUnfrozen { last: 3 }));
}

#[tokio::test]
async fn test_resume_disabled_retrains_from_scratch() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.head.epochs = 1;
    config.finetune.epochs = 1;
    seed_corpus(&config.data_root);

    TrainingController::new(ScriptedBackend::new(Some(8), &[(0.75, 1.0)]), config.clone())
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    config.resume = false;
    let backend = ScriptedBackend::new(Some(8), &[(0.25, 1.0)]);
    let report = TrainingController::new(backend.clone(), config).unwrap().run(&RecordingProgressSink::default()).await.unwrap();

    assert_eq!(report.states[0], TrainingState::FreshStart);
    assert_eq!(backend.journal().builds, 1);
    // a fresh run starts its own best-so-far
    assert_eq!(backend.journal().saved_steps, vec![1]);
}

#[tokio::test]
async fn test_early_stopping_restores_best_weights_without_backbone() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.head.epochs = 8;
    config.early_stopping.patience = 2;
    seed_corpus(&config.data_root);

    let backend = ScriptedBackend::new(None, &[(0.5, 1.0), (0.75, 0.9), (0.5, 0.8), (0.5, 0.7), (1.0, 0.1)]);
    let report = TrainingController::new(backend.clone(), config)
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    assert_eq!(report.states, vec![TrainingState::FreshStart, TrainingState::StageHead, TrainingState::Finished]);
    let stage = &report.stages[0];
    assert!(stage.stopped_early);
    assert_eq!(stage.epochs_run, 4);
    assert_eq!(stage.best_epoch, Some(2));

    let journal = backend.journal();
    assert_eq!(journal.restored_steps, vec![2]);
    assert!(journal.trainability.is_empty());
    assert_eq!(journal.saved_steps, vec![1, 2]);
}

#[tokio::test]
async fn test_plateau_lowers_learning_rate_between_epochs() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.head.epochs = 4;
    config.finetune.epochs = 0;
    seed_corpus(&config.data_root);

    let backend = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (0.5, 1.0), (0.5, 1.0), (0.5, 1.0)]);
    let report = TrainingController::new(backend, config)
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    let rates: Vec<f64> = report.stages[0].history.iter().map(|logs| logs.learning_rate).collect();
    assert_eq!(rates, vec![1e-4, 1e-4, 1e-4, 5e-5]);
}

#[tokio::test]
async fn test_taxonomy_is_stable_when_species_are_added() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    seed_corpus(&config.data_root);

    let controller = TrainingController::new(ScriptedBackend::new(None, &[]), config.clone()).unwrap();
    let first = controller.prepare().unwrap();
    assert_eq!(first.taxonomy.source, TaxonomySource::Discovered);
    assert_eq!(first.taxonomy.species.names(), ["bangus", "tilapia"]);
    assert_eq!(first.train.len(), 4);

    // a new species sorting before the others, plus a stray file and a non-image
    seed_split(&config.data_root, "train", &[("fresh", "alumahan")]);
    write_image(&config.data_root.join("train").join("fresh").join("stray.png"), 7);
    std::fs::write(config.data_root.join("train").join("fresh").join("bangus").join("notes.txt"), b"x").unwrap();

    let second = controller.prepare().unwrap();
    assert_eq!(second.taxonomy.source, TaxonomySource::Reused);
    assert_eq!(second.taxonomy.species.names(), ["bangus", "tilapia"]);
    assert_eq!(second.taxonomy.ignored_species, vec!["alumahan".to_string()]);
    assert_eq!(second.train.len(), 4);
    assert!(second.train.samples().iter().all(|s| !s.path.to_string_lossy().contains("alumahan")));
}

#[tokio::test]
async fn test_empty_validation_split_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    seed_split(&config.data_root, "train", &[("fresh", "bangus")]);

    let backend = ScriptedBackend::new(Some(8), &[]);
    let err = TrainingController::new(backend.clone(), config)
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TrainingError::Dataset(_)));
    assert_eq!(backend.journal().builds, 0);
}

#[tokio::test]
async fn test_evaluate_requires_checkpoint_then_scores_testing_split() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.head.epochs = 1;
    config.finetune.epochs = 0;
    seed_corpus(&config.data_root);

    let backend = ScriptedBackend::new(Some(8), &[(0.75, 0.5)]);
    let err = evaluate_checkpoint(&backend, &config).await.unwrap_err();
    assert!(matches!(err, TrainingError::InvalidSpec(_)));

    TrainingController::new(backend.clone(), config.clone())
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();
    seed_split(&config.data_root, "testing", &[("fresh", "bangus"), ("fresh", "tilapia")]);

    backend.journal().val_script.push_back((0.5, 0.25));
    let report = evaluate_checkpoint(&backend, &config).await.unwrap();
    assert_eq!(report.samples, 4);
    assert!((report.metrics.freshness.accuracy - 0.5).abs() < 1e-12);
    assert_eq!(report.freshness_support, vec![0, 4, 0]);
    assert_eq!(report.species_support, vec![2, 2]);
    let last = backend.journal().compiled.last().copied().unwrap();
    assert!(last.freshness_loss.label_smoothing.abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_resume_rejects_checkpoint_sized_for_another_taxonomy() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    config.head.epochs = 1;
    config.finetune.epochs = 0;
    seed_corpus(&config.data_root);

    let controller = TrainingController::new(ScriptedBackend::new(Some(8), &[(0.75, 1.0)]), config.clone()).unwrap();
    controller.run(&RecordingProgressSink::default()).await.unwrap();

    // a record with another freshness ordering gives way to the scan, which now finds three species
    std::fs::write(
        controller.layout().labels_path(),
        r#"{"freshness_classes": ["not_fresh", "fresh", "borderline"], "species_classes": ["bangus", "tilapia"]}"#,
    )
    .unwrap();
    seed_split(&config.data_root, "train", &[("fresh", "alumahan")]);

    let second = ScriptedBackend::new(Some(8), &[(1.0, 0.1)]);
    let err = TrainingController::new(second.clone(), config.clone())
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap_err();

    assert!(matches!(err, TrainingError::Checkpoint(_)));
    {
        let journal = second.journal();
        assert_eq!(journal.loads, 1);
        assert!(journal.compiled.is_empty());
        assert!(journal.saved_steps.is_empty());
    }

    seed_split(&config.data_root, "testing", &[("fresh", "bangus")]);
    let err = evaluate_checkpoint(&second, &config).await.unwrap_err();
    assert!(matches!(err, TrainingError::Checkpoint(_)));
}

#[tokio::test]
async fn test_resume_without_backbone_runs_finetune_epochs_only() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    seed_corpus(&config.data_root);

    let first = ScriptedBackend::new(None, &[(0.5, 1.0), (0.75, 0.9), (0.5, 0.8)]);
    let controller = TrainingController::new(first, config.clone()).unwrap();
    let report = controller.run(&RecordingProgressSink::default()).await.unwrap();
    assert_eq!(report.states, vec![TrainingState::FreshStart, TrainingState::StageHead, TrainingState::Finished]);
    let meta = load_meta(&controller.layout().checkpoint_meta_path()).unwrap().unwrap();
    assert_eq!(meta.backbone, None);

    let second = ScriptedBackend::new(None, &[(0.5, 1.0), (1.0, 0.9)]);
    let report = TrainingController::new(second.clone(), config)
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    assert_eq!(report.states, vec![TrainingState::Resumed, TrainingState::Finished]);
    assert_eq!(report.stages.len(), 1);
    assert_eq!(report.stages[0].epochs_run, 2);

    let journal = second.journal();
    assert!(journal.trainability.is_empty());
    let rates: Vec<f64> = journal.compiled.iter().map(CompileSpec::learning_rate).collect();
    assert_eq!(rates, vec![1e-5]);
    assert_eq!(journal.saved_steps.len(), 1);
}

#[tokio::test]
async fn test_resume_without_sidecar_resets_best_and_reads_model_backbone() {
    let temp = TempDir::new().unwrap();
    let mut config = config(&temp);
    seed_corpus(&config.data_root);

    // best epoch falls in fine-tune, so the checkpoint holds the last 3 layers unfrozen
    let first = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (0.5, 1.0), (0.5, 1.0), (0.75, 0.9), (0.5, 0.8)]);
    let controller = TrainingController::new(first.clone(), config.clone()).unwrap();
    controller.run(&RecordingProgressSink::default()).await.unwrap();
    assert_eq!(first.journal().saved_steps, vec![1, 4]);

    let meta_path = controller.layout().checkpoint_meta_path();
    std::fs::remove_file(&meta_path).unwrap();

    config.finetune.unfreeze_last = 5;
    let second = ScriptedBackend::new(Some(8), &[(0.5, 1.0), (0.25, 0.9)]);
    let report = TrainingController::new(second.clone(), config)
        .unwrap()
        .run(&RecordingProgressSink::default())
        .await
        .unwrap();

    assert_eq!(report.states, vec![TrainingState::Resumed, TrainingState::Finished]);
    assert_eq!(report.best_val_freshness_accuracy, Some(0.5));
    {
        let journal = second.journal();
        // 0.5 is below the lost 0.75 but saves because nothing seeds the best
        assert_eq!(journal.saved_steps, vec![5]);
        assert_eq!(journal.trainability, vec![BackboneTrainability::PartiallyUnfrozen { last: 3 }]);
    }

    let meta = load_meta(&meta_path).unwrap().unwrap();
    assert!((meta.best_value - 0.5).abs() < 1e-12);
    assert_eq!(meta.backbone, Some(BackboneTrainability::PartiallyUnfrozen { last: 3 }));
}
