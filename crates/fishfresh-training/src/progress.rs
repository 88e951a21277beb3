use crate::artifacts::RunId;
use crate::callbacks::EpochLogs;
use crate::state::TrainingState;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { run_id: RunId },
    StateEntered { run_id: RunId, state: TrainingState },
    Epoch { run_id: RunId, epochs: u32, logs: EpochLogs },
    CheckpointSaved { run_id: RunId, epoch: u32, value: f64 },
    LearningRateReduced { run_id: RunId, epoch: u32, from: f64, to: f64 },
    EarlyStopped { run_id: RunId, state: TrainingState, epoch: u32, best_epoch: Option<u32> },
    Finished { run_id: RunId },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

#[derive(Debug, Default)]
pub struct StdoutProgressSink;

impl ProgressSink for StdoutProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { run_id } => println!("[train:{run_id}] started"),
            ProgressEvent::StateEntered { run_id, state } => println!("[train:{run_id}] -> {state}"),
            ProgressEvent::Epoch { run_id, epochs, logs } => println!(
                "[train:{run_id}] {} epoch {}/{epochs}  loss {:.4}  fresh_acc {:.4}  species_acc {:.4}  \
                 val_fresh_acc {:.4}  val_species_acc {:.4}  lr {:.1e}",
                logs.state,
                logs.stage_epoch,
                logs.train.loss,
                logs.train.freshness.accuracy,
                logs.train.species.accuracy,
                logs.val.freshness.accuracy,
                logs.val.species.accuracy,
                logs.learning_rate,
            ),
            ProgressEvent::CheckpointSaved { run_id, epoch, value } => {
                println!("[train:{run_id}] epoch {epoch}: val_fresh_out_accuracy improved to {value:.4}, checkpoint saved");
            }
            ProgressEvent::LearningRateReduced { run_id, epoch, from, to } => {
                println!("[train:{run_id}] epoch {epoch}: learning rate {from:.1e} -> {to:.1e}");
            }
            ProgressEvent::EarlyStopped { run_id, state, epoch, best_epoch } => match best_epoch {
                Some(best) => println!("[train:{run_id}] {state} stopped early at epoch {epoch}, restored epoch {best}"),
                None => println!("[train:{run_id}] {state} stopped early at epoch {epoch}"),
            },
            ProgressEvent::Finished { run_id } => println!("[train:{run_id}] finished"),
        }
    }
}

/// Forwards events to `tracing` for library callers without a terminal.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Epoch { logs, .. } => tracing::info!(
                state = %logs.state,
                epoch = logs.stage_epoch,
                val_fresh_acc = logs.val.freshness.accuracy,
                val_fresh_loss = logs.val.freshness.loss,
                "epoch finished"
            ),
            other => tracing::info!(event = ?other, "training progress"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn entered_states(&self) -> Vec<TrainingState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::StateEntered { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
