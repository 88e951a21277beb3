//! Per-epoch monitors: best-only checkpointing, early stopping and
//! learning-rate decay on plateau.
//!
//! Each callback only decides; the controller performs the save, the weight
//! restore or the learning-rate change.

use crate::config::PlateauConfig;
use crate::model::EpochMetrics;
use crate::state::TrainingState;
use serde::{Deserialize, Serialize};

/// Everything observed at the end of one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub state: TrainingState,
    /// 1-based epoch within the stage.
    pub stage_epoch: u32,
    /// 1-based epoch across the whole run.
    pub epoch: u32,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    /// NaN never counts as an improvement.
    #[must_use]
    pub fn improved(self, current: f64, best: Option<f64>, min_delta: f64) -> bool {
        match best {
            None => !current.is_nan(),
            Some(best) => match self {
                Self::Max => current - min_delta > best,
                Self::Min => current + min_delta < best,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    ValFreshnessAccuracy,
    ValFreshnessLoss,
}

impl Monitor {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ValFreshnessAccuracy => "val_fresh_out_accuracy",
            Self::ValFreshnessLoss => "val_fresh_out_loss",
        }
    }

    #[must_use]
    pub fn mode(self) -> Mode {
        match self {
            Self::ValFreshnessAccuracy => Mode::Max,
            Self::ValFreshnessLoss => Mode::Min,
        }
    }

    #[must_use]
    pub fn value(self, logs: &EpochLogs) -> f64 {
        match self {
            Self::ValFreshnessAccuracy => logs.val.freshness.accuracy,
            Self::ValFreshnessLoss => logs.val.freshness.loss,
        }
    }
}

/// Best-only checkpoint policy. The best value survives stage changes.
#[derive(Debug, Clone)]
pub struct ModelCheckpoint {
    monitor: Monitor,
    best: Option<f64>,
}

impl ModelCheckpoint {
    #[must_use]
    pub fn new(monitor: Monitor) -> Self {
        Self { monitor, best: None }
    }

    /// Start from a value achieved by an earlier run.
    #[must_use]
    pub fn with_best(mut self, best: Option<f64>) -> Self {
        self.best = best.filter(|v| !v.is_nan());
        self
    }

    #[must_use]
    pub fn monitor(&self) -> Monitor {
        self.monitor
    }

    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// `true` when the checkpoint should be overwritten for this epoch.
    pub fn on_epoch_end(&mut self, logs: &EpochLogs) -> bool {
        let current = self.monitor.value(logs);
        if self.monitor.mode().improved(current, self.best, 0.0) {
            self.best = Some(current);
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EarlyStoppingDecision {
    /// Keep going; `improved` asks the caller to snapshot the weights.
    Continue { improved: bool },
    /// Stop the stage and restore the snapshot taken at the best epoch.
    Stop,
}

#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: Monitor,
    patience: u32,
    best: Option<f64>,
    best_epoch: Option<u32>,
    wait: u32,
}

impl EarlyStopping {
    #[must_use]
    pub fn new(monitor: Monitor, patience: u32) -> Self {
        Self { monitor, patience, best: None, best_epoch: None, wait: 0 }
    }

    pub fn reset(&mut self) {
        self.best = None;
        self.best_epoch = None;
        self.wait = 0;
    }

    #[must_use]
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    #[must_use]
    pub fn best_epoch(&self) -> Option<u32> {
        self.best_epoch
    }

    pub fn on_epoch_end(&mut self, logs: &EpochLogs) -> EarlyStoppingDecision {
        let current = self.monitor.value(logs);
        if self.monitor.mode().improved(current, self.best, 0.0) {
            self.best = Some(current);
            self.best_epoch = Some(logs.stage_epoch);
            self.wait = 0;
            return EarlyStoppingDecision::Continue { improved: true };
        }
        self.wait += 1;
        if self.wait >= self.patience {
            return EarlyStoppingDecision::Stop;
        }
        EarlyStoppingDecision::Continue { improved: false }
    }
}

#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    monitor: Monitor,
    config: PlateauConfig,
    best: Option<f64>,
    wait: u32,
}

impl ReduceLrOnPlateau {
    #[must_use]
    pub fn new(monitor: Monitor, config: PlateauConfig) -> Self {
        Self { monitor, config, best: None, wait: 0 }
    }

    pub fn reset(&mut self) {
        self.best = None;
        self.wait = 0;
    }

    /// Returns the new learning rate when it should change.
    pub fn on_epoch_end(&mut self, logs: &EpochLogs, current_lr: f64) -> Option<f64> {
        let current = self.monitor.value(logs);
        if self.monitor.mode().improved(current, self.best, self.config.min_delta) {
            self.best = Some(current);
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.config.patience {
            return None;
        }
        self.wait = 0;
        if current_lr > self.config.min_lr {
            return Some((current_lr * self.config.factor).max(self.config.min_lr));
        }
        None
    }
}
