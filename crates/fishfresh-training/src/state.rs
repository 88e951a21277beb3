//! Training state machine.
//!
//! ```text
//! no checkpoint / resume off:  FreshStart -> StageHead -> StageFinetune -> Finished
//!                                                  \-(no backbone)-------> Finished
//! checkpoint + resume on:      Resumed -> Finished
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    /// Build a new model from the assembled spec.
    FreshStart,
    /// Backbone frozen; heads and the dense block train.
    StageHead,
    /// Trailing backbone layers unfrozen at the lower learning rate.
    StageFinetune,
    /// Continue a saved checkpoint at fine-tune settings.
    Resumed,
    Finished,
}

/// Facts the transitions depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransitionGuards {
    pub checkpoint_exists: bool,
    pub resume_enabled: bool,
    pub backbone_available: bool,
}

impl TrainingState {
    #[must_use]
    pub fn entry(guards: TransitionGuards) -> Self {
        if guards.checkpoint_exists && guards.resume_enabled {
            Self::Resumed
        } else {
            Self::FreshStart
        }
    }

    #[must_use]
    pub fn next(self, guards: TransitionGuards) -> Self {
        match self {
            Self::FreshStart => Self::StageHead,
            Self::StageHead if guards.backbone_available => Self::StageFinetune,
            Self::StageHead | Self::StageFinetune | Self::Resumed | Self::Finished => Self::Finished,
        }
    }

    /// States that run epochs.
    #[must_use]
    pub fn is_training(self) -> bool {
        matches!(self, Self::StageHead | Self::StageFinetune | Self::Resumed)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreshStart => "fresh_start",
            Self::StageHead => "stage_head",
            Self::StageFinetune => "stage_finetune",
            Self::Resumed => "resumed",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for TrainingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
