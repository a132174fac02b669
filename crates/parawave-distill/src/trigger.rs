//! Interval triggers and the ordered (trigger, action) schedule.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::TrainingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerUnit {
    Iteration,
    Epoch,
}

/// "Every N iterations" or "every N epochs".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub every: u64,
    pub unit: TriggerUnit,
}

impl Trigger {
    pub const fn iterations(every: u64) -> Self {
        Self { every, unit: TriggerUnit::Iteration }
    }

    pub const fn epochs(every: u64) -> Self {
        Self { every, unit: TriggerUnit::Epoch }
    }

    /// Interval semantics, evaluated right after a completed step.
    ///
    /// Iteration triggers fire when the iteration count is a multiple of
    /// `every`; epoch triggers fire on the step that completes an epoch whose
    /// number is a multiple of `every`. `every == 0` never fires.
    pub fn fires(&self, state: &TrainingState) -> bool {
        if self.every == 0 {
            return false;
        }
        match self.unit {
            TriggerUnit::Iteration => state.iteration > 0 && state.iteration % self.every == 0,
            TriggerUnit::Epoch => state.new_epoch && state.epoch > 0 && state.epoch % self.every == 0,
        }
    }

    /// Stop semantics: true once the counter has reached `every`.
    pub fn reached(&self, state: &TrainingState) -> bool {
        match self.unit {
            TriggerUnit::Iteration => state.iteration >= self.every,
            TriggerUnit::Epoch => state.epoch >= self.every,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = match self.unit {
            TriggerUnit::Iteration => "iteration",
            TriggerUnit::Epoch => "epoch",
        };
        write!(f, "{} {unit}{}", self.every, if self.every == 1 { "" } else { "s" })
    }
}

/// Scheduled side effects, in the order they are evaluated after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Anneal,
    Evaluate,
    Log,
    Snapshot,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Anneal, Action::Evaluate, Action::Log, Action::Snapshot];

    pub fn name(&self) -> &'static str {
        match self {
            Action::Anneal => "anneal",
            Action::Evaluate => "evaluate",
            Action::Log => "log",
            Action::Snapshot => "snapshot",
        }
    }

    pub fn from_name(name: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.name() == name)
    }
}

/// How often an action has fired and at which iteration it last did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub fires: u64,
    pub last: u64,
}
