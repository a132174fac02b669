use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::trigger::{Action, TriggerRecord};

/// Where the controller currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Evaluating,
    Annealing,
    Logging,
    Snapshotting,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::Idle => "idle",
            ControllerState::Running => "running",
            ControllerState::Evaluating => "evaluating",
            ControllerState::Annealing => "annealing",
            ControllerState::Logging => "logging",
            ControllerState::Snapshotting => "snapshotting",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Counters advanced once per completed step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingState {
    pub iteration: u64,
    /// Completed passes over the training split.
    pub epoch: u64,
    /// True when the last step crossed an epoch boundary.
    pub new_epoch: bool,
    pub triggers: BTreeMap<Action, TriggerRecord>,
}

impl TrainingState {
    pub fn record(&self, action: Action) -> TriggerRecord {
        self.triggers.get(&action).copied().unwrap_or_default()
    }

    pub(crate) fn mark_fired(&mut self, action: Action) {
        let iteration = self.iteration;
        let rec = self.triggers.entry(action).or_default();
        rec.fires += 1;
        rec.last = iteration;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_fired() {
        let mut s = TrainingState { iteration: 7, ..Default::default() };
        s.mark_fired(Action::Log);
        s.iteration = 9;
        s.mark_fired(Action::Log);
        assert_eq!(s.record(Action::Log), TriggerRecord { fires: 2, last: 9 });
        assert_eq!(s.record(Action::Snapshot), TriggerRecord::default());
    }
}
