//! Experiment states and transition triggers

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentState {
    /// Created, nothing touched yet
    Idle,

    /// Fault being prepared against the target
    Preparing,

    /// Prepared and steady state verified
    Ready,

    /// Fault being applied
    Injecting,

    /// Fault active on the target
    Injected,

    /// Fault being removed
    Reverting,

    /// Fault removed, recovery confirmed
    Completed,

    /// Terminal failure (see event payload for cause)
    Failed,

    /// Cancelled before any fault was applied
    Cancelled,
}

impl ExperimentState {
    pub const ALL: [ExperimentState; 9] = [
        Self::Idle,
        Self::Preparing,
        Self::Ready,
        Self::Injecting,
        Self::Injected,
        Self::Reverting,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that only exist while an injector call is running
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Preparing | Self::Injecting | Self::Reverting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Ready => "ready",
            Self::Injecting => "injecting",
            Self::Injected => "injected",
            Self::Reverting => "reverting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown experiment state: {s}"))
    }
}

/// Input that drives a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Prepare,
    PrepareDone,
    Inject,
    InjectDone,
    Revert,
    RevertDone,
    Fail,
    Cancel,
}

impl Trigger {
    pub const ALL: [Trigger; 8] = [
        Self::Prepare,
        Self::PrepareDone,
        Self::Inject,
        Self::InjectDone,
        Self::Revert,
        Self::RevertDone,
        Self::Fail,
        Self::Cancel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::PrepareDone => "prepare_done",
            Self::Inject => "inject",
            Self::InjectDone => "inject_done",
            Self::Revert => "revert",
            Self::RevertDone => "revert_done",
            Self::Fail => "fail",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|trigger| trigger.as_str() == s)
            .ok_or_else(|| format!("unknown trigger: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = ExperimentState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                ExperimentState::Completed,
                ExperimentState::Failed,
                ExperimentState::Cancelled
            ]
        );
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in ExperimentState::ALL {
            assert_eq!(state.as_str().parse::<ExperimentState>(), Ok(state));
        }
        assert!("running".parse::<ExperimentState>().is_err());
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_value(Trigger::PrepareDone).unwrap();
        assert_eq!(json, "prepare_done");
        assert_eq!(Trigger::PrepareDone.to_string(), "prepare_done");
    }
}
