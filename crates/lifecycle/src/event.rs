//! Experiment lifecycle events
//!
//! Every committed transition produces exactly one [`ExperimentEvent`]. Events
//! are appended to the experiment's log, then published on the bus under
//! `experiments.<id>`. They are immutable once written.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::topic;
use crate::experiment::ExperimentId;
use crate::machine::{ExperimentState, Trigger};

/// Opaque key/value payload attached to an event
pub type Payload = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "experiment.created")]
    ExperimentCreated,
    #[serde(rename = "fault.prepared")]
    FaultPrepared,
    #[serde(rename = "fault.injected")]
    FaultInjected,
    #[serde(rename = "fault.reverted")]
    FaultReverted,
    #[serde(rename = "fault.failed")]
    FaultFailed,
    #[serde(rename = "experiment.cancelled")]
    ExperimentCancelled,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        Self::ExperimentCreated,
        Self::FaultPrepared,
        Self::FaultInjected,
        Self::FaultReverted,
        Self::FaultFailed,
        Self::ExperimentCancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExperimentCreated => "experiment.created",
            Self::FaultPrepared => "fault.prepared",
            Self::FaultInjected => "fault.injected",
            Self::FaultReverted => "fault.reverted",
            Self::FaultFailed => "fault.failed",
            Self::ExperimentCancelled => "experiment.cancelled",
        }
    }

    /// Classify a committed trigger chain by where it started and where it landed
    pub fn for_commit(first: Trigger, to: ExperimentState) -> Self {
        match (first, to) {
            (_, ExperimentState::Failed) => Self::FaultFailed,
            (Trigger::Cancel, _) | (_, ExperimentState::Cancelled) => Self::ExperimentCancelled,
            (_, ExperimentState::Ready) => Self::FaultPrepared,
            (_, ExperimentState::Injected) => Self::FaultInjected,
            (_, ExperimentState::Completed) => Self::FaultReverted,
            _ => Self::ExperimentCreated,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentEvent {
    pub experiment_id: ExperimentId,
    /// Per-experiment sequence, starting at 1, gap-free
    pub sequence: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub from_state: ExperimentState,
    pub to_state: ExperimentState,
    /// Trigger chain applied by this commit, folded by replay
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
}

impl ExperimentEvent {
    /// Bus topic this event is published on
    pub fn topic(&self) -> String {
        topic::experiment_topic(&self.experiment_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.to_state.is_terminal()
    }
}

/// Event awaiting a sequence number from the store
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub experiment_id: ExperimentId,
    pub event_type: EventType,
    pub from_state: ExperimentState,
    pub to_state: ExperimentState,
    pub triggers: Vec<Trigger>,
    pub payload: Payload,
}

impl NewEvent {
    pub fn created(experiment_id: ExperimentId, payload: Payload) -> Self {
        Self {
            experiment_id,
            event_type: EventType::ExperimentCreated,
            from_state: ExperimentState::Idle,
            to_state: ExperimentState::Idle,
            triggers: vec![],
            payload,
        }
    }

    /// Stamp with the sequence assigned by the store
    pub fn into_event(self, sequence: u64, timestamp: DateTime<Utc>) -> ExperimentEvent {
        ExperimentEvent {
            experiment_id: self.experiment_id,
            sequence,
            event_type: self.event_type,
            from_state: self.from_state,
            to_state: self.to_state,
            triggers: self.triggers,
            payload: self.payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_classification() {
        use ExperimentState::*;

        assert_eq!(EventType::for_commit(Trigger::Prepare, Ready), EventType::FaultPrepared);
        assert_eq!(EventType::for_commit(Trigger::Inject, Injected), EventType::FaultInjected);
        assert_eq!(EventType::for_commit(Trigger::Revert, Completed), EventType::FaultReverted);
        assert_eq!(EventType::for_commit(Trigger::Inject, Failed), EventType::FaultFailed);
        assert_eq!(
            EventType::for_commit(Trigger::Cancel, Completed),
            EventType::ExperimentCancelled
        );
        assert_eq!(EventType::for_commit(Trigger::Cancel, Failed), EventType::FaultFailed);
    }

    #[test]
    fn test_event_wire_format() {
        let event = NewEvent::created(ExperimentId::from("exp-1"), Payload::new())
            .into_event(1, Utc::now());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "experiment.created");
        assert_eq!(json["experiment_id"], "exp-1");
        assert_eq!(json["from_state"], "idle");
        assert_eq!(json["sequence"], 1);

        let parsed: ExperimentEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
        assert_eq!(parsed.topic(), "experiments.exp-1");
    }
}
