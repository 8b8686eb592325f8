//! Experiment identity, specification and snapshots

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::{ExperimentState, Trigger};
use crate::serde_duration;

/// Unique experiment identifier
///
/// Ids become the last token of the experiment's bus topic
/// (`experiments.<id>`), so they may not contain `.`, `*`, `>` or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Generate a new time-ordered id
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self
                .0
                .chars()
                .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExperimentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExperimentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// What an experiment acts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub kind: String,
    /// Equality label selector
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl Target {
    pub fn new(namespace: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            selector: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }

    /// Whether both selectors can match a common object.
    ///
    /// Equality selectors intersect unless some key is pinned to two
    /// different values; an empty selector matches everything.
    pub fn overlaps(&self, other: &Target) -> bool {
        if self.namespace != other.namespace || self.kind != other.kind {
            return false;
        }
        self.selector.iter().all(|(key, value)| {
            other
                .selector
                .get(key)
                .map_or(true, |other_value| other_value == value)
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.kind)?;
        if !self.selector.is_empty() {
            let labels: Vec<String> = self
                .selector
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "[{}]", labels.join(","))?;
        }
        Ok(())
    }
}

/// Fault to apply, interpreted by the injector registered for `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// How long the fault stays active before it is reverted
    #[serde(default, with = "serde_duration::option_millis")]
    pub duration: Option<Duration>,
}

impl FaultSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: serde_json::Value::Null,
            duration: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// When a probe runs relative to the fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbePhase {
    Before,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRef {
    pub name: String,
    pub phase: ProbePhase,
}

/// Validated experiment definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub name: String,
    pub target: Target,
    pub fault: FaultSpec,
    #[serde(default)]
    pub probes: Vec<ProbeRef>,
}

impl ExperimentSpec {
    pub fn new(name: impl Into<String>, target: Target, fault: FaultSpec) -> Self {
        Self {
            name: name.into(),
            target,
            fault,
            probes: vec![],
        }
    }

    pub fn with_probe(mut self, name: impl Into<String>, phase: ProbePhase) -> Self {
        self.probes.push(ProbeRef {
            name: name.into(),
            phase,
        });
        self
    }

    pub fn probes_for(&self, phase: ProbePhase) -> impl Iterator<Item = &ProbeRef> {
        self.probes.iter().filter(move |p| p.phase == phase)
    }
}

/// Point-in-time view of an experiment owned by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub target: Target,
    /// Committed state; always the `to_state` of the last durable event
    pub state: ExperimentState,
    /// In-progress state while an injector call is running
    pub pending_state: Option<ExperimentState>,
    /// Sequence number of the last durable event
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
}

/// Row of the `experiments` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub spec: ExperimentSpec,
    pub state: ExperimentState,
    pub sequence: u64,
    /// Write-ahead intent: trigger whose action was started but not committed
    pub in_flight: Option<Trigger>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
