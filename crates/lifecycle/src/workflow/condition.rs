//! Step conditions
//!
//! A condition is evaluated once all of a step's dependencies are terminal.
//! `false` skips the step; an evaluation error fails it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::capability::{MetricError, MetricSource, ProbeRegistry};
use crate::machine::ExperimentState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum Condition {
    /// Re-run a named health probe
    Probe { name: String },
    /// A dependency's experiment ended in `state`
    State { step: String, state: ExperimentState },
    /// A named metric compared against a threshold
    Metric {
        name: String,
        comparator: Comparator,
        threshold: f64,
    },
}

impl Condition {
    pub fn probe(name: impl Into<String>) -> Self {
        Self::Probe { name: name.into() }
    }

    pub fn state(step: impl Into<String>, state: ExperimentState) -> Self {
        Self::State {
            step: step.into(),
            state,
        }
    }

    pub fn metric(name: impl Into<String>, comparator: Comparator, threshold: f64) -> Self {
        Self::Metric {
            name: name.into(),
            comparator,
            threshold,
        }
    }

    /// Step referenced by a `state` condition
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            Self::State { step, .. } => Some(step),
            _ => None,
        }
    }

    pub(crate) async fn evaluate(&self, inputs: &ConditionInputs<'_>) -> Result<Evaluation, MetricError> {
        match self {
            Self::Probe { name } => {
                let result = inputs.probes.run(name).await;
                Ok(Evaluation {
                    satisfied: result.passed,
                    detail: match result.detail {
                        Some(detail) => format!("probe '{name}': {detail}"),
                        None => format!("probe '{name}' passed={}", result.passed),
                    },
                })
            }
            Self::State { step, state } => {
                let actual = inputs.upstream.get(step.as_str()).copied();
                Ok(Evaluation {
                    satisfied: actual == Some(*state),
                    detail: match actual {
                        Some(actual) => format!("step '{step}' ended in {actual}, wanted {state}"),
                        None => format!("step '{step}' has no experiment state, wanted {state}"),
                    },
                })
            }
            Self::Metric {
                name,
                comparator,
                threshold,
            } => {
                let source = inputs.metrics.ok_or_else(|| {
                    MetricError::Unavailable("no metric source configured".to_string())
                })?;
                let value = source.value(name).await?;
                Ok(Evaluation {
                    satisfied: comparator.apply(value, *threshold),
                    detail: format!("metric '{name}' = {value}, wanted {comparator} {threshold}"),
                })
            }
        }
    }
}

/// Outcome of evaluating a condition
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Evaluation {
    pub(crate) satisfied: bool,
    pub(crate) detail: String,
}

pub(crate) struct ConditionInputs<'a> {
    pub(crate) probes: &'a ProbeRegistry,
    pub(crate) metrics: Option<&'a dyn MetricSource>,
    /// Terminal experiment state of each dependency that ran
    pub(crate) upstream: &'a HashMap<String, ExperimentState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl Comparator {
    pub fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Eq => (value - threshold).abs() <= f64::EPSILON * threshold.abs().max(1.0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Comparator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "==" => Ok(Self::Eq),
            other => Err(format!("unknown comparator: {other}")),
        }
    }
}
