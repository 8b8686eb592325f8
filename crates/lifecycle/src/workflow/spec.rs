//! Workflow definitions as handed over by the configuration layer

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::condition::Condition;
use crate::experiment::ExperimentSpec;
use crate::serde_duration;

/// A named set of steps forming a dependency graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: vec![],
        }
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}

/// One experiment launch inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique within the workflow
    pub name: String,
    /// Key into the [`ExperimentCatalog`]
    pub experiment_ref: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Dependents proceed even if this step fails
    #[serde(default)]
    pub optional: bool,
    /// Deadline for the whole step; on expiry the experiment is cancelled
    #[serde(default, with = "serde_duration::option_millis")]
    pub timeout: Option<Duration>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, experiment_ref: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment_ref: experiment_ref.into(),
            depends_on: vec![],
            condition: None,
            optional: false,
            timeout: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Experiment specs available to workflows, by reference name
#[derive(Debug, Clone, Default)]
pub struct ExperimentCatalog {
    specs: HashMap<String, ExperimentSpec>,
}

impl ExperimentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, spec: ExperimentSpec) -> &mut Self {
        self.specs.insert(reference.into(), spec);
        self
    }

    pub fn with(mut self, reference: impl Into<String>, spec: ExperimentSpec) -> Self {
        self.insert(reference, spec);
        self
    }

    pub fn get(&self, reference: &str) -> Option<&ExperimentSpec> {
        self.specs.get(reference)
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.specs.contains_key(reference)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
