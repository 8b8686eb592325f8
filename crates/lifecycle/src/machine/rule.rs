//! Guard and action abstractions attached to transition rules

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::lease::TargetLeases;
use super::state::{ExperimentState, Trigger};
use crate::capability::{
    with_deadline, FaultInjector, FaultPhase, FaultRequest, InjectorError, InjectorRegistry,
    ProbeRegistry,
};
use crate::event::Payload;
use crate::experiment::{ExperimentId, ExperimentSpec};

/// Everything a guard or action may look at while a rule is evaluated
pub struct TransitionContext<'a> {
    pub experiment_id: &'a ExperimentId,
    pub spec: &'a ExperimentSpec,
    /// State the rule starts from
    pub from: ExperimentState,
    pub trigger: Trigger,
    /// Caller payload for this transition
    pub payload: &'a Payload,
    pub injectors: &'a InjectorRegistry,
    pub probes: &'a ProbeRegistry,
    pub leases: &'a TargetLeases,
    pub action_timeout: Duration,
}

impl TransitionContext<'_> {
    pub fn fault_request(&self) -> FaultRequest {
        FaultRequest::new(self.experiment_id, self.spec)
    }

    pub fn injector(&self) -> Result<Arc<dyn FaultInjector>, InjectorError> {
        self.injectors.resolve(&self.spec.fault.kind)
    }

    /// Call one injector phase under the action timeout
    pub async fn call_injector(&self, phase: FaultPhase) -> Result<(), InjectorError> {
        let injector = self.injector()?;
        let request = self.fault_request();
        let call = async {
            match phase {
                FaultPhase::Prepare => injector.prepare(&request).await,
                FaultPhase::Inject => injector.inject(&request).await,
                FaultPhase::Recover => injector.recover(&request).await,
            }
        };
        with_deadline(phase, self.action_timeout, call).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Deny(String),
}

impl GuardVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Predicate evaluated before a rule fires
#[async_trait]
pub trait Guard: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &TransitionContext<'_>) -> GuardVerdict;
}

/// Result of a successful action
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// Trigger to apply next within the same commit
    pub follow_up: Option<Trigger>,
    /// Merged into the event payload
    pub payload: Payload,
}

impl ActionOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn then(trigger: Trigger) -> Self {
        Self {
            follow_up: Some(trigger),
            payload: Payload::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }
}

/// Action could not run at all (nothing was attempted on the target)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl From<InjectorError> for ActionError {
    fn from(err: InjectorError) -> Self {
        Self(err.to_string())
    }
}

/// Side effect executed when a rule fires, before the commit
#[async_trait]
pub trait Action: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError>;
}

/// One row of the transition table
#[derive(Clone)]
pub struct TransitionRule {
    pub from: ExperimentState,
    pub trigger: Trigger,
    pub to: ExperimentState,
    pub guard: Option<Arc<dyn Guard>>,
    pub action: Option<Arc<dyn Action>>,
}

impl TransitionRule {
    pub fn new(from: ExperimentState, trigger: Trigger, to: ExperimentState) -> Self {
        Self {
            from,
            trigger,
            to,
            guard: None,
            action: None,
        }
    }
}

impl std::fmt::Debug for TransitionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionRule")
            .field("from", &self.from)
            .field("trigger", &self.trigger)
            .field("to", &self.to)
            .field("guard", &self.guard.as_ref().map(|g| g.name()))
            .field("action", &self.action.as_ref().map(|a| a.name()))
            .finish()
    }
}
