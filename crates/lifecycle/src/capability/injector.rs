//! FaultInjector capability and registry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::experiment::{ExperimentId, ExperimentSpec, FaultSpec, Target};

/// Errors surfaced by a fault injector
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InjectorError {
    #[error("no injector registered for fault kind '{0}'")]
    UnknownKind(String),

    #[error("invalid fault spec: {0}")]
    InvalidSpec(String),

    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        phase: FaultPhase,
        timeout: Duration,
    },

    #[error("{0}")]
    Failed(String),
}

/// Injector call being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPhase {
    Prepare,
    Inject,
    Recover,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prepare => "prepare",
            Self::Inject => "inject",
            Self::Recover => "recover",
        })
    }
}

/// Fault status as reported by the injector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultStatus {
    /// Nothing known for this experiment
    Inactive,
    Prepared,
    Active,
    Recovered,
    Unknown,
}

impl FaultStatus {
    /// No fault is applied to the target
    pub fn is_clear(self) -> bool {
        matches!(self, Self::Inactive | Self::Recovered)
    }
}

/// Everything an injector needs to act on one experiment
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRequest {
    pub experiment_id: ExperimentId,
    pub target: Target,
    pub fault: FaultSpec,
}

impl FaultRequest {
    pub fn new(experiment_id: &ExperimentId, spec: &ExperimentSpec) -> Self {
        Self {
            experiment_id: experiment_id.clone(),
            target: spec.target.clone(),
            fault: spec.fault.clone(),
        }
    }
}

/// One implementation per fault kind.
///
/// Calls must be idempotent per experiment: recovery after a crash may call
/// `recover` for a fault that was never applied.
#[async_trait]
pub trait FaultInjector: Send + Sync + 'static {
    /// Fault kind this injector handles (e.g. "latency", "pod-kill")
    fn kind(&self) -> &str;

    /// Check the fault spec against its target before anything is applied
    async fn validate(&self, _request: &FaultRequest) -> Result<(), InjectorError> {
        Ok(())
    }

    async fn prepare(&self, request: &FaultRequest) -> Result<(), InjectorError>;

    async fn inject(&self, request: &FaultRequest) -> Result<(), InjectorError>;

    async fn recover(&self, request: &FaultRequest) -> Result<(), InjectorError>;

    async fn status(&self, experiment_id: &ExperimentId) -> Result<FaultStatus, InjectorError>;
}

/// Fault kind -> injector, populated once at process start
#[derive(Clone, Default)]
pub struct InjectorRegistry {
    injectors: HashMap<String, Arc<dyn FaultInjector>>,
}

impl InjectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an injector under its own kind, replacing any previous one
    pub fn register(&mut self, injector: Arc<dyn FaultInjector>) -> &mut Self {
        self.injectors.insert(injector.kind().to_string(), injector);
        self
    }

    pub fn with(mut self, injector: Arc<dyn FaultInjector>) -> Self {
        self.register(injector);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn FaultInjector>> {
        self.injectors.get(kind).cloned()
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn FaultInjector>, InjectorError> {
        self.get(kind)
            .ok_or_else(|| InjectorError::UnknownKind(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.injectors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.injectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.injectors.is_empty()
    }
}

impl fmt::Debug for InjectorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Run an injector call under a deadline
pub(crate) async fn with_deadline<F>(
    phase: FaultPhase,
    timeout: Duration,
    call: F,
) -> Result<(), InjectorError>
where
    F: std::future::Future<Output = Result<(), InjectorError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(InjectorError::Timeout { phase, timeout }),
    }
}
