//! In-memory fault injector
//!
//! Tracks fault status per experiment without touching any real system.
//! Phases can be scripted to fail, which makes it the injector of choice for
//! tests and for dry runs of a workflow.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::injector::{FaultInjector, FaultPhase, FaultRequest, FaultStatus, InjectorError};
use crate::experiment::ExperimentId;

pub struct SimulatedInjector {
    kind: String,
    latency: Option<Duration>,
    faults: Mutex<HashMap<ExperimentId, FaultStatus>>,
    failing: Mutex<HashSet<FaultPhase>>,
    calls: Mutex<Vec<(FaultPhase, ExperimentId)>>,
}

impl SimulatedInjector {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            latency: None,
            faults: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(vec![]),
        }
    }

    /// Delay every prepare/inject/recover call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call of `phase` fail until [`Self::heal`] is called
    pub fn fail_on(&self, phase: FaultPhase) {
        self.failing.lock().insert(phase);
    }

    pub fn heal(&self, phase: FaultPhase) {
        self.failing.lock().remove(&phase);
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<(FaultPhase, ExperimentId)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, experiment_id: &ExperimentId) -> Vec<FaultPhase> {
        self.calls
            .lock()
            .iter()
            .filter(|(_, id)| id == experiment_id)
            .map(|(phase, _)| *phase)
            .collect()
    }

    /// Number of experiments with a fault currently applied
    pub fn active_faults(&self) -> usize {
        self.faults
            .lock()
            .values()
            .filter(|status| **status == FaultStatus::Active)
            .count()
    }

    /// Force a status, e.g. to simulate a fault applied before a crash
    pub fn set_status(&self, experiment_id: &ExperimentId, status: FaultStatus) {
        self.faults.lock().insert(experiment_id.clone(), status);
    }

    async fn run(
        &self,
        phase: FaultPhase,
        request: &FaultRequest,
        on_success: FaultStatus,
    ) -> Result<(), InjectorError> {
        self.calls
            .lock()
            .push((phase, request.experiment_id.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.failing.lock().contains(&phase) {
            debug!(experiment_id = %request.experiment_id, %phase, "simulated failure");
            return Err(InjectorError::Failed(format!(
                "simulated {phase} failure for {}",
                request.target
            )));
        }

        self.faults
            .lock()
            .insert(request.experiment_id.clone(), on_success);
        debug!(experiment_id = %request.experiment_id, %phase, status = ?on_success, "simulated call");
        Ok(())
    }
}

#[async_trait]
impl FaultInjector for SimulatedInjector {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn validate(&self, request: &FaultRequest) -> Result<(), InjectorError> {
        if request.fault.params.is_null() || request.fault.params.is_object() {
            Ok(())
        } else {
            Err(InjectorError::InvalidSpec(
                "params must be an object".to_string(),
            ))
        }
    }

    async fn prepare(&self, request: &FaultRequest) -> Result<(), InjectorError> {
        self.run(FaultPhase::Prepare, request, FaultStatus::Prepared)
            .await
    }

    async fn inject(&self, request: &FaultRequest) -> Result<(), InjectorError> {
        self.run(FaultPhase::Inject, request, FaultStatus::Active)
            .await
    }

    async fn recover(&self, request: &FaultRequest) -> Result<(), InjectorError> {
        self.run(FaultPhase::Recover, request, FaultStatus::Recovered)
            .await
    }

    async fn status(&self, experiment_id: &ExperimentId) -> Result<FaultStatus, InjectorError> {
        Ok(self
            .faults
            .lock()
            .get(experiment_id)
            .copied()
            .unwrap_or(FaultStatus::Inactive))
    }
}
