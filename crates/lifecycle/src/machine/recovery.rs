//! Startup recovery
//!
//! Rebuilds the engine from the event store and resolves transitions that
//! were interrupted by a crash. An interrupted transition is recognized by
//! its write-ahead intent (or by a committed in-progress state) and is
//! always driven to a terminal state, cleaning up the target on the way.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use super::engine::{holds_lease, Chain, Engine, EngineError, Slot};
use super::state::{ExperimentState, Trigger};
use crate::capability::{with_deadline, FaultPhase, FaultRequest};
use crate::event::Payload;
use crate::experiment::{Experiment, ExperimentId, ExperimentRecord};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Experiments loaded from the store
    pub loaded: usize,
    /// Loaded experiments not in a terminal state
    pub active: usize,
    /// Interrupted transitions and the state they were resolved to
    pub resolved: Vec<(ExperimentId, ExperimentState)>,
    /// Experiments that could not be loaded or resolved
    pub failed: Vec<(ExperimentId, String)>,
}

impl Engine {
    /// Load every experiment from the store and resolve interrupted
    /// transitions. Call once at startup before serving transitions.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let records = self.store.list_experiments().await?;
        let mut report = RecoveryReport::default();

        for record in records {
            let id = record.id.clone();
            let state = match self.store.replay(&self.table, &id).await {
                Ok(state) => state,
                Err(e) => {
                    error!(experiment_id = %id, error = %e, "replay failed, experiment not loaded");
                    report.failed.push((id, e.to_string()));
                    continue;
                }
            };
            if state != record.state {
                warn!(
                    experiment_id = %id,
                    row = %record.state,
                    log = %state,
                    "stored state disagrees with log, using log"
                );
            }

            let intent = record.in_flight;
            self.install(record, state);
            report.loaded += 1;
            if !state.is_terminal() {
                report.active += 1;
            }

            if intent.is_some() || state.is_in_progress() {
                match self.resolve_interrupted(&id, intent).await {
                    Ok(resolved) => report.resolved.push((id, resolved)),
                    Err(e) => {
                        error!(experiment_id = %id, error = %e, "failed to resolve interrupted transition");
                        report.failed.push((id, e.to_string()));
                    }
                }
            }
        }

        info!(
            loaded = report.loaded,
            active = report.active,
            resolved = report.resolved.len(),
            failed = report.failed.len(),
            "recovery complete"
        );
        Ok(report)
    }

    fn install(&self, record: ExperimentRecord, state: ExperimentState) {
        let id = record.id.clone();
        if holds_lease(state) {
            if let Err(holder) = self.leases.try_acquire(&id, &record.spec.target) {
                warn!(experiment_id = %id, %holder, "recovered experiment overlaps another lease");
            }
        }

        self.views.insert(
            id.clone(),
            Experiment {
                id: id.clone(),
                name: record.spec.name.clone(),
                target: record.spec.target.clone(),
                state,
                pending_state: None,
                sequence: record.sequence,
                created_at: record.created_at,
                last_transition_at: record.updated_at,
            },
        );
        self.slots.insert(
            id,
            Arc::new(Mutex::new(Slot {
                spec: record.spec,
                state,
                sequence: record.sequence,
            })),
        );
    }

    /// Drive an interrupted transition to a terminal state.
    ///
    /// The interrupted trigger is recorded first in the commit. A revert
    /// that the injector now confirms completes; anything else fails through
    /// the table's `Fail` rule, whose action cleans up the target.
    async fn resolve_interrupted(
        &self,
        id: &ExperimentId,
        intent: Option<Trigger>,
    ) -> Result<ExperimentState, EngineError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        let from = slot.state;
        let spec = slot.spec.clone();

        let mut payload = Payload::new();
        payload.insert("interrupted".into(), true.into());

        let (entering, triggers) = match intent {
            Some(trigger) => match self.table.rule(from, trigger) {
                Some(rule) => (rule.to, vec![trigger]),
                None => {
                    warn!(experiment_id = %id, %from, %trigger, "stale intent dropped");
                    self.store.set_in_flight(id, None).await?;
                    return Ok(from);
                }
            },
            None => (from, vec![]),
        };
        if let Some(trigger) = intent {
            payload.insert("interrupted_trigger".into(), trigger.to_string().into());
        }

        let next = if entering == ExperimentState::Reverting {
            let request = FaultRequest::new(id, &spec);
            let recovered = match self.injectors.resolve(&spec.fault.kind) {
                Ok(injector) => {
                    let timeout = self.config.action_timeout;
                    with_deadline(FaultPhase::Recover, timeout, injector.recover(&request)).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = recovered {
                payload.insert("error".into(), e.to_string().into());
                payload.insert("failed_phase".into(), FaultPhase::Recover.to_string().into());
            }
            Trigger::RevertDone
        } else {
            Trigger::Fail
        };

        if !self.table.can_transition(entering, next) && !entering.is_in_progress() {
            // Interrupted before an action with no in-progress state to leave
            self.store.set_in_flight(id, None).await?;
            return Ok(from);
        }

        let mut chain = Chain {
            to: entering,
            triggers,
            payload: payload.clone(),
        };
        self.follow_up(id, &spec, &payload, &mut chain, Some(next))
            .await;

        warn!(
            experiment_id = %id,
            %from,
            to = %chain.to,
            "resolving interrupted transition"
        );
        let event = self.commit(id, &mut slot, from, chain).await?;
        Ok(event.to_state)
    }
}
