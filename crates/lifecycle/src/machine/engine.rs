//! State machine engine
//!
//! Single source of truth for the state of every experiment. A transition
//! runs under the experiment's own lock:
//!
//! 1. look up the rule for `(state, trigger)` and evaluate its guard
//! 2. persist a write-ahead intent if the rule has an action
//! 3. run the action; its follow-up trigger (and any further ones) are
//!    applied in the same commit, staged as `pending_state`
//! 4. append one event; only then does the committed state change
//! 5. publish the event on `experiments.<id>`
//!
//! A rejected first step changes nothing. A failure after the first step
//! falls back to the table's `Fail` rule so a started side effect never ends
//! in a non-terminal state.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::lease::TargetLeases;
use super::rule::{GuardVerdict, TransitionContext};
use super::state::{ExperimentState, Trigger};
use super::table::TransitionTable;
use crate::bus::{DeadLetter, EventBus};
use crate::capability::{InjectorRegistry, ProbeRegistry};
use crate::config::EngineConfig;
use crate::event::{EventType, ExperimentEvent, NewEvent, Payload};
use crate::experiment::{Experiment, ExperimentId, ExperimentRecord, ExperimentSpec};
use crate::persistence::{ExperimentEventStore, ReplayError, StoreError};

/// Upper bound on rules applied by one commit
const MAX_CHAIN_STEPS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// `(state, trigger)` not in the table, or the guard denied it
    #[error("{trigger} rejected for {experiment_id} in state {state}: {reason}")]
    GuardRejected {
        experiment_id: ExperimentId,
        state: ExperimentState,
        trigger: Trigger,
        reason: String,
    },

    /// The rule's action could not run; nothing was committed
    #[error("action {action} failed for {experiment_id} on {trigger} in state {state}: {reason}")]
    ActionFailure {
        experiment_id: ExperimentId,
        state: ExperimentState,
        trigger: Trigger,
        action: String,
        reason: String,
    },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    #[error("experiment already exists: {0}")]
    AlreadyExists(ExperimentId),

    #[error("invalid experiment id: '{0}'")]
    InvalidId(String),

    #[error("replay failed: {0}")]
    Replay(#[from] ReplayError),
}

/// Per-experiment state guarded by the experiment lock
pub(super) struct Slot {
    pub(super) spec: ExperimentSpec,
    pub(super) state: ExperimentState,
    /// 0 until the `experiment.created` event is durable
    pub(super) sequence: u64,
}

/// Result of running a trigger chain, ready to be committed
pub(super) struct Chain {
    pub(super) to: ExperimentState,
    pub(super) triggers: Vec<Trigger>,
    pub(super) payload: Payload,
}

/// Experiments between `Prepare` and a terminal state hold a target lease
pub(super) fn holds_lease(state: ExperimentState) -> bool {
    state != ExperimentState::Idle && !state.is_terminal()
}

pub struct Engine {
    pub(super) table: Arc<TransitionTable>,
    pub(super) store: Arc<dyn ExperimentEventStore>,
    pub(super) bus: Arc<dyn EventBus>,
    pub(super) injectors: InjectorRegistry,
    pub(super) probes: ProbeRegistry,
    pub(super) leases: TargetLeases,
    pub(super) config: EngineConfig,
    pub(super) slots: DashMap<ExperimentId, Arc<Mutex<Slot>>>,
    pub(super) views: DashMap<ExperimentId, Experiment>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ExperimentEventStore>,
        bus: Arc<dyn EventBus>,
        injectors: InjectorRegistry,
    ) -> Self {
        Self {
            table: Arc::new(TransitionTable::standard()),
            store,
            bus,
            injectors,
            probes: ProbeRegistry::new(),
            leases: TargetLeases::new(),
            config: EngineConfig::default(),
            slots: DashMap::new(),
            views: DashMap::new(),
        }
    }

    pub fn with_probes(mut self, probes: ProbeRegistry) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_table(mut self, table: TransitionTable) -> Self {
        self.table = Arc::new(table);
        self
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn probes(&self) -> &ProbeRegistry {
        &self.probes
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn ExperimentEventStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn leases(&self) -> &TargetLeases {
        &self.leases
    }

    /// Whether `(state, trigger)` is in the transition table
    pub fn can_transition(&self, state: ExperimentState, trigger: Trigger) -> bool {
        self.table.can_transition(state, trigger)
    }

    pub async fn create_experiment(&self, spec: ExperimentSpec) -> Result<Experiment, EngineError> {
        self.create_experiment_with_id(ExperimentId::generate(), spec)
            .await
    }

    /// Create an experiment in `Idle` and record `experiment.created`
    #[instrument(skip(self, spec), fields(experiment_id = %id))]
    pub async fn create_experiment_with_id(
        &self,
        id: ExperimentId,
        spec: ExperimentSpec,
    ) -> Result<Experiment, EngineError> {
        if !id.is_valid() {
            return Err(EngineError::InvalidId(id.to_string()));
        }

        let now = Utc::now();
        let slot = Arc::new(Mutex::new(Slot {
            spec: spec.clone(),
            state: ExperimentState::Idle,
            sequence: 0,
        }));
        // Uncontended: nobody else can see the slot yet
        let mut guard = slot.clone().lock_owned().await;

        match self.slots.entry(id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }

        let record = ExperimentRecord {
            id: id.clone(),
            spec: spec.clone(),
            state: ExperimentState::Idle,
            sequence: 0,
            in_flight: None,
            created_at: now,
            updated_at: now,
        };
        let mut payload = Payload::new();
        payload.insert("name".into(), spec.name.clone().into());
        payload.insert("target".into(), spec.target.to_string().into());
        payload.insert("fault".into(), spec.fault.kind.clone().into());

        let event = match self
            .store
            .create_experiment(record, NewEvent::created(id.clone(), payload))
            .await
        {
            Ok(event) => event,
            Err(e) => {
                self.slots.remove(&id);
                return Err(match e {
                    StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
                    other => EngineError::Persistence(other),
                });
            }
        };

        guard.sequence = event.sequence;
        let experiment = Experiment {
            id: id.clone(),
            name: spec.name.clone(),
            target: spec.target.clone(),
            state: ExperimentState::Idle,
            pending_state: None,
            sequence: event.sequence,
            created_at: now,
            last_transition_at: event.timestamp,
        };
        self.views.insert(id.clone(), experiment.clone());

        info!(experiment_id = %id, name = %spec.name, target = %spec.target, "experiment created");
        self.publish(&event).await;
        Ok(experiment)
    }

    /// Apply `trigger` to an experiment and return its new committed state
    #[instrument(skip(self, payload), fields(experiment_id = %id, %trigger))]
    pub async fn transition(
        &self,
        id: &ExperimentId,
        trigger: Trigger,
        payload: Payload,
    ) -> Result<ExperimentState, EngineError> {
        let slot = self.slot(id)?;
        let mut slot = slot.lock().await;
        if slot.sequence == 0 {
            return Err(EngineError::NotFound(id.clone()));
        }

        let event = self.execute(id, &mut slot, trigger, payload).await?;
        Ok(event.to_state)
    }

    /// Committed state of an experiment
    pub fn state(&self, id: &ExperimentId) -> Result<ExperimentState, EngineError> {
        self.views
            .get(id)
            .map(|view| view.state)
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    pub fn experiment(&self, id: &ExperimentId) -> Option<Experiment> {
        self.views.get(id).map(|view| view.clone())
    }

    pub fn experiments(&self) -> Vec<Experiment> {
        let mut experiments: Vec<Experiment> =
            self.views.iter().map(|view| view.value().clone()).collect();
        experiments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        experiments
    }

    /// Lazily read an experiment's log from `from_sequence`
    pub fn events(
        &self,
        id: &ExperimentId,
        from_sequence: u64,
    ) -> BoxStream<'_, Result<ExperimentEvent, StoreError>> {
        self.store.read(id.clone(), from_sequence)
    }

    /// Rebuild an experiment's state from its log without touching the engine
    pub async fn replay(&self, id: &ExperimentId) -> Result<ExperimentState, EngineError> {
        Ok(self.store.replay(&self.table, id).await?)
    }

    /// Drop terminal experiments older than the retention window, along
    /// with bus messages and idle bus cursors older than the same cutoff.
    ///
    /// A bus failure is logged and leaves the store purge in place.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<Vec<ExperimentId>, EngineError> {
        let cutoff = self.config.retention.cutoff(Utc::now());
        let purged = self.store.purge_expired(cutoff).await?;
        for id in &purged {
            self.slots.remove(id);
            self.views.remove(id);
        }
        if !purged.is_empty() {
            info!(count = purged.len(), %cutoff, "purged expired experiments");
        }
        if let Err(e) = self.bus.purge_before(cutoff).await {
            error!(%cutoff, error = %e, "failed to purge bus");
        }
        Ok(purged)
    }

    pub(super) fn slot(&self, id: &ExperimentId) -> Result<Arc<Mutex<Slot>>, EngineError> {
        self.slots
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| EngineError::NotFound(id.clone()))
    }

    pub(super) fn context<'a>(
        &'a self,
        id: &'a ExperimentId,
        spec: &'a ExperimentSpec,
        from: ExperimentState,
        trigger: Trigger,
        payload: &'a Payload,
    ) -> TransitionContext<'a> {
        TransitionContext {
            experiment_id: id,
            spec,
            from,
            trigger,
            payload,
            injectors: &self.injectors,
            probes: &self.probes,
            leases: &self.leases,
            action_timeout: self.config.action_timeout,
        }
    }

    fn set_pending(&self, id: &ExperimentId, pending: Option<ExperimentState>) {
        if let Some(mut view) = self.views.get_mut(id) {
            view.pending_state = pending;
        }
    }

    fn release_lease_unless_held(&self, id: &ExperimentId, state: ExperimentState) {
        if !holds_lease(state) && self.leases.release(id) {
            debug!(experiment_id = %id, "target lease released");
        }
    }

    /// Caller-initiated transition: first step is strict, the rest falls back to `Fail`
    async fn execute(
        &self,
        id: &ExperimentId,
        slot: &mut Slot,
        trigger: Trigger,
        payload: Payload,
    ) -> Result<ExperimentEvent, EngineError> {
        let from = slot.state;
        let spec = slot.spec.clone();

        let rule = self
            .table
            .rule(from, trigger)
            .ok_or_else(|| EngineError::GuardRejected {
                experiment_id: id.clone(),
                state: from,
                trigger,
                reason: format!("no transition from {from} on {trigger}"),
            })?;

        let ctx = self.context(id, &spec, from, trigger, &payload);

        if let Some(guard) = &rule.guard {
            if let GuardVerdict::Deny(reason) = guard.check(&ctx).await {
                self.release_lease_unless_held(id, from);
                debug!(experiment_id = %id, guard = guard.name(), %reason, "guard denied");
                return Err(EngineError::GuardRejected {
                    experiment_id: id.clone(),
                    state: from,
                    trigger,
                    reason: format!("{}: {reason}", guard.name()),
                });
            }
        }

        if rule.action.is_some() {
            if let Err(e) = self.store.set_in_flight(id, Some(trigger)).await {
                self.release_lease_unless_held(id, from);
                return Err(EngineError::Persistence(e));
            }
        }

        let mut chain = Chain {
            to: rule.to,
            triggers: vec![trigger],
            payload: payload.clone(),
        };
        self.set_pending(id, Some(rule.to));

        let mut next = None;
        if let Some(action) = &rule.action {
            match action.run(&ctx).await {
                Ok(outcome) => {
                    chain.payload.extend(outcome.payload);
                    next = outcome.follow_up;
                }
                Err(e) => {
                    self.set_pending(id, None);
                    if let Err(clear) = self.store.set_in_flight(id, None).await {
                        warn!(experiment_id = %id, error = %clear, "failed to clear intent");
                    }
                    self.release_lease_unless_held(id, from);
                    return Err(EngineError::ActionFailure {
                        experiment_id: id.clone(),
                        state: from,
                        trigger,
                        action: action.name().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.follow_up(id, &spec, &payload, &mut chain, next).await;
        self.commit(id, slot, from, chain).await
    }

    /// Apply follow-up triggers until none is left.
    ///
    /// Any failure (missing rule, denied guard, failed action) is replaced by
    /// `Fail` from the current state, with the cause in the payload.
    pub(super) async fn follow_up(
        &self,
        id: &ExperimentId,
        spec: &ExperimentSpec,
        caller_payload: &Payload,
        chain: &mut Chain,
        mut next: Option<Trigger>,
    ) {
        let mut steps = 0;
        while let Some(trigger) = next.take() {
            steps += 1;
            if steps > MAX_CHAIN_STEPS {
                error!(experiment_id = %id, state = %chain.to, "trigger chain too long, stopping");
                break;
            }

            let state = chain.to;
            let failure = match self.table.rule(state, trigger) {
                None => Some(format!("no transition from {state} on {trigger}")),
                Some(rule) => {
                    let ctx = self.context(id, spec, state, trigger, caller_payload);
                    let verdict = match &rule.guard {
                        Some(guard) => match guard.check(&ctx).await {
                            GuardVerdict::Allow => None,
                            GuardVerdict::Deny(reason) => Some(format!("{}: {reason}", guard.name())),
                        },
                        None => None,
                    };

                    match verdict {
                        Some(denied) => Some(denied),
                        None => {
                            chain.to = rule.to;
                            chain.triggers.push(trigger);
                            if let Some(action) = &rule.action {
                                match action.run(&ctx).await {
                                    Ok(outcome) => {
                                        chain.payload.extend(outcome.payload);
                                        next = outcome.follow_up;
                                    }
                                    Err(e) => {
                                        chain.payload.insert(
                                            "action_error".into(),
                                            format!("{}: {e}", action.name()).into(),
                                        );
                                        if chain.to.is_in_progress()
                                            && self.table.can_transition(chain.to, Trigger::Fail)
                                        {
                                            next = Some(Trigger::Fail);
                                        }
                                    }
                                }
                            }
                            None
                        }
                    }
                }
            };

            if let Some(cause) = failure {
                warn!(experiment_id = %id, %state, %trigger, %cause, "follow-up rejected, failing");
                chain.payload.insert("cause".into(), cause.into());
                if trigger != Trigger::Fail && self.table.can_transition(state, Trigger::Fail) {
                    next = Some(Trigger::Fail);
                }
            }

            if chain.to.is_in_progress() {
                self.set_pending(id, Some(chain.to));
            }
        }

        if chain.to.is_in_progress() {
            warn!(experiment_id = %id, state = %chain.to, "committing an in-progress state");
        }
    }

    /// Append the chain as one event, then apply and publish it
    pub(super) async fn commit(
        &self,
        id: &ExperimentId,
        slot: &mut Slot,
        from: ExperimentState,
        chain: Chain,
    ) -> Result<ExperimentEvent, EngineError> {
        let first = chain.triggers.first().copied().unwrap_or(Trigger::Fail);
        let event_type = EventType::for_commit(first, chain.to);
        let new_event = NewEvent {
            experiment_id: id.clone(),
            event_type,
            from_state: from,
            to_state: chain.to,
            triggers: chain.triggers,
            payload: chain.payload,
        };

        let event = match self.store.append(new_event, slot.sequence).await {
            Ok(event) => event,
            Err(e) => {
                self.set_pending(id, None);
                self.release_lease_unless_held(id, from);
                error!(
                    experiment_id = %id,
                    %from,
                    error = %e,
                    "append failed, transition not committed"
                );
                return Err(EngineError::Persistence(e));
            }
        };

        slot.state = event.to_state;
        slot.sequence = event.sequence;
        if let Some(mut view) = self.views.get_mut(id) {
            view.state = event.to_state;
            view.pending_state = None;
            view.sequence = event.sequence;
            view.last_transition_at = event.timestamp;
        }
        self.release_lease_unless_held(id, event.to_state);

        info!(
            experiment_id = %id,
            from = %event.from_state,
            to = %event.to_state,
            event_type = %event.event_type,
            sequence = event.sequence,
            "transition committed"
        );

        self.publish(&event).await;
        Ok(event)
    }

    /// Publish with retries; exhaustion dead-letters but never fails the commit
    async fn publish(&self, event: &ExperimentEvent) {
        let topic = event.topic();
        let policy = &self.config.publish_retry;
        let mut attempt = 1;

        loop {
            let err = match self.bus.publish(&topic, event).await {
                Ok(()) => return,
                Err(err) => err,
            };

            if err.is_retryable() && policy.has_attempts_remaining(attempt) {
                attempt += 1;
                warn!(%topic, sequence = event.sequence, attempt, error = %err, "publish failed, retrying");
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                continue;
            }

            error!(
                %topic,
                sequence = event.sequence,
                attempts = attempt,
                error = %err,
                "publish failed, dead-lettering event"
            );
            let dead = DeadLetter {
                subscription: None,
                topic: topic.clone(),
                event: event.clone(),
                attempts: attempt,
                last_error: err.to_string(),
                dead_at: Utc::now(),
            };
            if let Err(e) = self.bus.publish_dead_letter(dead).await {
                error!(%topic, sequence = event.sequence, error = %e, "failed to record dead letter");
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::TryStreamExt;

    use super::*;
    use crate::bus::{BusError, InMemoryEventBus};
    use crate::capability::{FaultPhase, SimulatedInjector, StaticProbe};
    use crate::experiment::{FaultSpec, ProbePhase, Target};
    use crate::persistence::InMemoryExperimentStore;
    use crate::reliability::RetryPolicy;

    struct Fixture {
        engine: Engine,
        store: Arc<InMemoryExperimentStore>,
        bus: Arc<InMemoryEventBus>,
        injector: Arc<SimulatedInjector>,
        health: Arc<StaticProbe>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryExperimentStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let injector = Arc::new(SimulatedInjector::new("latency"));
        let health = Arc::new(StaticProbe::passing());

        let engine = Engine::new(
            store.clone(),
            bus.clone(),
            InjectorRegistry::new().with(injector.clone()),
        )
        .with_probes(ProbeRegistry::new().with("health", health.clone()))
        .with_config(
            EngineConfig::default()
                .with_action_timeout(Duration::from_millis(200))
                .with_publish_retry(RetryPolicy::fixed(Duration::from_millis(1), 2)),
        );

        Fixture {
            engine,
            store,
            bus,
            injector,
            health,
        }
    }

    fn spec(app: &str) -> ExperimentSpec {
        ExperimentSpec::new(
            format!("{app}-latency"),
            Target::new("prod", "pod").with_label("app", app),
            FaultSpec::new("latency"),
        )
        .with_probe("health", ProbePhase::Before)
    }

    async fn events(f: &Fixture, id: &ExperimentId) -> Vec<ExperimentEvent> {
        f.engine.events(id, 1).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_full_lifecycle_commits_four_events() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();

        assert_eq!(
            f.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap(),
            ExperimentState::Ready
        );
        assert_eq!(
            f.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap(),
            ExperimentState::Injected
        );
        assert_eq!(
            f.engine.transition(&id, Trigger::Revert, Payload::new()).await.unwrap(),
            ExperimentState::Completed
        );

        let log = events(&f, &id).await;
        let types: Vec<_> = log.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::ExperimentCreated,
                EventType::FaultPrepared,
                EventType::FaultInjected,
                EventType::FaultReverted
            ]
        );
        assert_eq!(log.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(f.engine.replay(&id).await.unwrap(), ExperimentState::Completed);
        assert_eq!(f.bus.published("experiments.exp-1").len(), 4);
        assert!(f.engine.leases().is_empty());
    }

    #[tokio::test]
    async fn test_pair_missing_from_table_is_rejected() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();

        let result = f.engine.transition(&id, Trigger::Revert, Payload::new()).await;
        assert!(matches!(result, Err(EngineError::GuardRejected { state: ExperimentState::Idle, .. })));
        assert_eq!(f.engine.state(&id).unwrap(), ExperimentState::Idle);
        assert_eq!(f.store.event_count(&id), 1);
    }

    #[tokio::test]
    async fn test_failing_before_probe_fails_experiment() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();
        f.health.set(false);

        let state = f.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
        assert_eq!(state, ExperimentState::Failed);

        let last = events(&f, &id).await.pop().unwrap();
        assert_eq!(last.event_type, EventType::FaultFailed);
        assert_eq!(last.triggers, vec![Trigger::Prepare, Trigger::Fail]);
        assert!(last.payload["cause"].as_str().unwrap().contains("before_probes_pass"));
        // Cleanup ran against the prepared fault
        assert_eq!(
            f.injector.calls_for(&id),
            vec![FaultPhase::Prepare, FaultPhase::Recover]
        );
    }

    #[tokio::test]
    async fn test_inject_failure_cleans_up() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();
        f.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();

        f.injector.fail_on(FaultPhase::Inject);
        let state = f.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();
        assert_eq!(state, ExperimentState::Failed);
        assert_eq!(f.injector.active_faults(), 0);

        let last = events(&f, &id).await.pop().unwrap();
        assert_eq!(last.payload["failed_phase"], "inject");
        assert_eq!(last.payload["cleanup"], "recovered");
    }

    #[tokio::test]
    async fn test_failed_recovery_flags_manual_remediation() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();
        f.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
        f.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();

        f.injector.fail_on(FaultPhase::Recover);
        let state = f.engine.transition(&id, Trigger::Revert, Payload::new()).await.unwrap();
        assert_eq!(state, ExperimentState::Failed);

        let last = events(&f, &id).await.pop().unwrap();
        assert_eq!(last.triggers, vec![Trigger::Revert, Trigger::Fail]);
        assert_eq!(last.payload["manual_remediation"], true);
    }

    #[tokio::test]
    async fn test_overlapping_target_is_rejected_until_released() {
        let f = fixture();
        let a = ExperimentId::from("exp-a");
        let b = ExperimentId::from("exp-b");
        f.engine.create_experiment_with_id(a.clone(), spec("checkout")).await.unwrap();
        f.engine.create_experiment_with_id(b.clone(), spec("checkout")).await.unwrap();

        f.engine.transition(&a, Trigger::Prepare, Payload::new()).await.unwrap();
        let rejected = f.engine.transition(&b, Trigger::Prepare, Payload::new()).await;
        assert!(matches!(rejected, Err(EngineError::GuardRejected { .. })));
        assert_eq!(f.store.event_count(&b), 1);

        f.engine.transition(&a, Trigger::Cancel, Payload::new()).await.unwrap();
        assert_eq!(
            f.engine.transition(&b, Trigger::Prepare, Payload::new()).await.unwrap(),
            ExperimentState::Ready
        );
    }

    #[tokio::test]
    async fn test_unknown_fault_kind_is_action_failure() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        let spec = ExperimentSpec::new("cpu", Target::new("prod", "node"), FaultSpec::new("cpu-hog"));
        f.engine.create_experiment_with_id(id.clone(), spec).await.unwrap();

        let result = f.engine.transition(&id, Trigger::Prepare, Payload::new()).await;
        assert!(matches!(result, Err(EngineError::ActionFailure { .. })));
        assert_eq!(f.engine.state(&id).unwrap(), ExperimentState::Idle);
        assert!(f.engine.leases().is_empty());
        assert_eq!(f.store.get_experiment(&id).await.unwrap().in_flight, None);
    }

    #[tokio::test]
    async fn test_append_failure_keeps_prior_state() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();

        f.store.fail_next_append();
        let result = f.engine.transition(&id, Trigger::Prepare, Payload::new()).await;
        assert!(matches!(result, Err(EngineError::Persistence(_))));
        assert_eq!(f.engine.state(&id).unwrap(), ExperimentState::Idle);
        assert_eq!(f.engine.experiment(&id).unwrap().pending_state, None);
        assert_eq!(f.store.event_count(&id), 1);
        // Intent survives for crash recovery
        assert_eq!(
            f.store.get_experiment(&id).await.unwrap().in_flight,
            Some(Trigger::Prepare)
        );

        // Retry succeeds against the idempotent injector
        assert_eq!(
            f.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap(),
            ExperimentState::Ready
        );
    }

    #[tokio::test]
    async fn test_publish_exhaustion_dead_letters_but_commits() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();

        f.bus.fail_next_publishes(2);
        let state = f.engine.transition(&id, Trigger::Cancel, Payload::new()).await.unwrap();
        assert_eq!(state, ExperimentState::Cancelled);
        assert_eq!(f.store.event_count(&id), 2);

        let dead = f.bus.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].subscription, None);
        assert_eq!(dead[0].event.event_type, EventType::ExperimentCancelled);
    }

    #[tokio::test]
    async fn test_closed_bus_dead_letters_without_retrying() {
        let store = Arc::new(InMemoryExperimentStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let engine = Engine::new(
            store.clone(),
            bus.clone(),
            InjectorRegistry::new().with(Arc::new(SimulatedInjector::new("latency"))),
        )
        .with_config(
            EngineConfig::default()
                .with_publish_retry(RetryPolicy::fixed(Duration::from_secs(30), 5)),
        );
        let id = ExperimentId::from("exp-1");
        engine.create_experiment_with_id(id.clone(), spec("checkout")).await.unwrap();

        bus.shutdown().await;
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            engine.transition(&id, Trigger::Cancel, Payload::new()),
        )
        .await
        .expect("publish retried against a closed bus")
        .unwrap();
        assert_eq!(state, ExperimentState::Cancelled);
        assert_eq!(store.event_count(&id), 2);

        let dead = bus.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert_eq!(dead[0].last_error, BusError::Closed.to_string());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_ids() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("a")).await.unwrap();

        assert!(matches!(
            f.engine.create_experiment_with_id(id, spec("b")).await,
            Err(EngineError::AlreadyExists(_))
        ));
        assert!(matches!(
            f.engine.create_experiment_with_id(ExperimentId::from("exp.1"), spec("c")).await,
            Err(EngineError::InvalidId(_))
        ));
        assert!(matches!(
            f.engine
                .transition(&ExperimentId::from("missing"), Trigger::Prepare, Payload::new())
                .await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_caller_payload_is_recorded() {
        let f = fixture();
        let id = ExperimentId::from("exp-1");
        f.engine.create_experiment_with_id(id.clone(), spec("a")).await.unwrap();

        let mut payload = Payload::new();
        payload.insert("operator".into(), "alice".into());
        f.engine.transition(&id, Trigger::Cancel, payload).await.unwrap();

        let last = events(&f, &id).await.pop().unwrap();
        assert_eq!(last.payload["operator"], "alice");
    }
}
