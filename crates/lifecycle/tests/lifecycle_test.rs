//! Engine, event store and event bus working together (in-memory transports)

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use faultline_lifecycle::capability::{FaultPhase, SimulatedInjector, StaticProbe};
use faultline_lifecycle::prelude::*;

struct Harness {
    engine: Engine,
    store: Arc<InMemoryExperimentStore>,
    bus: Arc<InMemoryEventBus>,
    injector: Arc<SimulatedInjector>,
}

fn harness() -> Harness {
    let store = Arc::new(InMemoryExperimentStore::new());
    let bus = Arc::new(InMemoryEventBus::new());
    let injector = Arc::new(SimulatedInjector::new("latency"));

    let engine = Engine::new(
        store.clone(),
        bus.clone(),
        InjectorRegistry::new().with(injector.clone()),
    )
    .with_probes(ProbeRegistry::new().with("health", Arc::new(StaticProbe::passing())))
    .with_config(EngineConfig::default().with_action_timeout(Duration::from_secs(1)));

    Harness {
        engine,
        store,
        bus,
        injector,
    }
}

fn checkout_spec() -> ExperimentSpec {
    ExperimentSpec::new(
        "checkout-latency",
        Target::new("prod", "pod").with_label("app", "checkout"),
        FaultSpec::new("latency").with_params(json!({"delay_ms": 250})),
    )
    .with_probe("health", ProbePhase::Before)
    .with_probe("health", ProbePhase::After)
}

async fn log(h: &Harness, id: &ExperimentId) -> Vec<ExperimentEvent> {
    h.engine.events(id, 1).try_collect().await.unwrap()
}

#[test_log::test(tokio::test)]
async fn test_exp1_lifecycle_scenario() {
    let h = harness();
    let id = ExperimentId::from("exp-1");
    let created = h
        .engine
        .create_experiment_with_id(id.clone(), checkout_spec())
        .await
        .unwrap();
    assert_eq!(created.state, ExperimentState::Idle);

    let state = h.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Ready);
    let state = h.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Injected);
    let state = h.engine.transition(&id, Trigger::Revert, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Completed);

    let events = log(&h, &id).await;
    assert_eq!(events.len(), 4);
    assert_eq!(
        events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(events[1].from_state, ExperimentState::Idle);
    assert_eq!(events[1].to_state, ExperimentState::Ready);
    assert_eq!(events[1].triggers, vec![Trigger::Prepare, Trigger::PrepareDone]);
    assert_eq!(events[2].triggers, vec![Trigger::Inject, Trigger::InjectDone]);
    assert_eq!(events[3].triggers, vec![Trigger::Revert, Trigger::RevertDone]);
    assert_eq!(events[3].event_type, EventType::FaultReverted);
    assert!(events[3].payload["after_probes"]["health"]["passed"].as_bool().unwrap());

    assert_eq!(
        h.injector.calls_for(&id),
        vec![FaultPhase::Prepare, FaultPhase::Inject, FaultPhase::Recover]
    );
    let snapshot = h.engine.experiment(&id).unwrap();
    assert_eq!(snapshot.sequence, 4);
    assert_eq!(snapshot.pending_state, None);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let h = harness();
    let id = ExperimentId::from("exp-1");
    h.engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();
    h.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    h.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();

    let current = h.engine.state(&id).unwrap();
    for _ in 0..3 {
        assert_eq!(h.engine.replay(&id).await.unwrap(), current);
    }
    assert_eq!(h.store.event_count(&id), 3);
}

#[tokio::test]
async fn test_pairs_missing_from_table_leave_state_and_log_unchanged() {
    let h = harness();
    let table = TransitionTable::standard();

    // Reach every state that can be committed
    let plans: [(&str, &[Trigger]); 5] = [
        ("idle", &[]),
        ("ready", &[Trigger::Prepare]),
        ("injected", &[Trigger::Prepare, Trigger::Inject]),
        ("completed", &[Trigger::Prepare, Trigger::Inject, Trigger::Revert]),
        ("cancelled", &[Trigger::Cancel]),
    ];

    for (i, (name, triggers)) in plans.iter().enumerate() {
        let id = ExperimentId::from(format!("exp-{name}"));
        let spec = ExperimentSpec::new(
            *name,
            Target::new("prod", "pod").with_label("app", format!("app-{i}")),
            FaultSpec::new("latency"),
        );
        h.engine.create_experiment_with_id(id.clone(), spec).await.unwrap();
        for trigger in *triggers {
            h.engine.transition(&id, *trigger, Payload::new()).await.unwrap();
        }

        let state = h.engine.state(&id).unwrap();
        let before = h.store.event_count(&id);
        for trigger in Trigger::ALL {
            if table.can_transition(state, trigger) {
                continue;
            }
            let result = h.engine.transition(&id, trigger, Payload::new()).await;
            assert!(
                matches!(result, Err(EngineError::GuardRejected { .. })),
                "{state} + {trigger} should be rejected, got {result:?}"
            );
            assert_eq!(h.engine.state(&id).unwrap(), state);
            assert_eq!(h.store.event_count(&id), before);
        }
    }
}

#[tokio::test]
async fn test_denied_guard_appends_nothing() {
    let h = harness();
    let id = ExperimentId::from("exp-1");
    let spec = ExperimentSpec::new(
        "bad-params",
        Target::new("prod", "pod"),
        FaultSpec::new("latency").with_params(json!(42)),
    );
    h.engine.create_experiment_with_id(id.clone(), spec).await.unwrap();
    h.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    let before = h.store.event_count(&id);

    let result = h.engine.transition(&id, Trigger::Inject, Payload::new()).await;
    match result {
        Err(EngineError::GuardRejected { state, reason, .. }) => {
            assert_eq!(state, ExperimentState::Ready);
            assert!(reason.starts_with("fault_spec_valid"));
        }
        other => panic!("expected guard rejection, got {other:?}"),
    }
    assert_eq!(h.engine.state(&id).unwrap(), ExperimentState::Ready);
    assert_eq!(h.store.event_count(&id), before);
    assert!(!h.injector.calls_for(&id).contains(&FaultPhase::Inject));
}

#[tokio::test]
async fn test_cancel_from_injected_reverts_first() {
    let h = harness();
    let id = ExperimentId::from("exp-1");
    h.engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();
    h.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    h.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();

    let state = h.engine.transition(&id, Trigger::Cancel, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Completed);

    let last = log(&h, &id).await.pop().unwrap();
    assert_eq!(last.event_type, EventType::ExperimentCancelled);
    assert_eq!(last.triggers, vec![Trigger::Cancel, Trigger::RevertDone]);
    assert_eq!(
        TransitionTable::standard().path(ExperimentState::Injected, &last.triggers),
        Some(vec![ExperimentState::Reverting, ExperimentState::Completed])
    );
    assert_eq!(h.injector.active_faults(), 0);
}

#[tokio::test]
async fn test_cancel_with_failing_recovery_ends_failed() {
    let h = harness();
    let id = ExperimentId::from("exp-1");
    h.engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();
    h.engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    h.engine.transition(&id, Trigger::Inject, Payload::new()).await.unwrap();

    h.injector.fail_on(FaultPhase::Recover);
    let state = h.engine.transition(&id, Trigger::Cancel, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Failed);

    let last = log(&h, &id).await.pop().unwrap();
    assert_eq!(last.event_type, EventType::FaultFailed);
    assert_eq!(last.payload["failed_phase"], "recover");
    assert_eq!(last.payload["manual_remediation"], true);
}

#[tokio::test]
async fn test_injector_timeout_fails_experiment() {
    let store = Arc::new(InMemoryExperimentStore::new());
    let slow = Arc::new(SimulatedInjector::new("latency").with_latency(Duration::from_millis(200)));
    let engine = Engine::new(
        store.clone(),
        Arc::new(InMemoryEventBus::new()),
        InjectorRegistry::new().with(slow),
    )
    .with_config(EngineConfig::default().with_action_timeout(Duration::from_millis(20)));

    let id = ExperimentId::from("exp-1");
    engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();
    let state = engine.transition(&id, Trigger::Prepare, Payload::new()).await.unwrap();
    assert_eq!(state, ExperimentState::Failed);

    let events: Vec<ExperimentEvent> = engine.events(&id, 2).try_collect().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload["failed_phase"], "prepare");
    assert!(events[0].payload["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_subscriber_sees_events_in_sequence_order() {
    let h = harness();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = h
        .bus
        .subscribe(
            "experiments.exp-1",
            "watcher",
            handler_fn(move |delivery: Delivery| {
                let tx = tx.clone();
                async move {
                    tx.send(delivery.event.sequence)
                        .map_err(|e| HandlerError::new(e.to_string()))
                }
            }),
        )
        .await
        .unwrap();

    let id = ExperimentId::from("exp-1");
    h.engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();
    for trigger in [Trigger::Prepare, Trigger::Inject, Trigger::Revert] {
        h.engine.transition(&id, trigger, Payload::new()).await.unwrap();
    }

    let mut seen = vec![];
    while seen.len() < 4 {
        let sequence = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(sequence);
    }
    assert_eq!(seen, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_concurrent_transitions_on_one_experiment_are_serialized() {
    let h = Arc::new(harness());
    let id = ExperimentId::from("exp-1");
    h.engine.create_experiment_with_id(id.clone(), checkout_spec()).await.unwrap();

    let mut handles = vec![];
    for _ in 0..4 {
        let h = h.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            h.engine.transition(&id, Trigger::Prepare, Payload::new()).await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(state) => {
                assert_eq!(state, ExperimentState::Ready);
                committed += 1;
            }
            Err(EngineError::GuardRejected { state, .. }) => {
                assert_eq!(state, ExperimentState::Ready)
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(h.store.event_count(&id), 2);
}

#[tokio::test]
async fn test_purge_keeps_live_experiments() {
    let h = harness();
    let done = ExperimentId::from("exp-done");
    let live = ExperimentId::from("exp-live");
    h.engine.create_experiment_with_id(done.clone(), checkout_spec()).await.unwrap();
    h.engine
        .create_experiment_with_id(
            live.clone(),
            ExperimentSpec::new("other", Target::new("staging", "pod"), FaultSpec::new("latency")),
        )
        .await
        .unwrap();
    h.engine.transition(&done, Trigger::Cancel, Payload::new()).await.unwrap();
    h.engine.transition(&live, Trigger::Prepare, Payload::new()).await.unwrap();

    let old = chrono::Utc::now() - chrono::Duration::days(30);
    h.store.backdate(&done, old);
    h.store.backdate(&live, old);

    let purged = h.engine.purge_expired().await.unwrap();
    assert_eq!(purged, vec![done.clone()]);
    assert!(h.engine.experiment(&done).is_none());
    assert_eq!(h.engine.state(&live).unwrap(), ExperimentState::Ready);
}
