//! In-memory implementation of ExperimentEventStore for testing

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;

use super::store::{ExperimentEventStore, StoreError};
use crate::event::{ExperimentEvent, NewEvent};
use crate::experiment::{ExperimentId, ExperimentRecord};
use crate::machine::Trigger;

const READ_PAGE_SIZE: usize = 64;

struct Entry {
    record: ExperimentRecord,
    events: Vec<ExperimentEvent>,
}

/// In-memory implementation of ExperimentEventStore
///
/// Provides the same semantics as the PostgreSQL implementation, plus
/// failure injection hooks for tests.
///
/// # Example
///
/// ```
/// use faultline_lifecycle::InMemoryExperimentStore;
///
/// let store = InMemoryExperimentStore::new();
/// assert_eq!(store.experiment_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryExperimentStore {
    experiments: RwLock<HashMap<ExperimentId, Entry>>,
    fail_next_append: AtomicBool,
}

impl InMemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn experiment_count(&self) -> usize {
        self.experiments.read().len()
    }

    pub fn event_count(&self, experiment_id: &ExperimentId) -> usize {
        self.experiments
            .read()
            .get(experiment_id)
            .map_or(0, |entry| entry.events.len())
    }

    /// Make the next `append` fail with a database error
    pub fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Overwrite the last-updated timestamp (retention tests)
    pub fn backdate(&self, experiment_id: &ExperimentId, updated_at: DateTime<Utc>) {
        if let Some(entry) = self.experiments.write().get_mut(experiment_id) {
            entry.record.updated_at = updated_at;
        }
    }

    /// Drop everything
    pub fn clear(&self) {
        self.experiments.write().clear();
    }
}

#[async_trait]
impl ExperimentEventStore for InMemoryExperimentStore {
    async fn create_experiment(
        &self,
        mut record: ExperimentRecord,
        created: NewEvent,
    ) -> Result<ExperimentEvent, StoreError> {
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }

        let event = created.into_event(1, record.created_at);
        record.state = event.to_state;
        record.sequence = 1;
        record.in_flight = None;
        record.updated_at = event.timestamp;

        experiments.insert(
            record.id.clone(),
            Entry {
                record,
                events: vec![event.clone()],
            },
        );
        Ok(event)
    }

    async fn append(
        &self,
        event: NewEvent,
        expected_sequence: u64,
    ) -> Result<ExperimentEvent, StoreError> {
        if self.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected append failure".to_string()));
        }

        let mut experiments = self.experiments.write();
        let entry = experiments
            .get_mut(&event.experiment_id)
            .ok_or_else(|| StoreError::NotFound(event.experiment_id.clone()))?;

        let actual = entry.record.sequence;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual,
            });
        }

        let event = event.into_event(actual + 1, Utc::now());
        entry.record.state = event.to_state;
        entry.record.sequence = event.sequence;
        entry.record.in_flight = None;
        entry.record.updated_at = event.timestamp;
        entry.events.push(event.clone());
        Ok(event)
    }

    fn read(
        &self,
        experiment_id: ExperimentId,
        from_sequence: u64,
    ) -> BoxStream<'_, Result<ExperimentEvent, StoreError>> {
        // Pages are copied out under the read lock, one at a time
        stream::unfold(Some(from_sequence.max(1)), move |cursor| {
            let page = cursor.map(|from| {
                self.experiments
                    .read()
                    .get(&experiment_id)
                    .map(|entry| {
                        entry
                            .events
                            .iter()
                            .skip_while(|e| e.sequence < from)
                            .take(READ_PAGE_SIZE)
                            .cloned()
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            });
            async move {
                let page = page.filter(|page| !page.is_empty())?;
                let next = (page.len() == READ_PAGE_SIZE)
                    .then(|| page.last().map(|e| e.sequence + 1))
                    .flatten();
                Some((stream::iter(page.into_iter().map(Ok::<_, StoreError>)), next))
            }
        })
        .flatten()
        .boxed()
    }

    async fn last_sequence(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError> {
        Ok(self
            .experiments
            .read()
            .get(experiment_id)
            .map_or(0, |entry| entry.record.sequence))
    }

    async fn get_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<ExperimentRecord, StoreError> {
        self.experiments
            .read()
            .get(experiment_id)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| StoreError::NotFound(experiment_id.clone()))
    }

    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        let mut records: Vec<_> = self
            .experiments
            .read()
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn set_in_flight(
        &self,
        experiment_id: &ExperimentId,
        trigger: Option<Trigger>,
    ) -> Result<(), StoreError> {
        let mut experiments = self.experiments.write();
        let entry = experiments
            .get_mut(experiment_id)
            .ok_or_else(|| StoreError::NotFound(experiment_id.clone()))?;
        entry.record.in_flight = trigger;
        Ok(())
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExperimentId>, StoreError> {
        let mut experiments = self.experiments.write();
        let expired: Vec<ExperimentId> = experiments
            .values()
            .filter(|entry| entry.record.state.is_terminal() && entry.record.updated_at < cutoff)
            .map(|entry| entry.record.id.clone())
            .collect();
        for id in &expired {
            experiments.remove(id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::event::{EventType, Payload};
    use crate::experiment::{ExperimentSpec, FaultSpec, Target};
    use crate::machine::{ExperimentState, TransitionTable};

    fn record(id: &str) -> ExperimentRecord {
        let now = Utc::now();
        ExperimentRecord {
            id: ExperimentId::from(id),
            spec: ExperimentSpec::new(id, Target::new("prod", "pod"), FaultSpec::new("latency")),
            state: ExperimentState::Idle,
            sequence: 0,
            in_flight: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(
        id: &str,
        from: ExperimentState,
        to: ExperimentState,
        triggers: Vec<Trigger>,
    ) -> NewEvent {
        NewEvent {
            experiment_id: ExperimentId::from(id),
            event_type: EventType::for_commit(triggers[0], to),
            from_state: from,
            to_state: to,
            triggers,
            payload: Payload::new(),
        }
    }

    async fn seeded(id: &str) -> InMemoryExperimentStore {
        let store = InMemoryExperimentStore::new();
        store
            .create_experiment(record(id), NewEvent::created(ExperimentId::from(id), Payload::new()))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_append_assigns_sequences() {
        let store = seeded("exp-1").await;
        let id = ExperimentId::from("exp-1");

        let event = store
            .append(
                transition("exp-1", ExperimentState::Idle, ExperimentState::Ready, vec![Trigger::Prepare, Trigger::PrepareDone]),
                1,
            )
            .await
            .unwrap();
        assert_eq!(event.sequence, 2);
        assert_eq!(store.last_sequence(&id).await.unwrap(), 2);

        let record = store.get_experiment(&id).await.unwrap();
        assert_eq!(record.state, ExperimentState::Ready);
    }

    #[tokio::test]
    async fn test_stale_expected_sequence_conflicts() {
        let store = seeded("exp-1").await;
        let result = store
            .append(
                transition("exp-1", ExperimentState::Idle, ExperimentState::Cancelled, vec![Trigger::Cancel]),
                0,
            )
            .await;

        assert_eq!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1
            })
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = seeded("exp-1").await;
        let result = store
            .create_experiment(record("exp-1"), NewEvent::created(ExperimentId::from("exp-1"), Payload::new()))
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_append_clears_in_flight() {
        let store = seeded("exp-1").await;
        let id = ExperimentId::from("exp-1");

        store.set_in_flight(&id, Some(Trigger::Prepare)).await.unwrap();
        assert_eq!(store.get_experiment(&id).await.unwrap().in_flight, Some(Trigger::Prepare));

        store
            .append(
                transition("exp-1", ExperimentState::Idle, ExperimentState::Ready, vec![Trigger::Prepare, Trigger::PrepareDone]),
                1,
            )
            .await
            .unwrap();
        assert_eq!(store.get_experiment(&id).await.unwrap().in_flight, None);
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_log_untouched() {
        let store = seeded("exp-1").await;
        store.fail_next_append();

        let result = store
            .append(
                transition("exp-1", ExperimentState::Idle, ExperimentState::Cancelled, vec![Trigger::Cancel]),
                1,
            )
            .await;
        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(store.event_count(&ExperimentId::from("exp-1")), 1);
    }

    #[tokio::test]
    async fn test_read_from_sequence_and_replay() {
        let store = seeded("exp-1").await;
        let id = ExperimentId::from("exp-1");
        store
            .append(
                transition("exp-1", ExperimentState::Idle, ExperimentState::Ready, vec![Trigger::Prepare, Trigger::PrepareDone]),
                1,
            )
            .await
            .unwrap();
        store
            .append(
                transition("exp-1", ExperimentState::Ready, ExperimentState::Cancelled, vec![Trigger::Cancel]),
                2,
            )
            .await
            .unwrap();

        let tail: Vec<_> = store.read(id.clone(), 2).try_collect().await.unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);

        let table = TransitionTable::bare();
        assert_eq!(store.replay(&table, &id).await, Ok(ExperimentState::Cancelled));
        assert_eq!(store.replay(&table, &id).await, Ok(ExperimentState::Cancelled));
    }

    #[tokio::test]
    async fn test_read_pages_lazily() {
        let store = seeded("exp-1").await;
        let id = ExperimentId::from("exp-1");
        let idle = || transition("exp-1", ExperimentState::Idle, ExperimentState::Idle, vec![Trigger::Prepare]);
        for expected in 1..=(READ_PAGE_SIZE as u64 + 5) {
            store.append(idle(), expected).await.unwrap();
        }

        let mut events = store.read(id.clone(), 1);
        let first = events.try_next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);

        // Lands in a page that has not been fetched yet
        let last = READ_PAGE_SIZE as u64 + 7;
        store.append(idle(), last - 1).await.unwrap();

        let rest: Vec<_> = events.try_collect().await.unwrap();
        assert_eq!(rest.len() as u64, last - 1);
        assert_eq!(rest.last().map(|e| e.sequence), Some(last));
        assert!(rest.windows(2).all(|w| w[1].sequence == w[0].sequence + 1));
    }

    #[tokio::test]
    async fn test_purge_only_removes_expired_terminal() {
        let store = seeded("done").await;
        store
            .create_experiment(record("live"), NewEvent::created(ExperimentId::from("live"), Payload::new()))
            .await
            .unwrap();
        store
            .append(
                transition("done", ExperimentState::Idle, ExperimentState::Cancelled, vec![Trigger::Cancel]),
                1,
            )
            .await
            .unwrap();

        let old = Utc::now() - chrono::Duration::days(30);
        store.backdate(&ExperimentId::from("done"), old);
        store.backdate(&ExperimentId::from("live"), old);

        let purged = store
            .purge_expired(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, vec![ExperimentId::from("done")]);
        assert_eq!(store.experiment_count(), 1);
    }
}
