//! ExperimentEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};

use super::replay::{ReplayError, Replayer};
use crate::event::{ExperimentEvent, NewEvent};
use crate::experiment::{ExperimentId, ExperimentRecord};
use crate::machine::{ExperimentState, TransitionTable, Trigger};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("experiment not found: {0}")]
    NotFound(ExperimentId),

    #[error("experiment already exists: {0}")]
    AlreadyExists(ExperimentId),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-only, per-experiment event log plus the `experiments` table.
///
/// Implementations must be thread-safe. `append` is the only way the
/// committed state of an experiment changes.
#[async_trait]
pub trait ExperimentEventStore: Send + Sync + 'static {
    /// Insert the experiment row and its `experiment.created` event (sequence 1)
    async fn create_experiment(
        &self,
        record: ExperimentRecord,
        created: NewEvent,
    ) -> Result<ExperimentEvent, StoreError>;

    /// Append one event, assigning `expected_sequence + 1`.
    ///
    /// Atomically updates the experiment row (state, sequence) and clears any
    /// write-ahead intent. Fails with `ConcurrencyConflict` if another writer
    /// appended first.
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence: u64,
    ) -> Result<ExperimentEvent, StoreError>;

    /// Lazily read events with `sequence >= from_sequence`, in order
    fn read(
        &self,
        experiment_id: ExperimentId,
        from_sequence: u64,
    ) -> BoxStream<'_, Result<ExperimentEvent, StoreError>>;

    /// Sequence of the last event, 0 if the experiment is unknown
    async fn last_sequence(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError>;

    async fn get_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<ExperimentRecord, StoreError>;

    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError>;

    /// Record (or clear) the trigger whose action is about to run
    async fn set_in_flight(
        &self,
        experiment_id: &ExperimentId,
        trigger: Option<Trigger>,
    ) -> Result<(), StoreError>;

    /// Delete terminal experiments (and their events) last updated before `cutoff`
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExperimentId>, StoreError>;

    /// Collect the whole log
    async fn read_all(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<Vec<ExperimentEvent>, StoreError> {
        self.read(experiment_id.clone(), 1).try_collect().await
    }

    /// Fold the full log through `table` to the current state.
    ///
    /// Pure with respect to the store: replaying twice yields the same state.
    async fn replay(
        &self,
        table: &TransitionTable,
        experiment_id: &ExperimentId,
    ) -> Result<ExperimentState, ReplayError> {
        let mut replayer = Replayer::new(table, experiment_id);
        let mut events = self.read(experiment_id.clone(), 1);
        while let Some(event) = events.next().await {
            replayer.apply(&event?)?;
        }
        replayer.finish()
    }
}
