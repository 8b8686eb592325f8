//! Deterministic replay of an experiment's log

use super::store::StoreError;
use crate::event::ExperimentEvent;
use crate::experiment::ExperimentId;
use crate::machine::{ExperimentState, TransitionTable, Trigger};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("experiment {0} has no events")]
    Empty(ExperimentId),

    #[error("sequence gap in {experiment_id}: expected {expected}, found {found}")]
    SequenceGap {
        experiment_id: ExperimentId,
        expected: u64,
        found: u64,
    },

    #[error("event {sequence} of {experiment_id} starts from {recorded}, replayed state is {replayed}")]
    FromStateMismatch {
        experiment_id: ExperimentId,
        sequence: u64,
        recorded: ExperimentState,
        replayed: ExperimentState,
    },

    #[error("event {sequence} of {experiment_id}: {triggers:?} is not a valid path from {from}")]
    InvalidTransition {
        experiment_id: ExperimentId,
        sequence: u64,
        from: ExperimentState,
        triggers: Vec<Trigger>,
    },

    #[error("event {sequence} of {experiment_id} records {recorded}, triggers lead to {replayed}")]
    ToStateMismatch {
        experiment_id: ExperimentId,
        sequence: u64,
        recorded: ExperimentState,
        replayed: ExperimentState,
    },
}

/// Incremental fold of events through the transition table
pub(crate) struct Replayer<'a> {
    table: &'a TransitionTable,
    experiment_id: &'a ExperimentId,
    state: ExperimentState,
    applied: u64,
}

impl<'a> Replayer<'a> {
    pub(crate) fn new(table: &'a TransitionTable, experiment_id: &'a ExperimentId) -> Self {
        Self {
            table,
            experiment_id,
            state: ExperimentState::Idle,
            applied: 0,
        }
    }

    pub(crate) fn apply(&mut self, event: &ExperimentEvent) -> Result<(), ReplayError> {
        let expected = self.applied + 1;
        if event.sequence != expected {
            return Err(ReplayError::SequenceGap {
                experiment_id: self.experiment_id.clone(),
                expected,
                found: event.sequence,
            });
        }
        if event.from_state != self.state {
            return Err(ReplayError::FromStateMismatch {
                experiment_id: self.experiment_id.clone(),
                sequence: event.sequence,
                recorded: event.from_state,
                replayed: self.state,
            });
        }

        let next = self
            .table
            .fold(self.state, &event.triggers)
            .ok_or_else(|| ReplayError::InvalidTransition {
                experiment_id: self.experiment_id.clone(),
                sequence: event.sequence,
                from: self.state,
                triggers: event.triggers.clone(),
            })?;
        if next != event.to_state {
            return Err(ReplayError::ToStateMismatch {
                experiment_id: self.experiment_id.clone(),
                sequence: event.sequence,
                recorded: event.to_state,
                replayed: next,
            });
        }

        self.state = next;
        self.applied = expected;
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<ExperimentState, ReplayError> {
        if self.applied == 0 {
            return Err(ReplayError::Empty(self.experiment_id.clone()));
        }
        Ok(self.state)
    }
}
