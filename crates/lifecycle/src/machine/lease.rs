//! Target leases
//!
//! An experiment holds a lease on its target from `Prepare` until it reaches a
//! terminal state. Overlapping targets cannot be leased twice.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::experiment::{ExperimentId, Target};

#[derive(Debug, Default)]
pub struct TargetLeases {
    held: Mutex<HashMap<ExperimentId, Target>>,
}

impl TargetLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a lease, returning the holder of a conflicting one on failure.
    /// Re-acquiring an already held lease succeeds.
    pub fn try_acquire(&self, id: &ExperimentId, target: &Target) -> Result<(), ExperimentId> {
        let mut held = self.held.lock();
        if let Some((holder, _)) = held
            .iter()
            .find(|(holder, other)| *holder != id && other.overlaps(target))
        {
            return Err(holder.clone());
        }
        held.insert(id.clone(), target.clone());
        Ok(())
    }

    pub fn release(&self, id: &ExperimentId) -> bool {
        self.held.lock().remove(id).is_some()
    }

    pub fn is_held(&self, id: &ExperimentId) -> bool {
        self.held.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}
