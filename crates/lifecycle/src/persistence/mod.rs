//! Event store: append-only experiment log and replay

mod memory;
mod postgres;
mod replay;
mod store;

pub use memory::InMemoryExperimentStore;
pub use postgres::{PostgresExperimentStore, MIGRATOR};
pub use replay::ReplayError;
pub use store::{ExperimentEventStore, StoreError};
