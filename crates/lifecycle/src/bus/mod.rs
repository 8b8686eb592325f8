//! Event bus: durable, ordered, at-least-once distribution of lifecycle events
//!
//! Two transports share one consumer implementation ([`dispatch`]):
//! [`InMemoryEventBus`] for tests and single-process use, and
//! [`PostgresEventBus`] for multi-process deployments.

mod dispatch;
mod memory;
mod postgres;
pub mod topic;
mod types;

pub use memory::InMemoryEventBus;
pub use postgres::PostgresEventBus;
pub use topic::{experiment_topic, ALL_EXPERIMENTS};
pub use types::{
    handler_fn, BusError, BusPurge, DeadLetter, Delivery, EventBus, EventHandler, HandlerError, Subscription,
};
