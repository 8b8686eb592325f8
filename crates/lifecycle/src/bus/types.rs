//! Event bus contract: publish, durable subscribe, dead letters

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::ExperimentEvent;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("invalid topic or pattern: '{0}'")]
    InvalidTopic(String),

    #[error("durable name already has a live subscription: {0}")]
    DurableNameInUse(String),

    /// Transport did not accept the message
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("event bus is shut down")]
    Closed,
}

impl BusError {
    /// Only transport failures can succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Handler rejected a delivery; it will be redelivered
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// One delivery attempt of a published event
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Bus-assigned publish sequence (global to the bus)
    pub seq: u64,
    pub topic: String,
    pub event: ExperimentEvent,
    /// 1 on first delivery
    pub attempt: u32,
}

/// Event that could not be delivered or published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Durable name of the subscription, `None` for failed publishes
    pub subscription: Option<String>,
    pub topic: String,
    pub event: ExperimentEvent,
    pub attempts: u32,
    pub last_error: String,
    pub dead_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// `Ok` acknowledges the delivery and advances the durable cursor
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        (self.0)(delivery).await
    }
}

/// Wrap a closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What a retention sweep removed from the bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusPurge {
    pub messages: u64,
    /// Cursors of durable names that were neither live nor acknowledged
    /// anything since the cutoff
    pub cursors: u64,
}

/// Publish/subscribe fabric for lifecycle events.
///
/// Delivery is at-least-once and, per durable subscription, in publish
/// order. Publish returns once the transport accepted the message; it never
/// waits for subscribers.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, event: &ExperimentEvent) -> Result<(), BusError>;

    /// Start a durable subscription.
    ///
    /// The cursor of `durable_name` survives unsubscribe; an unknown name
    /// starts at the beginning of the retained stream.
    async fn subscribe(
        &self,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError>;

    /// Like [`EventBus::subscribe`], but an unknown `durable_name` starts
    /// after the last message published so far instead of at the beginning.
    async fn subscribe_from_tail(
        &self,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError>;

    /// Delete the cursor of a durable name that is no longer needed.
    /// Returns whether a cursor existed. Fails while the name is live.
    async fn forget(&self, durable_name: &str) -> Result<bool, BusError>;

    /// Drop messages published before `cutoff` and idle cursors of names
    /// without a live subscription. Dead letters are kept.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<BusPurge, BusError>;

    /// Record an event the publisher gave up on
    async fn publish_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError>;

    /// Stop every subscription and wait for in-progress deliveries
    async fn shutdown(&self);
}

/// Handle to a running subscription. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    durable_name: String,
    pattern: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(
        durable_name: String,
        pattern: String,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            durable_name,
            pattern,
            cancel,
            task: Some(task),
        }
    }

    pub fn durable_name(&self) -> &str {
        &self.durable_name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop delivery and wait for the consumer to exit.
    /// The durable name can be reused once this returns.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
