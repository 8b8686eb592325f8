//! Consumer loop shared by every bus transport
//!
//! One task per subscription, delivering sequentially. The durable cursor
//! moves only after the handler acknowledged (or the message was
//! dead-lettered), so a crash mid-delivery redelivers.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::types::{BusError, DeadLetter, Delivery, EventHandler, Subscription};
use crate::config::BusConfig;
use crate::event::ExperimentEvent;

/// Message as retained by a transport
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub seq: u64,
    pub topic: String,
    pub event: ExperimentEvent,
    pub published_at: DateTime<Utc>,
}

/// Storage half of a transport
#[async_trait]
pub(crate) trait BusBackend: Send + Sync + 'static {
    /// Messages matching `pattern` with `seq > after`, in seq order
    async fn fetch_after(
        &self,
        pattern: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BusError>;

    /// Cursor for `durable_name`, created at `start` if unknown
    async fn load_cursor(
        &self,
        durable_name: &str,
        pattern: &str,
        start: u64,
    ) -> Result<u64, BusError>;

    /// Highest seq published so far, 0 when nothing was
    async fn tail(&self) -> Result<u64, BusError>;

    async fn store_cursor(&self, durable_name: &str, seq: u64) -> Result<(), BusError>;

    async fn record_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError>;

    /// Ticks whenever something was published
    fn wake(&self) -> watch::Receiver<u64>;
}

/// Removes a durable name from the live set when the consumer exits
struct LiveName {
    live: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for LiveName {
    fn drop(&mut self) {
        self.live.lock().remove(&self.name);
    }
}

/// Consumer tasks of one bus instance
pub(crate) struct Consumers {
    root: CancellationToken,
    tracker: TaskTracker,
    live: Arc<Mutex<HashSet<String>>>,
}

impl Consumers {
    pub(crate) fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            live: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Token cancelled on shutdown, for transport-owned background tasks
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(crate) fn is_live(&self, durable_name: &str) -> bool {
        self.live.lock().contains(durable_name)
    }

    pub(crate) fn live_names(&self) -> Vec<String> {
        self.live.lock().iter().cloned().collect()
    }

    /// Seed an unknown durable name at the current tail, then spawn.
    /// The cursor exists before this returns, so nothing published
    /// afterwards is missed.
    pub(crate) async fn spawn_from_tail<B: BusBackend>(
        &self,
        backend: Arc<B>,
        config: &BusConfig,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.is_live(durable_name) {
            return Err(BusError::DurableNameInUse(durable_name.to_string()));
        }
        let tail = backend.tail().await?;
        let cursor = backend.load_cursor(durable_name, pattern, tail).await?;
        debug!(durable_name, tail, cursor, "seeded durable cursor");
        self.spawn(backend, config, pattern, durable_name, handler)
    }

    pub(crate) fn spawn<B: BusBackend>(
        &self,
        backend: Arc<B>,
        config: &BusConfig,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if !self.live.lock().insert(durable_name.to_string()) {
            return Err(BusError::DurableNameInUse(durable_name.to_string()));
        }

        let live = LiveName {
            live: self.live.clone(),
            name: durable_name.to_string(),
        };
        let cancel = self.root.child_token();
        let consumer = Consumer {
            backend,
            config: config.clone(),
            pattern: pattern.to_string(),
            durable_name: durable_name.to_string(),
            handler,
            cancel: cancel.clone(),
        };

        let task = self.tracker.spawn(async move {
            let _live = live;
            consumer.run().await;
        });

        debug!(durable_name, pattern, "subscription started");
        Ok(Subscription::new(
            durable_name.to_string(),
            pattern.to_string(),
            cancel,
            task,
        ))
    }

    pub(crate) async fn shutdown(&self) {
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

enum Outcome {
    Acked,
    DeadLettered,
    Cancelled,
}

struct Consumer<B> {
    backend: Arc<B>,
    config: BusConfig,
    pattern: String,
    durable_name: String,
    handler: Arc<dyn EventHandler>,
    cancel: CancellationToken,
}

impl<B: BusBackend> Consumer<B> {
    async fn run(self) {
        let Some(mut cursor) = self.initial_cursor().await else {
            return;
        };
        let mut wake = self.backend.wake();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // Mark the current tick seen before fetching so a publish racing
            // with the fetch still wakes us
            wake.borrow_and_update();

            let batch = match self
                .backend
                .fetch_after(&self.pattern, cursor, self.config.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(durable_name = %self.durable_name, error = %e, "fetch failed");
                    if self.pause(self.config.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    changed = wake.changed() => {
                        if changed.is_err() && self.pause(self.config.poll_interval).await {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for message in batch {
                match self.deliver(&message).await {
                    Outcome::Acked | Outcome::DeadLettered => {
                        cursor = message.seq;
                        if let Err(e) = self.backend.store_cursor(&self.durable_name, cursor).await {
                            warn!(durable_name = %self.durable_name, seq = cursor, error = %e, "failed to store cursor");
                        }
                    }
                    Outcome::Cancelled => return,
                }
            }
        }

        debug!(durable_name = %self.durable_name, "subscription stopped");
    }

    async fn initial_cursor(&self) -> Option<u64> {
        loop {
            match self
                .backend
                .load_cursor(&self.durable_name, &self.pattern, 0)
                .await
            {
                Ok(cursor) => return Some(cursor),
                Err(e) => {
                    warn!(durable_name = %self.durable_name, error = %e, "failed to load cursor");
                    if self.pause(self.config.poll_interval).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleep unless cancelled first; true when cancelled
    async fn pause(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn deliver(&self, message: &StoredMessage) -> Outcome {
        let policy = &self.config.redelivery;
        let mut attempt = 1;

        loop {
            let delivery = Delivery {
                seq: message.seq,
                topic: message.topic.clone(),
                event: message.event.clone(),
                attempt,
            };

            let result = AssertUnwindSafe(self.handler.handle(delivery))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err("handler panicked".into()));

            let err = match result {
                Ok(()) => return Outcome::Acked,
                Err(err) => err,
            };

            if policy.has_attempts_remaining(attempt) {
                attempt += 1;
                debug!(
                    durable_name = %self.durable_name,
                    seq = message.seq,
                    attempt,
                    error = %err,
                    "handler failed, redelivering"
                );
                if self.pause(policy.delay_for_attempt(attempt)).await {
                    return Outcome::Cancelled;
                }
                continue;
            }

            error!(
                durable_name = %self.durable_name,
                topic = %message.topic,
                seq = message.seq,
                attempts = attempt,
                error = %err,
                "delivery dead-lettered"
            );
            let dead = DeadLetter {
                subscription: Some(self.durable_name.clone()),
                topic: message.topic.clone(),
                event: message.event.clone(),
                attempts: attempt,
                last_error: err.to_string(),
                dead_at: Utc::now(),
            };
            if let Err(e) = self.backend.record_dead_letter(dead).await {
                error!(durable_name = %self.durable_name, error = %e, "failed to record dead letter");
            }
            return Outcome::DeadLettered;
        }
    }
}
