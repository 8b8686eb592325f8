//! In-process event bus
//!
//! Retains published messages until a retention sweep removes them, so
//! durable cursors behave as with a networked transport. Intended for tests
//! and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use super::dispatch::{BusBackend, Consumers, StoredMessage};
use super::topic;
use super::types::{BusError, BusPurge, DeadLetter, EventBus, EventHandler, Subscription};
use crate::config::BusConfig;
use crate::event::ExperimentEvent;

struct Cursor {
    last_seq: u64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Retained {
    /// Ascending by seq; pruning only removes a prefix
    messages: Vec<StoredMessage>,
    last_seq: u64,
    cursors: HashMap<String, Cursor>,
    dead_letters: Vec<DeadLetter>,
}

struct MemoryBackend {
    retained: RwLock<Retained>,
    wake: watch::Sender<u64>,
    failing_publishes: AtomicU32,
}

#[async_trait]
impl BusBackend for MemoryBackend {
    async fn fetch_after(
        &self,
        pattern: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BusError> {
        let retained = self.retained.read();
        let start = retained.messages.partition_point(|m| m.seq <= after);
        Ok(retained.messages[start..]
            .iter()
            .filter(|m| topic::matches(pattern, &m.topic))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_cursor(
        &self,
        durable_name: &str,
        _pattern: &str,
        start: u64,
    ) -> Result<u64, BusError> {
        let mut retained = self.retained.write();
        let cursor = retained
            .cursors
            .entry(durable_name.to_string())
            .or_insert_with(|| Cursor {
                last_seq: start,
                updated_at: Utc::now(),
            });
        cursor.updated_at = Utc::now();
        Ok(cursor.last_seq)
    }

    async fn tail(&self) -> Result<u64, BusError> {
        Ok(self.retained.read().last_seq)
    }

    async fn store_cursor(&self, durable_name: &str, seq: u64) -> Result<(), BusError> {
        let mut retained = self.retained.write();
        let cursor = retained
            .cursors
            .entry(durable_name.to_string())
            .or_insert(Cursor {
                last_seq: 0,
                updated_at: Utc::now(),
            });
        cursor.last_seq = cursor.last_seq.max(seq);
        cursor.updated_at = Utc::now();
        Ok(())
    }

    async fn record_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError> {
        self.retained.write().dead_letters.push(dead);
        Ok(())
    }

    fn wake(&self) -> watch::Receiver<u64> {
        self.wake.subscribe()
    }
}

/// In-memory implementation of EventBus
///
/// # Example
///
/// ```
/// use faultline_lifecycle::InMemoryEventBus;
///
/// let bus = InMemoryEventBus::new();
/// assert_eq!(bus.message_count(), 0);
/// ```
pub struct InMemoryEventBus {
    backend: Arc<MemoryBackend>,
    consumers: Consumers,
    config: BusConfig,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            backend: Arc::new(MemoryBackend {
                retained: RwLock::new(Retained::default()),
                wake,
                failing_publishes: AtomicU32::new(0),
            }),
            consumers: Consumers::new(),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Reject the next `n` publishes with a transport error
    pub fn fail_next_publishes(&self, n: u32) {
        self.backend.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Retained messages (all topics)
    pub fn message_count(&self) -> usize {
        self.backend.retained.read().messages.len()
    }

    /// Durable names with a stored cursor
    pub fn cursor_count(&self) -> usize {
        self.backend.retained.read().cursors.len()
    }

    /// Events published on topics matching `pattern`, in publish order
    pub fn published(&self, pattern: &str) -> Vec<ExperimentEvent> {
        self.backend
            .retained
            .read()
            .messages
            .iter()
            .filter(|m| topic::matches(pattern, &m.topic))
            .map(|m| m.event.clone())
            .collect()
    }

    /// Acknowledged position of a durable subscription
    pub fn cursor(&self, durable_name: &str) -> Option<u64> {
        self.backend
            .retained
            .read()
            .cursors
            .get(durable_name)
            .map(|cursor| cursor.last_seq)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    #[instrument(skip(self, event), fields(sequence = event.sequence))]
    async fn publish(&self, topic: &str, event: &ExperimentEvent) -> Result<(), BusError> {
        topic::validate_topic(topic)?;
        if self.consumers.is_closed() {
            return Err(BusError::Closed);
        }

        let failing = &self.backend.failing_publishes;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Transport("injected publish failure".to_string()));
        }

        let seq = {
            let mut retained = self.backend.retained.write();
            retained.last_seq += 1;
            let seq = retained.last_seq;
            retained.messages.push(StoredMessage {
                seq,
                topic: topic.to_string(),
                event: event.clone(),
                published_at: Utc::now(),
            });
            seq
        };
        self.backend.wake.send_replace(seq);

        debug!(topic, seq, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        topic::validate_pattern(pattern)?;
        self.consumers.spawn(
            self.backend.clone(),
            &self.config,
            pattern,
            durable_name,
            handler,
        )
    }

    async fn subscribe_from_tail(
        &self,
        pattern: &str,
        durable_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, BusError> {
        topic::validate_pattern(pattern)?;
        self.consumers
            .spawn_from_tail(
                self.backend.clone(),
                &self.config,
                pattern,
                durable_name,
                handler,
            )
            .await
    }

    async fn forget(&self, durable_name: &str) -> Result<bool, BusError> {
        if self.consumers.is_live(durable_name) {
            return Err(BusError::DurableNameInUse(durable_name.to_string()));
        }
        Ok(self
            .backend
            .retained
            .write()
            .cursors
            .remove(durable_name)
            .is_some())
    }

    #[instrument(skip(self))]
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<BusPurge, BusError> {
        let live = self.consumers.live_names();
        let mut retained = self.backend.retained.write();

        let expired = retained.messages.partition_point(|m| m.published_at < cutoff);
        retained.messages.drain(..expired);

        let before = retained.cursors.len();
        retained
            .cursors
            .retain(|name, cursor| cursor.updated_at >= cutoff || live.contains(name));

        let purge = BusPurge {
            messages: expired as u64,
            cursors: (before - retained.cursors.len()) as u64,
        };
        if purge != BusPurge::default() {
            info!(messages = purge.messages, cursors = purge.cursors, %cutoff, "purged bus");
        }
        Ok(purge)
    }

    async fn publish_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError> {
        self.backend.record_dead_letter(dead).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError> {
        Ok(self.backend.retained.read().dead_letters.clone())
    }

    async fn shutdown(&self) {
        self.consumers.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::bus::{handler_fn, Delivery, HandlerError, ALL_EXPERIMENTS as ALL};
    use crate::event::{NewEvent, Payload};
    use crate::experiment::ExperimentId;
    use crate::reliability::RetryPolicy;

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap()
    }

    fn event(id: &str, sequence: u64) -> ExperimentEvent {
        NewEvent::created(ExperimentId::from(id), Payload::new()).into_event(sequence, Utc::now())
    }

    fn fast_config(max_attempts: u32) -> BusConfig {
        BusConfig::default().with_redelivery(
            RetryPolicy::fixed(Duration::from_millis(5), max_attempts).with_jitter(0.0),
        )
    }

    fn forward(tx: mpsc::UnboundedSender<Delivery>) -> Arc<dyn EventHandler> {
        handler_fn(move |delivery| {
            let tx = tx.clone();
            async move {
                tx.send(delivery).map_err(|e| HandlerError::new(e.to_string()))
            }
        })
    }

    #[tokio::test]
    async fn test_ordered_delivery_per_topic() {
        let bus = InMemoryEventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus.subscribe("experiments.exp-1", "watcher", forward(tx)).await.unwrap();

        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();
        bus.publish("experiments.exp-2", &event("exp-2", 1)).await.unwrap();
        bus.publish("experiments.exp-1", &event("exp-1", 2)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.event.sequence, 1);
        assert_eq!(second.event.sequence, 2);
        assert_eq!(second.topic, "experiments.exp-1");
    }

    #[tokio::test]
    async fn test_durable_name_is_exclusive_while_live() {
        let bus = InMemoryEventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let sub = bus.subscribe("experiments.>", "audit", forward(tx.clone())).await.unwrap();
        let second = bus.subscribe("experiments.>", "audit", forward(tx.clone())).await;
        assert!(matches!(second, Err(BusError::DurableNameInUse(_))));

        sub.unsubscribe().await;
        assert!(bus.subscribe("experiments.>", "audit", forward(tx)).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_redelivery_keeps_order_and_cursor_resumes() {
        let bus = InMemoryEventBus::with_config(fast_config(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rejected_once = Arc::new(AtomicBool::new(false));
        let handler = handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            let rejected_once = rejected_once.clone();
            async move {
                let _ = tx.send((delivery.event.sequence, delivery.attempt));
                if delivery.event.sequence == 1 && !rejected_once.swap(true, Ordering::SeqCst) {
                    return Err(HandlerError::new("not yet"));
                }
                Ok(())
            }
        });

        let sub = bus.subscribe("experiments.exp-1", "ordered", handler.clone()).await.unwrap();
        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();
        bus.publish("experiments.exp-1", &event("exp-1", 2)).await.unwrap();

        // Event 2 waits until event 1 is acknowledged
        assert_eq!(next(&mut rx).await, Some((1, 1)));
        assert_eq!(next(&mut rx).await, Some((1, 2)));
        assert_eq!(next(&mut rx).await, Some((2, 1)));
        sub.unsubscribe().await;
        assert_eq!(bus.cursor("ordered"), Some(2));

        bus.publish("experiments.exp-1", &event("exp-1", 3)).await.unwrap();
        let _sub = bus.subscribe("experiments.exp-1", "ordered", handler).await.unwrap();
        assert_eq!(next(&mut rx).await, Some((3, 1)));
    }

    #[tokio::test]
    async fn test_subscribe_from_tail_skips_history() {
        let bus = InMemoryEventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();

        let _sub = bus
            .subscribe_from_tail("experiments.exp-1", "late", forward(tx))
            .await
            .unwrap();
        assert_eq!(bus.cursor("late"), Some(1));
        bus.publish("experiments.exp-1", &event("exp-1", 2)).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.event.sequence, 2);
    }

    #[tokio::test]
    async fn test_forget_drops_cursor_once_unsubscribed() {
        let bus = InMemoryEventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe_from_tail(ALL, "step", forward(tx)).await.unwrap();

        assert!(matches!(bus.forget("step").await, Err(BusError::DurableNameInUse(_))));
        sub.unsubscribe().await;
        assert!(bus.forget("step").await.unwrap());
        assert!(!bus.forget("step").await.unwrap());
        assert_eq!(bus.cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_purge_drops_old_messages_and_idle_cursors() {
        let bus = InMemoryEventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();
        bus.publish("experiments.exp-2", &event("exp-2", 1)).await.unwrap();

        bus.subscribe_from_tail(ALL, "idle", forward(tx.clone()))
            .await
            .unwrap()
            .unsubscribe()
            .await;
        let _live = bus.subscribe_from_tail(ALL, "live", forward(tx)).await.unwrap();

        let purge = bus
            .purge_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purge, BusPurge { messages: 2, cursors: 1 });
        assert_eq!(bus.message_count(), 0);
        assert_eq!(bus.cursor("idle"), None);
        assert_eq!(bus.cursor("live"), Some(2));

        // Sequence numbers keep counting after a purge
        bus.publish("experiments.exp-1", &event("exp-1", 2)).await.unwrap();
        let delivered = next(&mut rx).await.unwrap();
        assert_eq!(delivered.seq, 3);
        assert_eq!(delivered.event.sequence, 2);
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_retained() {
        let bus = InMemoryEventBus::new();
        bus.fail_next_publishes(1);

        let result = bus.publish("experiments.exp-1", &event("exp-1", 1)).await;
        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(bus.message_count(), 0);

        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();
        assert_eq!(bus.message_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_delivery_is_dead_lettered() {
        let bus = InMemoryEventBus::with_config(fast_config(3));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery.attempt);
                Err(HandlerError::new("boom"))
            }
        });
        let _sub = bus.subscribe("experiments.*", "flaky", handler).await.unwrap();

        bus.publish("experiments.exp-1", &event("exp-1", 1)).await.unwrap();

        for expected in 1..=3 {
            let attempt = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
            assert_eq!(attempt, Some(expected));
        }

        let dead = loop {
            let dead = bus.dead_letters().await.unwrap();
            if !dead.is_empty() {
                break dead;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].subscription.as_deref(), Some("flaky"));
        assert_eq!(dead[0].last_error, "boom");
    }

    #[tokio::test]
    async fn test_invalid_topics_rejected() {
        let bus = InMemoryEventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(matches!(
            bus.publish("experiments.*", &event("exp-1", 1)).await,
            Err(BusError::InvalidTopic(_))
        ));
        assert!(matches!(
            bus.subscribe("experiments.>.x", "bad", forward(tx)).await,
            Err(BusError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_bus() {
        let bus = InMemoryEventBus::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = bus.subscribe("experiments.>", "audit", forward(tx.clone())).await.unwrap();

        bus.shutdown().await;
        assert!(!sub.is_active());
        assert!(matches!(
            bus.publish("experiments.exp-1", &event("exp-1", 1)).await,
            Err(BusError::Closed)
        ));
        assert!(matches!(
            bus.subscribe("experiments.>", "late", forward(tx)).await,
            Err(BusError::Closed)
        ));
    }
}
