//! PostgreSQL-backed durable event bus
//!
//! - `bus_messages` retains published events, `seq` orders them
//! - `bus_cursors` holds the acknowledged position of each durable name
//! - `bus_dead_letters` records deliveries and publishes that gave up
//!
//! Publishers `pg_notify` inside the publish transaction; a single
//! `PgListener` task turns notifications into consumer wake-ups. Consumers
//! also poll at `BusConfig::poll_interval` in case a notification is lost.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::{BusBackend, Consumers, StoredMessage};
use super::topic;
use super::types::{BusError, BusPurge, DeadLetter, EventBus, EventHandler, Subscription};
use crate::config::BusConfig;
use crate::event::ExperimentEvent;

/// Advisory lock key serializing publishers, so `seq` commit order equals
/// allocation order and cursors never skip a late-committing message
const PUBLISH_LOCK_KEY: i64 = 0x6661_756c_746c_696e;

fn transport(e: sqlx::Error) -> BusError {
    BusError::Transport(e.to_string())
}

fn serialization(e: serde_json::Error) -> BusError {
    BusError::Serialization(e.to_string())
}

struct PgBackend {
    pool: PgPool,
    channel: String,
    wake: watch::Sender<u64>,
}

fn parse_message(row: &PgRow) -> Result<StoredMessage, BusError> {
    let seq: i64 = row.get("seq");
    let event: serde_json::Value = row.get("event");
    Ok(StoredMessage {
        seq: seq as u64,
        topic: row.get("topic"),
        event: serde_json::from_value(event).map_err(serialization)?,
        published_at: row.get("published_at"),
    })
}

fn parse_dead_letter(row: &PgRow) -> Result<DeadLetter, BusError> {
    let event: serde_json::Value = row.get("event");
    let attempts: i32 = row.get("attempts");
    Ok(DeadLetter {
        subscription: row.get("subscription"),
        topic: row.get("topic"),
        event: serde_json::from_value(event).map_err(serialization)?,
        attempts: attempts as u32,
        last_error: row.get("last_error"),
        dead_at: row.get("dead_at"),
    })
}

#[async_trait]
impl BusBackend for PgBackend {
    async fn fetch_after(
        &self,
        pattern: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, BusError> {
        // Literal patterns can use the (topic, seq) index
        let query = if topic::is_literal(pattern) {
            sqlx::query(
                r#"
                SELECT seq, topic, event, published_at
                FROM bus_messages
                WHERE seq > $1 AND topic = $2
                ORDER BY seq
                LIMIT $3
                "#,
            )
            .bind(after as i64)
            .bind(pattern)
        } else {
            sqlx::query(
                r#"
                SELECT seq, topic, event, published_at
                FROM bus_messages
                WHERE seq > $1 AND topic ~ $2
                ORDER BY seq
                LIMIT $3
                "#,
            )
            .bind(after as i64)
            .bind(topic::pattern_regex(pattern))
        };
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(transport)?;

        rows.iter().map(parse_message).collect()
    }

    async fn load_cursor(
        &self,
        durable_name: &str,
        pattern: &str,
        start: u64,
    ) -> Result<u64, BusError> {
        let row = sqlx::query(
            r#"
            INSERT INTO bus_cursors (durable_name, pattern, last_seq)
            VALUES ($1, $2, $3)
            ON CONFLICT (durable_name)
            DO UPDATE SET pattern = EXCLUDED.pattern, updated_at = NOW()
            RETURNING last_seq
            "#,
        )
        .bind(durable_name)
        .bind(pattern)
        .bind(start as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(transport)?;

        Ok(row.get::<i64, _>("last_seq") as u64)
    }

    async fn tail(&self) -> Result<u64, BusError> {
        // Publishers commit in seq order, so anything committing later is above this
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM bus_messages")
            .fetch_one(&self.pool)
            .await
            .map_err(transport)?;
        Ok(row.get::<i64, _>("seq") as u64)
    }

    async fn store_cursor(&self, durable_name: &str, seq: u64) -> Result<(), BusError> {
        sqlx::query(
            r#"
            UPDATE bus_cursors
            SET last_seq = GREATEST(last_seq, $2), updated_at = NOW()
            WHERE durable_name = $1
            "#,
        )
        .bind(durable_name)
        .bind(seq as i64)
        .execute(&self.pool)
        .await
        .map_err(transport)?;
        Ok(())
    }

    async fn record_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError> {
        let event = serde_json::to_value(&dead.event).map_err(serialization)?;
        sqlx::query(
            r#"
            INSERT INTO bus_dead_letters (subscription, topic, event, attempts, last_error, dead_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&dead.subscription)
        .bind(&dead.topic)
        .bind(&event)
        .bind(dead.attempts as i32)
        .bind(&dead.last_error)
        .bind(dead.dead_at)
        .execute(&self.pool)
        .await
        .map_err(transport)?;
        Ok(())
    }

    fn wake(&self) -> watch::Receiver<u64> {
        self.wake.subscribe()
    }
}

/// PostgreSQL implementation of EventBus
///
/// # Example
///
/// ```ignore
/// use faultline_lifecycle::{BusConfig, PostgresEventBus};
///
/// let pool = sqlx::PgPool::connect("postgres://localhost/faultline").await?;
/// let bus = PostgresEventBus::connect(pool, BusConfig::from_env()).await?;
/// ```
pub struct PostgresEventBus {
    backend: Arc<PgBackend>,
    consumers: Consumers,
    config: BusConfig,
}

impl PostgresEventBus {
    /// Start listening for publish notifications. Migrations must have run.
    pub async fn connect(pool: PgPool, config: BusConfig) -> Result<Self, BusError> {
        let mut listener = PgListener::connect_with(&pool).await.map_err(transport)?;
        listener
            .listen(&config.notify_channel)
            .await
            .map_err(transport)?;

        let (wake, _) = watch::channel(0);
        let backend = Arc::new(PgBackend {
            pool,
            channel: config.notify_channel.clone(),
            wake,
        });
        let consumers = Consumers::new();

        consumers.tracker().spawn(listen(
            listener,
            backend.clone(),
            consumers.shutdown_token(),
            config.poll_interval,
        ));

        info!(channel = %config.notify_channel, "postgres event bus connected");
        Ok(Self {
            backend,
            consumers,
            config,
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }
}

/// Forward notifications to consumers until shutdown
async fn listen(
    mut listener: PgListener,
    backend: Arc<PgBackend>,
    shutdown: CancellationToken,
    retry_after: std::time::Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            notification = listener.recv() => match notification {
                Ok(notification) => {
                    let seq = notification.payload().parse::<u64>().unwrap_or_default();
                    backend.wake.send_replace(seq);
                }
                Err(e) => {
                    // PgListener reconnects on the next recv
                    warn!(error = %e, "bus listener lost connection");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
            }
        }
    }
    debug!("bus listener stopped");
}

#[async_trait]
impl EventBus for PostgresEventBus {
    #[instrument(skip(self, event), fields(sequence = event.sequence))]
    async fn publish(&self, topic: &str, event: &ExperimentEvent) -> Result<(), BusError> {
        topic::validate_topic(topic)?;
        if self.consumers.is_closed() {
            return Err(BusError::Closed);
        }
        let payload = serde_json::to_value(event).map_err(serialization)?;

        let mut tx = self.backend.pool.begin().await.map_err(transport)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PUBLISH_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(transport)?;

        let row = sqlx::query(
            r#"
            INSERT INTO bus_messages (topic, event) VALUES ($1, $2) RETURNING seq
            "#,
        )
        .bind(topic)
        .bind(&payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(transport)?;
        let seq: i64 = row.get("seq");

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.backend.channel)
            .bind(seq.to_string())
            .execute(&mut *tx)
            .await
            .map_err(transport)?;

        tx.commit().await.map_err(|e| {
            error!(topic, "Failed to commit publish: {}", e);
            transport(e)
        })?;

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

    #[instrument(skip(self))]
    async fn forget(&self, durable_name: &str) -> Result<bool, BusError> {
        if self.consumers.is_live(durable_name) {
            return Err(BusError::DurableNameInUse(durable_name.to_string()));
        }
        let result = sqlx::query("DELETE FROM bus_cursors WHERE durable_name = $1")
            .bind(durable_name)
            .execute(&self.backend.pool)
            .await
            .map_err(transport)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<BusPurge, BusError> {
        let live = self.consumers.live_names();
        let mut tx = self.backend.pool.begin().await.map_err(transport)?;

        let messages = sqlx::query("DELETE FROM bus_messages WHERE published_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(transport)?
            .rows_affected();

        // Only this process's live names are known; others refresh updated_at on ack
        let cursors = sqlx::query(
            r#"
            DELETE FROM bus_cursors
            WHERE updated_at < $1 AND NOT (durable_name = ANY($2))
            "#,
        )
        .bind(cutoff)
        .bind(&live)
        .execute(&mut *tx)
        .await
        .map_err(transport)?
        .rows_affected();

        tx.commit().await.map_err(transport)?;

        let purge = BusPurge { messages, cursors };
        if purge != BusPurge::default() {
            info!(messages, cursors, %cutoff, "purged bus");
        }
        Ok(purge)
    }

    async fn publish_dead_letter(&self, dead: DeadLetter) -> Result<(), BusError> {
        self.backend.record_dead_letter(dead).await
    }

    #[instrument(skip(self))]
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, BusError> {
        let rows = sqlx::query(
            r#"
            SELECT subscription, topic, event, attempts, last_error, dead_at
            FROM bus_dead_letters
            ORDER BY id
            "#,
        )
        .fetch_all(&self.backend.pool)
        .await
        .map_err(transport)?;

        rows.iter().map(parse_dead_letter).collect()
    }

    async fn shutdown(&self) {
        self.consumers.shutdown().await;
        info!("postgres event bus shut down");
    }
}
