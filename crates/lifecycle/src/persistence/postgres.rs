//! PostgreSQL implementation of ExperimentEventStore
//!
//! - `experiments` holds the current state, last sequence and write-ahead intent
//! - `experiment_events` is the append-only log keyed by `(experiment_id, sequence)`
//! - Append locks the experiment row (`FOR UPDATE`) and checks the expected
//!   sequence before inserting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::{ExperimentEventStore, StoreError};
use crate::event::{EventType, ExperimentEvent, NewEvent};
use crate::experiment::{ExperimentId, ExperimentRecord};
use crate::machine::{ExperimentState, Trigger};

/// Schema for the event store and the PostgreSQL event bus
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Rows fetched per page by `read`
const READ_PAGE_SIZE: i64 = 256;

/// PostgreSQL implementation of ExperimentEventStore
///
/// # Example
///
/// ```ignore
/// use faultline_lifecycle::PostgresExperimentStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/faultline").await?;
/// let store = PostgresExperimentStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresExperimentStore {
    pool: PgPool,
}

impl PostgresExperimentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        MIGRATOR.run(&self.pool).await
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_state(s: &str) -> Result<ExperimentState, StoreError> {
    s.parse().map_err(StoreError::Serialization)
}

fn parse_record(row: &PgRow) -> Result<ExperimentRecord, StoreError> {
    let spec: serde_json::Value = row.get("spec");
    let state: String = row.get("state");
    let in_flight: Option<String> = row.get("in_flight");
    let sequence: i64 = row.get("sequence");

    Ok(ExperimentRecord {
        id: ExperimentId::from(row.get::<String, _>("id")),
        spec: serde_json::from_value(spec).map_err(ser_err)?,
        state: parse_state(&state)?,
        sequence: sequence as u64,
        in_flight: in_flight
            .map(|t| t.parse::<Trigger>().map_err(StoreError::Serialization))
            .transpose()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_event(row: &PgRow) -> Result<ExperimentEvent, StoreError> {
    let event_type: String = row.get("event_type");
    let from_state: String = row.get("from_state");
    let to_state: String = row.get("to_state");
    let triggers: serde_json::Value = row.get("triggers");
    let payload: serde_json::Value = row.get("payload");
    let sequence: i64 = row.get("sequence");

    Ok(ExperimentEvent {
        experiment_id: ExperimentId::from(row.get::<String, _>("experiment_id")),
        sequence: sequence as u64,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| StoreError::Serialization(format!("unknown event type: {event_type}")))?,
        from_state: parse_state(&from_state)?,
        to_state: parse_state(&to_state)?,
        triggers: serde_json::from_value(triggers).map_err(ser_err)?,
        payload: serde_json::from_value(payload).map_err(ser_err)?,
        timestamp: row.get("created_at"),
    })
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event: &ExperimentEvent,
) -> Result<(), StoreError> {
    let triggers = serde_json::to_value(&event.triggers).map_err(ser_err)?;
    sqlx::query(
        r#"
        INSERT INTO experiment_events
            (experiment_id, sequence, event_type, from_state, to_state, triggers, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(event.experiment_id.as_str())
    .bind(event.sequence as i64)
    .bind(event.event_type.as_str())
    .bind(event.from_state.as_str())
    .bind(event.to_state.as_str())
    .bind(&triggers)
    .bind(serde_json::Value::Object(event.payload.clone()))
    .bind(event.timestamp)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[async_trait]
impl ExperimentEventStore for PostgresExperimentStore {
    #[instrument(skip(self, record, created), fields(experiment_id = %record.id))]
    async fn create_experiment(
        &self,
        record: ExperimentRecord,
        created: NewEvent,
    ) -> Result<ExperimentEvent, StoreError> {
        let spec = serde_json::to_value(&record.spec).map_err(ser_err)?;
        let event = created.into_event(1, record.created_at);

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO experiments (id, name, spec, state, sequence, in_flight, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, NULL, $5, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id.as_str())
        .bind(&record.spec.name)
        .bind(&spec)
        .bind(event.to_state.as_str())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(record.id));
        }

        insert_event(&mut tx, &event).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(experiment_id = %record.id, "created experiment");
        Ok(event)
    }

    #[instrument(skip(self, event), fields(experiment_id = %event.experiment_id, event_type = %event.event_type))]
    async fn append(
        &self,
        event: NewEvent,
        expected_sequence: u64,
    ) -> Result<ExperimentEvent, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"
            SELECT sequence FROM experiments WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(event.experiment_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(event.experiment_id.clone()))?;

        let actual = row.get::<i64, _>("sequence") as u64;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual,
            });
        }

        let event = event.into_event(actual + 1, Utc::now());
        insert_event(&mut tx, &event).await?;

        sqlx::query(
            r#"
            UPDATE experiments
            SET state = $2, sequence = $3, in_flight = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(event.experiment_id.as_str())
        .bind(event.to_state.as_str())
        .bind(event.sequence as i64)
        .bind(event.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(|e| {
            error!(experiment_id = %event.experiment_id, "Failed to commit append: {}", e);
            db_err(e)
        })?;

        debug!(experiment_id = %event.experiment_id, sequence = event.sequence, "appended event");
        Ok(event)
    }

    fn read(
        &self,
        experiment_id: ExperimentId,
        from_sequence: u64,
    ) -> BoxStream<'_, Result<ExperimentEvent, StoreError>> {
        let pool = self.pool.clone();

        stream::try_unfold(Some(from_sequence.max(1)), move |cursor| {
            let pool = pool.clone();
            let experiment_id = experiment_id.clone();
            async move {
                let Some(from) = cursor else {
                    return Ok::<_, StoreError>(None);
                };

                let rows = sqlx::query(
                    r#"
                    SELECT experiment_id, sequence, event_type, from_state, to_state,
                           triggers, payload, created_at
                    FROM experiment_events
                    WHERE experiment_id = $1 AND sequence >= $2
                    ORDER BY sequence
                    LIMIT $3
                    "#,
                )
                .bind(experiment_id.as_str())
                .bind(from as i64)
                .bind(READ_PAGE_SIZE)
                .fetch_all(&pool)
                .await
                .map_err(db_err)?;

                if rows.is_empty() {
                    return Ok(None);
                }

                let full_page = rows.len() as i64 == READ_PAGE_SIZE;
                let events = rows.iter().map(parse_event).collect::<Vec<_>>();
                let next = match events.last() {
                    Some(Ok(last)) if full_page => Some(last.sequence + 1),
                    _ => None,
                };
                Ok(Some((stream::iter(events), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    #[instrument(skip(self))]
    async fn last_sequence(&self, experiment_id: &ExperimentId) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT sequence FROM experiments WHERE id = $1
            "#,
        )
        .bind(experiment_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map_or(0, |r| r.get::<i64, _>("sequence") as u64))
    }

    #[instrument(skip(self))]
    async fn get_experiment(
        &self,
        experiment_id: &ExperimentId,
    ) -> Result<ExperimentRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, spec, state, sequence, in_flight, created_at, updated_at
            FROM experiments
            WHERE id = $1
            "#,
        )
        .bind(experiment_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to get experiment: {}", e);
            db_err(e)
        })?
        .ok_or_else(|| StoreError::NotFound(experiment_id.clone()))?;

        parse_record(&row)
    }

    #[instrument(skip(self))]
    async fn list_experiments(&self) -> Result<Vec<ExperimentRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, spec, state, sequence, in_flight, created_at, updated_at
            FROM experiments
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(parse_record).collect()
    }

    #[instrument(skip(self))]
    async fn set_in_flight(
        &self,
        experiment_id: &ExperimentId,
        trigger: Option<Trigger>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE experiments SET in_flight = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(experiment_id.as_str())
        .bind(trigger.map(Trigger::as_str))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(experiment_id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExperimentId>, StoreError> {
        let terminal: Vec<String> = ExperimentState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str().to_string())
            .collect();

        // Events go with the row (ON DELETE CASCADE)
        let ids: Vec<String> = sqlx::query(
            r#"
            DELETE FROM experiments
            WHERE state = ANY($1) AND updated_at < $2
            RETURNING id
            "#,
        )
        .bind(&terminal)
        .bind(cutoff)
        .fetch(&self.pool)
        .map_ok(|row| row.get::<String, _>("id"))
        .try_collect()
        .await
        .map_err(db_err)?;

        debug!(purged = ids.len(), %cutoff, "purged expired experiments");
        Ok(ids.into_iter().map(ExperimentId::from).collect())
    }
}
