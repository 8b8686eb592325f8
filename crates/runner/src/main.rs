// Faultline runner
// Decision: the runner owns the bus; it is shut down here and nowhere else
// Decision: without DATABASE_URL everything runs in memory with simulated injectors

mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use faultline_lifecycle::prelude::*;
use faultline_lifecycle::MIGRATOR;

use crate::telemetry::{init_telemetry, TelemetryConfig};

/// Interval between retention sweeps
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Injector kinds registered in dry-run mode
const SIMULATED_KINDS: &[&str] = &["latency", "error", "cpu-stress", "pod-kill"];

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(&TelemetryConfig::from_env());

    info!("faultline-runner starting...");

    let (store, bus) = build_backend().await?;
    let engine = Engine::new(store, bus.clone(), simulated_injectors())
        .with_config(EngineConfig::from_env());

    let report = engine
        .recover()
        .await
        .context("Failed to recover experiments")?;
    info!(
        loaded = report.loaded,
        active = report.active,
        resolved = report.resolved.len(),
        failed = report.failed.len(),
        "Recovery complete"
    );
    for (id, reason) in &report.failed {
        error!(experiment_id = %id, %reason, "Experiment could not be recovered");
    }

    let audit = bus
        .subscribe(ALL_EXPERIMENTS, "faultline-runner-audit", handler_fn(audit))
        .await
        .context("Failed to subscribe audit log")?;

    let mut purge = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = purge.tick() => {
                if let Err(e) = engine.purge_expired().await {
                    warn!(error = %e, "Retention sweep failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    audit.unsubscribe().await;
    bus.shutdown().await;
    info!("Runner shutdown complete");
    Ok(())
}

async fn build_backend() -> Result<(Arc<dyn ExperimentEventStore>, Arc<dyn EventBus>)> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        info!("DATABASE_URL not set, using in-memory store and bus");
        let store: Arc<dyn ExperimentEventStore> = Arc::new(InMemoryExperimentStore::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::with_config(BusConfig::from_env()));
        return Ok((store, bus));
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database migrations applied");

    let bus: Arc<dyn EventBus> = Arc::new(
        PostgresEventBus::connect(pool.clone(), BusConfig::from_env())
            .await
            .context("Failed to start PostgreSQL event bus")?,
    );
    let store: Arc<dyn ExperimentEventStore> = Arc::new(PostgresExperimentStore::new(pool));
    Ok((store, bus))
}

fn simulated_injectors() -> InjectorRegistry {
    SIMULATED_KINDS
        .iter()
        .fold(InjectorRegistry::new(), |registry, kind| {
            registry.with(Arc::new(SimulatedInjector::new(*kind)))
        })
}

async fn audit(delivery: Delivery) -> Result<(), HandlerError> {
    let event = &delivery.event;
    info!(
        target: "faultline_runner::audit",
        experiment_id = %event.experiment_id,
        sequence = event.sequence,
        event_type = %event.event_type,
        from = %event.from_state,
        to = %event.to_state,
        payload = %serde_json::Value::Object(event.payload.clone()),
        "lifecycle event"
    );
    Ok(())
}
