//! Tracing setup for the runner process
//!
//! Configure via environment variables:
//! - `RUST_LOG`: full filter directive, takes precedence
//! - `LOG_LEVEL`: level for the faultline crates (default: "info")

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_filter: String,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
            let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            format!("faultline_lifecycle={level},faultline_runner={level}")
        });
        Self { log_filter }
    }
}

pub fn init_telemetry(config: &TelemetryConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_filter(filter))
        .init();
}
