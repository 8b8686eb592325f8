//! Metric source for workflow `metric` conditions

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("metric not found: {0}")]
    NotFound(String),

    #[error("metric source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MetricSource: Send + Sync + 'static {
    /// Current value of a named metric
    async fn value(&self, name: &str) -> Result<f64, MetricError>;
}

/// Fixed metric values, settable at runtime
#[derive(Debug, Default)]
pub struct StaticMetrics {
    values: RwLock<HashMap<String, f64>>,
}

impl StaticMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&self, name: impl Into<String>, value: f64) {
        self.values.write().insert(name.into(), value);
    }
}

#[async_trait]
impl MetricSource for StaticMetrics {
    async fn value(&self, name: &str) -> Result<f64, MetricError> {
        self.values
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| MetricError::NotFound(name.to_string()))
    }
}
