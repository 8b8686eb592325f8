//! Runtime configuration
//!
//! Every config has sensible defaults and a `from_env()` constructor reading
//! `FAULTLINE_*` variables; unparsable values fall back to the default.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;
use crate::serde_duration;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

// =============================================================================
// Retention
// =============================================================================

/// How long terminal experiments stay in the event store
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(with = "serde_duration::millis")]
    pub window: Duration,
}

impl RetentionPolicy {
    pub fn days(days: u64) -> Self {
        Self {
            window: Duration::from_secs(days * 24 * 60 * 60),
        }
    }

    pub fn from_env() -> Self {
        env_parse("FAULTLINE_RETENTION_DAYS")
            .map(Self::days)
            .unwrap_or_default()
    }

    /// Oldest last-transition time that is still retained
    pub fn cutoff(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);
        now.checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::days(7)
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for a single injector call
    #[serde(with = "serde_duration::millis")]
    pub action_timeout: Duration,
    /// Retries for publishing a committed event before dead-lettering it
    pub publish_retry: RetryPolicy,
    pub retention: RetentionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            publish_retry: RetryPolicy::exponential(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let publish_retry = match env_parse::<u32>("FAULTLINE_PUBLISH_MAX_ATTEMPTS") {
            Some(attempts) => defaults.publish_retry.clone().with_max_attempts(attempts),
            None => defaults.publish_retry.clone(),
        };

        Self {
            action_timeout: env_millis("FAULTLINE_ACTION_TIMEOUT_MS")
                .unwrap_or(defaults.action_timeout),
            publish_retry,
            retention: RetentionPolicy::from_env(),
        }
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }
}

// =============================================================================
// Event bus
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Redelivery schedule; `max_attempts` deliveries before dead-lettering
    pub redelivery: RetryPolicy,
    /// Messages fetched per consumer round trip
    pub batch_size: usize,
    /// PostgreSQL NOTIFY channel used for wake-ups
    pub notify_channel: String,
    /// Fallback poll interval when no wake-up arrives
    #[serde(with = "serde_duration::millis")]
    pub poll_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            redelivery: RetryPolicy::exponential(),
            batch_size: 64,
            notify_channel: "faultline_bus".to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut redelivery = defaults.redelivery.clone();
        if let Some(attempts) = env_parse::<u32>("FAULTLINE_BUS_MAX_DELIVER") {
            redelivery = redelivery.with_max_attempts(attempts);
        }
        if let Some(backoff) = env_millis("FAULTLINE_BUS_BACKOFF_MS") {
            redelivery = redelivery.with_initial_interval(backoff);
        }

        Self {
            redelivery,
            batch_size: env_parse("FAULTLINE_BUS_BATCH_SIZE")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_size),
            notify_channel: std::env::var("FAULTLINE_BUS_CHANNEL")
                .unwrap_or(defaults.notify_channel),
            poll_interval: env_millis("FAULTLINE_BUS_POLL_MS").unwrap_or(defaults.poll_interval),
        }
    }

    pub fn with_redelivery(mut self, policy: RetryPolicy) -> Self {
        self.redelivery = policy;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

// =============================================================================
// Workflow executor
// =============================================================================

/// What a step does when a dependency was skipped because its condition was
/// false. Dependencies skipped due to an upstream failure always skip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkippedDependencyPolicy {
    #[default]
    Skip,
    Proceed,
}

impl FromStr for SkippedDependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "proceed" => Ok(Self::Proceed),
            other => Err(format!("unknown skipped dependency policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Steps running at the same time
    pub concurrency: usize,
    pub skipped_dependency: SkippedDependencyPolicy,
    /// How long a step waits for its terminal event after the last transition
    #[serde(with = "serde_duration::millis")]
    pub terminal_wait: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            skipped_dependency: SkippedDependencyPolicy::Skip,
            terminal_wait: Duration::from_secs(5),
        }
    }
}

impl WorkflowConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse("FAULTLINE_WORKFLOW_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            skipped_dependency: env_parse("FAULTLINE_WORKFLOW_SKIPPED_DEPENDENCY")
                .unwrap_or(defaults.skipped_dependency),
            terminal_wait: env_millis("FAULTLINE_WORKFLOW_TERMINAL_WAIT_MS")
                .unwrap_or(defaults.terminal_wait),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_skipped_dependency(mut self, policy: SkippedDependencyPolicy) -> Self {
        self.skipped_dependency = policy;
        self
    }

    pub fn with_terminal_wait(mut self, wait: Duration) -> Self {
        self.terminal_wait = wait;
        self
    }
}
