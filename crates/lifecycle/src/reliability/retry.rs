//! Bounded retry schedule
//!
//! Drives two loops: the bus redelivering to a handler that keeps failing
//! (dead-lettered once attempts run out) and the engine republishing a
//! committed event after a transport error.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_duration;

/// How many times to try, and how long to wait in between.
///
/// Attempts are 1-based; attempt 1 is the initial try and never waits.
///
/// ```
/// use faultline_lifecycle::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(50))
///     .with_jitter(0.0);
///
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(50));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the initial one included; at least 1
    pub max_attempts: u32,
    #[serde(with = "serde_duration::millis")]
    pub initial_interval: Duration,
    #[serde(with = "serde_duration::millis")]
    pub max_interval: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Fraction of each delay randomized in both directions
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// 5 attempts, 100ms doubling up to 10s, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before making `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retry) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let growth = self.multiplier.max(1.0).powi(retry.min(64) as i32);
        let ceiling = self.max_interval.max(self.initial_interval);
        let delay = Duration::try_from_secs_f64(self.initial_interval.as_secs_f64() * growth)
            .map_or(ceiling, |d| d.min(ceiling));

        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(ceiling)
    }

    /// Whether an attempt may follow `attempt`
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
