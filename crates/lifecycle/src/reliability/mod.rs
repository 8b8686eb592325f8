//! Reliability patterns
//!
//! - [`RetryPolicy`] - bounded retry with exponential backoff

mod retry;

pub use retry::RetryPolicy;
