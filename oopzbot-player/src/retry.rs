//! Bounded retry with exponential backoff
//!
//! Shared by the cache layer (track resolution) and the state publisher
//! (store writes). Every attempt is bounded by its own timeout.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// How often and how patiently to retry an operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1)
    pub attempts: u32,
    /// Upper bound for a single attempt
    pub timeout: Duration,
    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff: Duration,
    /// Backoff cap
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.attempts` attempts have been made.
///
/// An attempt that exceeds `policy.timeout` is abandoned and counted as a
/// failure carrying `on_timeout(policy.timeout)`. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    on_timeout: E,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    E: Fn(Duration) -> Error,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;

        let outcome = match tokio::time::timeout(policy.timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(policy.timeout)),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() || attempt >= attempts => {
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    error = %err,
                    "Operation failed, giving up"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = backoff.min(policy.max_backoff);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, will retry after backoff"
                );
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
}
