//! Consumer retry logic with exponential backoff
//!
//! Bounds how often a consumed record's lifecycle is re-run before the failure
//! is surfaced to the operator.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, first attempt included
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// One attempt plus `redeliveries` retries
    pub fn with_redeliveries(redeliveries: u32) -> Self {
        Self {
            max_attempts: redeliveries.saturating_add(1),
            ..Self::default()
        }
    }

    /// Time spent sleeping between attempts when every attempt fails
    pub fn total_backoff(&self) -> Duration {
        let waits = self.max_attempts.max(1) - 1;
        let mut total = Duration::ZERO;
        let mut backoff = self.initial_backoff;

        for done in 0..waits {
            if done > 0 && backoff >= self.max_backoff {
                // capped from here on
                return total.saturating_add(backoff.saturating_mul(waits - done));
            }
            total = total.saturating_add(backoff);
            backoff = std::cmp::min(backoff.saturating_mul(2), self.max_backoff);
        }
        total
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Final result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Number of attempts made, at least 1
    pub attempts: u32,
}

/// Retry a fallible async operation with exponential backoff
///
/// The operation receives the 1-based attempt number. `should_retry` decides
/// whether an error is worth another attempt; errors it rejects end the loop
/// immediately.
///
/// # Example
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() {
/// let config = RetryConfig::default();
/// let outcome = retry_with_backoff(
///     |_attempt| async { Ok::<_, String>(42) },
///     |_err| true,
///     &config,
///     "example_operation",
/// )
/// .await;
/// assert_eq!(outcome.result, Ok(42));
/// assert_eq!(outcome.attempts, 1);
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    mut operation: F,
    should_retry: R,
    config: &RetryConfig,
    context: &str,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(result),
                    attempts: attempt,
                };
            }
            Err(e) => {
                if attempt >= max_attempts || !should_retry(&e) {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed, giving up"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }

                warn!(
                    context = %context,
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;

                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}
