//! Fixed-count retry for whole operations.
//!
//! Download and connect attempts are retried immediately: each attempt
//! re-does every step from scratch, so there is no delay schedule to tune.

use std::future::Future;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RetryConfig {
    /// Create a new retry config with a single attempt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a retry count, i.e. attempts after the first.
    pub fn from_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries.saturating_add(1),
        }
    }

    /// Set the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

/// Statistics about a retry operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation until it succeeds, fails permanently, or runs
/// out of attempts.
///
/// The error from the last attempt is returned as-is.
///
/// # Arguments
///
/// * `config` - Retry configuration
/// * `operation` - Called once per attempt with the 1-based attempt number
/// * `should_retry` - Predicate to determine if an error is retryable
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        stats.attempts = attempt;

        match operation(attempt).await {
            Ok(value) => {
                stats.success = true;
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());

                if !should_retry(&e) {
                    debug!("Error is not retryable: {}", e);
                    return (Err(e), stats);
                }

                if attempt >= max_attempts {
                    if max_attempts > 1 {
                        warn!(
                            "All {} attempts exhausted. Last error: {}",
                            max_attempts, e
                        );
                    }
                    return (Err(e), stats);
                }

                warn!("Attempt {}/{} failed: {}. Retrying", attempt, max_attempts, e);
                attempt += 1;
            }
        }
    }
}
