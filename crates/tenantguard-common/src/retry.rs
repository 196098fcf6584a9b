//! Retry with exponential backoff and jitter
//!
//! Used for calls to the orchestration platform that are allowed to block
//! startup (the initial policy load). Request-path calls never retry.
//!
//! ```ignore
//! use tenantguard_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let bindings = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(3),
//!     "initial policy load",
//!     |e: &Error| e.is_upstream_unavailable(),
//!     || async { source.list_bindings().await },
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts including the first (0 = unbounded)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Bounded retry with default delays
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or
/// attempts run out.
///
/// Returns the last error when giving up. Delays grow by
/// `backoff_multiplier`, capped at `max_delay`, each scaled by a random
/// jitter in `0.5..1.5`.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Giving up after max attempts"
            );
            return Err(e);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let sleep_for = delay.mul_f64(jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = sleep_for.as_millis() as u64,
            "Attempt failed, retrying"
        );
        tokio::time::sleep(sleep_for).await;

        delay = delay
            .mul_f64(config.backoff_multiplier)
            .min(config.max_delay);
    }
}
