//! Retry utilities with exponential backoff and jitter.
//!
//! Three pieces live here:
//! - [`retry_with_backoff`] retries an async operation in place (used for
//!   persisting bookkeeping once the machine pools have been mutated)
//! - [`with_timeout`] bounds every API call so a hung server surfaces as a
//!   transient error instead of a stuck reconcile
//! - [`FailureTracker`] counts consecutive failed passes per workload so the
//!   error policy can requeue with exponential backoff

use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

use crate::error::{timeout_error, Error};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries until success, until `max_attempts` is exhausted, or until the
/// error is not retryable according to `should_retry`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Add jitter: 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered_delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Run `operation` with a deadline, mapping expiry to [`Error::Transient`]
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    context: &str,
    operation: Fut,
) -> Result<T, Error>
where
    Fut: Future<Output = Result<T, Error>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(context, timeout)),
    }
}

/// Exponential delay for the `failures`-th consecutive failure, capped at `max`
pub fn exponential_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(32);
    let delay = initial.as_secs_f64() * 2f64.powi(exponent as i32);
    Duration::from_secs_f64(delay.min(max.as_secs_f64()))
}

/// Consecutive failure counts keyed by object identity
#[derive(Debug)]
pub struct FailureTracker<K: Eq + Hash> {
    failures: DashMap<K, u32>,
}

impl<K: Eq + Hash> Default for FailureTracker<K> {
    fn default() -> Self {
        Self {
            failures: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash> FailureTracker<K> {
    /// Record a failed pass and return the new consecutive failure count
    pub fn record_failure(&self, key: K) -> u32 {
        let mut entry = self.failures.entry(key).or_insert(0);
        let next = entry.saturating_add(1);
        *entry = next;
        next
    }

    /// Forget the failures of a key after a successful pass
    pub fn reset(&self, key: &K) {
        self.failures.remove(key);
    }

    /// Current consecutive failure count for a key
    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).map(|v| *v).unwrap_or(0)
    }
}
