//! Retry utilities for calls to backing stores and other dependencies.
//!
//! Wraps `backoff`'s exponential policy with a retry budget. Callers decide
//! which failures are transient; permanent failures are returned immediately.

use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to randomize each backoff by up to 25%.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a config for quick retries (smaller backoffs).
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// The backoff schedule. Elapsed time is unbounded; `max_retries` is the
    /// only stop condition.
    pub fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(self.backoff_multiplier)
            .with_randomization_factor(if self.add_jitter { 0.25 } else { 0.0 })
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `f` until it succeeds, the error is not retryable, or the retry budget
/// is spent.
///
/// # Example
/// ```ignore
/// let exists = retry_with_backoff(
///     &RetryConfig::quick(),
///     "is_revoked",
///     |e: &StoreError| e.is_transient(),
///     || store.exists_any(&keys),
/// )
/// .await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation_name: &str,
    is_retryable: R,
    f: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let attempts = AtomicU32::new(0);

    let result = retry_notify(
        config.policy(),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let call = f();
            let is_retryable = &is_retryable;
            async move {
                call.await.map_err(|err| {
                    if !is_retryable(&err) {
                        return backoff::Error::permanent(err);
                    }
                    if attempt > config.max_retries {
                        warn!(
                            operation = operation_name,
                            attempt = attempt,
                            error = %err,
                            "Call failed after max retries"
                        );
                        return backoff::Error::permanent(err);
                    }
                    backoff::Error::transient(err)
                })
            }
        },
        |err: E, wait: Duration| {
            warn!(
                operation = operation_name,
                attempt = attempts.load(Ordering::SeqCst),
                error = %err,
                backoff_ms = wait.as_millis() as u64,
                "Call failed, retrying after backoff"
            );
        },
    )
    .await;

    let attempt = attempts.load(Ordering::SeqCst);
    if result.is_ok() && attempt > 1 {
        info!(
            operation = operation_name,
            attempt = attempt,
            "Call succeeded after retry"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_policy_grows_exponentially() {
        let config = RetryConfig {
            add_jitter: false,
            ..Default::default()
        };
        let mut policy = config.policy();
        let mut next_ms = || policy.next_backoff().map(|d| d.as_millis());

        assert_eq!(next_ms(), Some(100));
        assert_eq!(next_ms(), Some(200));
        assert_eq!(next_ms(), Some(400));
    }

    #[test]
    fn test_policy_is_capped() {
        let config = RetryConfig {
            add_jitter: false,
            max_backoff: Duration::from_millis(250),
            ..Default::default()
        };
        let mut policy = config.policy();
        for _ in 0..10 {
            policy.next_backoff();
        }
        assert_eq!(policy.next_backoff().map(|d| d.as_millis()), Some(250));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::default();
        let result: Result<i32, String> =
            retry_with_backoff(&config, "test_op", |_| true, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(1),
            add_jitter: false,
            ..RetryConfig::quick()
        };

        let result: Result<u32, String> = retry_with_backoff(
            &config,
            "flaky",
            |_| true,
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("timeout".to_string())
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_is_respected() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            add_jitter: false,
            ..RetryConfig::quick()
        };

        let result: Result<(), String> = retry_with_backoff(
            &config,
            "always_down",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            },
        )
        .await;

        assert_eq!(result, Err("timeout".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_permanent_failure() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &RetryConfig::quick(),
            "test_op",
            |e: &String| e != "not found",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("not found".to_string()) }
            },
        )
        .await;

        assert_eq!(result, Err("not found".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_config_gives_up_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &RetryConfig::no_retry(),
            "write",
            |_| true,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
