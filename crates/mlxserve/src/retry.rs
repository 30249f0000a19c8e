// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Retry with exponential backoff and jitter.
//!
//! `delay = min(max_delay, initial_delay * multiplier^(attempt-1))`, then
//! scaled by `(1 ± jitter)`. Attempts include the first; only errors the
//! taxonomy classifies as retryable ([`Error::is_retryable`]) are retried.
//! Safe only for idempotent operations; `generate` is dispatched with a
//! single-attempt policy unless explicitly configured otherwise.

use crate::error::Result;
use crate::metrics_constants::METRIC_RETRIES_TOTAL;
use prometheus::CounterVec;
use prometheus::Opts;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

static RETRIES: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_RETRIES_TOTAL, "Total retry attempts by operation"),
        &["operation"],
    )
});

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Jitter fraction in `[0, 1]`; the delay is scaled by a uniform
    /// sample from `[1 - jitter, 1 + jitter]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_jitter(3)
    }
}

impl RetryPolicy {
    /// Exponential backoff without jitter.
    #[must_use]
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Exponential backoff with the standard ±25% jitter.
    #[must_use]
    pub fn default_jitter(max_attempts: u32) -> Self {
        Self {
            jitter: 0.25,
            ..Self::exponential(max_attempts)
        }
    }

    /// A policy that never retries. Used for non-idempotent methods.
    #[must_use]
    pub fn none() -> Self {
        Self::exponential(1)
    }

    /// Set the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (1-based: the delay taken
    /// after the first failed attempt is `delay_for_attempt(1)`).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }
}

/// Aggregate retry statistics, shared across call sites.
#[derive(Debug, Default)]
pub struct RetryStats {
    total_operations: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    /// Retries indexed by the attempt they preceded (attempt 2..=N)
    retries_by_attempt: [AtomicU64; 16],
}

impl RetryStats {
    /// Create an empty stats block.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record_retry(&self, attempt: u32) {
        let idx = (attempt as usize).saturating_sub(2).min(15);
        self.retries_by_attempt[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Total operations started.
    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }

    /// Operations that ultimately succeeded.
    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    /// Operations that ultimately failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Fraction of operations that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 {
            return 1.0;
        }
        self.successful() as f64 / total as f64
    }

    /// Mean retries per operation.
    pub fn average_retries(&self) -> f64 {
        let total = self.total_operations();
        if total == 0 {
            return 0.0;
        }
        let retries: u64 = self
            .retries_by_attempt
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum();
        retries as f64 / total as f64
    }

    /// Retries recorded before the given attempt number (2-based).
    pub fn retries_before_attempt(&self, attempt: u32) -> u64 {
        let idx = (attempt as usize).saturating_sub(2).min(15);
        self.retries_by_attempt[idx].load(Ordering::Relaxed)
    }
}

/// Run `op` under `policy`, retrying retryable failures.
///
/// `operation` labels the retry counter metric. `stats`, when provided,
/// accumulates outcome counts for the caller's reporting surface.
///
/// # Errors
///
/// The last error once attempts are exhausted, or the first
/// non-retryable error immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    stats: Option<&RetryStats>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if let Some(stats) = stats {
        stats.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => {
                if let Some(stats) = stats {
                    stats.successful.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                RETRIES.with_label_values(&[operation]).inc();
                if let Some(stats) = stats {
                    stats.record_retry(attempt);
                }
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if let Some(stats) = stats {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                return Err(err);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_delay_grows_exponentially_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            backoff_multiplier: 10.0,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay_for_attempt(1).as_secs_f64();
            assert!((0.05..=0.15).contains(&d), "delay {d} outside jitter band");
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3).with_initial_delay(Duration::from_millis(1));
        let stats = RetryStats::new();
        let result = with_retry(&policy, "test", Some(&stats), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transport("flaky".to_string()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.successful(), 1);
        assert!(stats.average_retries() > 0.0);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(5).with_initial_delay(Duration::from_millis(1));
        let err = with_retry(&policy, "test", None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::InvalidParams("bad".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted_returns_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::exponential(3).with_initial_delay(Duration::from_millis(1));
        let stats = RetryStats::new();
        let err = with_retry(&policy, "test", Some(&stats), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Transport("down".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.failed(), 1);
    }

    #[tokio::test]
    async fn test_policy_none_never_retries() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&RetryPolicy::none(), "test", None, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Error::Transport("down".to_string())) }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
