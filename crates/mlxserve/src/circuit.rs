// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Circuit breaker for worker-facing dispatch.
//!
//! CLOSED admits everything and counts failures within a rolling window.
//! Crossing `failure_threshold` opens the circuit: calls are rejected
//! locally with `CircuitOpen` until `recovery_timeout` elapses, then
//! HALF_OPEN admits up to `half_open_max_calls` probes. A run of
//! `half_open_success_threshold` successes closes the circuit; any
//! failure in HALF_OPEN reopens it.

use crate::error::{Error, Result};
use crate::metrics_constants::METRIC_CIRCUIT_STATE_CHANGES_TOTAL;
use parking_lot::Mutex;
use prometheus::{CounterVec, Opts};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{info, warn};

static STATE_CHANGES: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(
            METRIC_CIRCUIT_STATE_CHANGES_TOTAL,
            "Circuit breaker state transitions",
        ),
        &["breaker", "to"],
    )
});

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit
    pub failure_threshold: u32,
    /// Window over which failures are counted
    #[serde(with = "crate::config::duration_ms")]
    pub failure_window: Duration,
    /// Time spent OPEN before probing
    #[serde(with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,
    /// Probe budget while HALF_OPEN
    pub half_open_max_calls: u32,
    /// Consecutive probe successes required to close
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(15),
            half_open_max_calls: 3,
            half_open_success_threshold: 2,
        }
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Rejecting all calls
    Open,
    /// Admitting a bounded number of probes
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

/// A named circuit breaker guarding one downstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

/// Permit handle for an admitted call. The caller must report the
/// outcome via [`CircuitBreaker::record_success`] /
/// [`CircuitBreaker::record_failure`]; HALF_OPEN slots are released by
/// the outcome report.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPermit {
    admitted_in: CircuitState,
}

impl CircuitBreaker {
    /// Create a breaker named for its downstream (used in metrics labels).
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
                half_open_successes: 0,
            }),
        }
    }

    /// Current state, advancing OPEN → HALF_OPEN when the recovery
    /// timeout has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        inner.state
    }

    /// Try to admit a call.
    ///
    /// # Errors
    ///
    /// `CircuitOpen` when the circuit is OPEN, or when HALF_OPEN and the
    /// probe budget is exhausted.
    pub fn try_acquire(&self) -> Result<CircuitPermit> {
        let mut inner = self.inner.lock();
        self.maybe_enter_half_open(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(CircuitPermit {
                admitted_in: CircuitState::Closed,
            }),
            CircuitState::Open => Err(Error::CircuitOpen(format!(
                "{}: rejecting until recovery timeout elapses",
                self.name
            ))),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(Error::CircuitOpen(format!(
                        "{}: half-open probe budget exhausted",
                        self.name
                    )));
                }
                inner.half_open_in_flight += 1;
                Ok(CircuitPermit {
                    admitted_in: CircuitState::HalfOpen,
                })
            }
        }
    }

    /// Record a successful outcome for an admitted call.
    pub fn record_success(&self, permit: CircuitPermit) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if permit.admitted_in == CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.failures.clear();
                }
            }
            _ => {
                // Closed: success prunes nothing; the window handles decay.
            }
        }
    }

    /// Record a failed outcome for an admitted call.
    pub fn record_failure(&self, permit: CircuitPermit) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen if permit.admitted_in == CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.transition(&mut inner, CircuitState::Open);
                inner.opened_at = Some(Instant::now());
                warn!(breaker = %self.name, "Half-open probe failed; reopening circuit");
            }
            CircuitState::Closed => {
                let now = Instant::now();
                inner.failures.push_back(now);
                let window = self.config.failure_window;
                while let Some(front) = inner.failures.front() {
                    if now.duration_since(*front) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures.len(),
                        "Failure threshold crossed; opening circuit"
                    );
                }
            }
            _ => {}
        }
    }

    fn maybe_enter_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.config.recovery_timeout {
                self.transition(inner, CircuitState::HalfOpen);
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                info!(breaker = %self.name, "Recovery timeout elapsed; entering half-open");
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state != to {
            inner.state = to;
            STATE_CHANGES
                .with_label_values(&[self.name.as_str(), &to.to_string()])
                .inc();
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 2,
            half_open_success_threshold: 2,
        }
    }

    #[test]
    fn test_starts_closed_and_admits() {
        let breaker = CircuitBreaker::new("test", fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            breaker.try_acquire(),
            Err(Error::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_half_open_probe_budget() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Budget of 2 probes, no more.
        let p1 = breaker.try_acquire().unwrap();
        let _p2 = breaker.try_acquire().unwrap();
        assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen(_))));

        // Outcome report frees the slot.
        breaker.record_success(p1);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_half_open_successes_close() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let p1 = breaker.try_acquire().unwrap();
        breaker.record_success(p1);
        let p2 = breaker.try_acquire().unwrap();
        breaker.record_success(p2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let probe = breaker.try_acquire().unwrap();
        breaker.record_failure(probe);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_admits_zero_calls() {
        let breaker = CircuitBreaker::new("test", fast_config());
        for _ in 0..3 {
            let permit = breaker.try_acquire().unwrap();
            breaker.record_failure(permit);
        }
        for _ in 0..10 {
            assert!(breaker.try_acquire().is_err());
        }
    }
}
