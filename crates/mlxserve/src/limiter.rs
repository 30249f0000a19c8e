// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Per-tier concurrency limiting.
//!
//! Models are bucketed into coarse size tiers; each tier carries a
//! concurrency cap, a bounded wait queue, and a queue timeout. The
//! limiter is the only admitter in front of the Worker Runtime besides
//! the scheduler, and its caps are runtime-adjustable so the auto-tuner
//! and QoS remediation can resize them.

use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_TIER_ACTIVE, METRIC_TIER_ADMISSIONS_TOTAL, METRIC_TIER_REJECTIONS_TOTAL,
};
use parking_lot::Mutex;
use prometheus::{CounterVec, GaugeVec, Opts};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

static ADMISSIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_TIER_ADMISSIONS_TOTAL, "Tier admissions"),
        &["tier"],
    )
});

static REJECTIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_TIER_REJECTIONS_TOTAL, "Tier rejections"),
        &["tier", "reason"],
    )
});

static ACTIVE: LazyLock<GaugeVec> = LazyLock::new(|| {
    crate::metrics_utils::gauge_vec(
        Opts::new(METRIC_TIER_ACTIVE, "Active permits per tier"),
        &["tier"],
    )
});

/// Coarse model-size buckets driving concurrency caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// 30B parameters and above
    Xl30BPlus,
    /// 13B to 27B
    Lg13To27B,
    /// 7B to 13B
    Md7To13B,
    /// 3B to 7B
    Sm3To7B,
    /// Under 3B
    Sub3B,
}

impl ModelTier {
    /// All tiers, largest first.
    pub const ALL: [ModelTier; 5] = [
        ModelTier::Xl30BPlus,
        ModelTier::Lg13To27B,
        ModelTier::Md7To13B,
        ModelTier::Sm3To7B,
        ModelTier::Sub3B,
    ];

    /// Best-effort bucket from a model id before the worker has
    /// reported a real parameter count ("mlx-community/Qwen2.5-7B" →
    /// the 7-13B tier). Ids without a recognizable size land in the
    /// smallest tier.
    #[must_use]
    pub fn guess_from_id(id: &str) -> Self {
        let lowered = id.to_ascii_lowercase();
        let bytes = lowered.as_bytes();
        let mut best: Option<f64> = None;
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b'b' {
                    let boundary =
                        i + 1 >= bytes.len() || !bytes[i + 1].is_ascii_alphanumeric();
                    if boundary {
                        if let Ok(value) = lowered[start..i].parse::<f64>() {
                            best = Some(best.map_or(value, |b: f64| b.max(value)));
                        }
                    }
                }
            }
            i += 1;
        }
        best.map_or(ModelTier::Sub3B, Self::from_parameter_count)
    }

    /// Bucket a model by parameter count in billions.
    #[must_use]
    pub fn from_parameter_count(billions: f64) -> Self {
        if billions >= 30.0 {
            ModelTier::Xl30BPlus
        } else if billions >= 13.0 {
            ModelTier::Lg13To27B
        } else if billions >= 7.0 {
            ModelTier::Md7To13B
        } else if billions >= 3.0 {
            ModelTier::Sm3To7B
        } else {
            ModelTier::Sub3B
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTier::Xl30BPlus => write!(f, "30B+"),
            ModelTier::Lg13To27B => write!(f, "13-27B"),
            ModelTier::Md7To13B => write!(f, "7-13B"),
            ModelTier::Sm3To7B => write!(f, "3-7B"),
            ModelTier::Sub3B => write!(f, "<3B"),
        }
    }
}

/// Caps for one tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierLimit {
    /// Concurrent executions admitted
    pub max_concurrent: usize,
    /// Waiters tolerated before immediate rejection
    pub queue_depth: usize,
    /// Wait budget before a queued admission times out
    pub queue_timeout_ms: u64,
}

/// Per-tier caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLimitsConfig {
    /// 30B+
    pub xl_30b_plus: TierLimit,
    /// 13-27B
    pub lg_13_to_27b: TierLimit,
    /// 7-13B
    pub md_7_to_13b: TierLimit,
    /// 3-7B
    pub sm_3_to_7b: TierLimit,
    /// <3B
    pub sub_3b: TierLimit,
}

impl Default for TierLimitsConfig {
    fn default() -> Self {
        Self {
            xl_30b_plus: TierLimit {
                max_concurrent: 1,
                queue_depth: 4,
                queue_timeout_ms: 60_000,
            },
            lg_13_to_27b: TierLimit {
                max_concurrent: 2,
                queue_depth: 8,
                queue_timeout_ms: 45_000,
            },
            md_7_to_13b: TierLimit {
                max_concurrent: 4,
                queue_depth: 16,
                queue_timeout_ms: 30_000,
            },
            sm_3_to_7b: TierLimit {
                max_concurrent: 8,
                queue_depth: 32,
                queue_timeout_ms: 30_000,
            },
            sub_3b: TierLimit {
                max_concurrent: 16,
                queue_depth: 64,
                queue_timeout_ms: 15_000,
            },
        }
    }
}

impl TierLimitsConfig {
    /// Look up one tier's caps.
    #[must_use]
    pub fn get(&self, tier: ModelTier) -> TierLimit {
        match tier {
            ModelTier::Xl30BPlus => self.xl_30b_plus,
            ModelTier::Lg13To27B => self.lg_13_to_27b,
            ModelTier::Md7To13B => self.md_7_to_13b,
            ModelTier::Sm3To7B => self.sm_3_to_7b,
            ModelTier::Sub3B => self.sub_3b,
        }
    }

    /// Replace one tier's caps.
    pub fn set(&mut self, tier: ModelTier, limit: TierLimit) {
        match tier {
            ModelTier::Xl30BPlus => self.xl_30b_plus = limit,
            ModelTier::Lg13To27B => self.lg_13_to_27b = limit,
            ModelTier::Md7To13B => self.md_7_to_13b = limit,
            ModelTier::Sm3To7B => self.sm_3_to_7b = limit,
            ModelTier::Sub3B => self.sub_3b = limit,
        }
    }

    /// Validate caps.
    ///
    /// # Errors
    ///
    /// `InvalidParams` when any tier's `max_concurrent` is zero.
    pub fn validate(&self) -> Result<()> {
        for tier in ModelTier::ALL {
            if self.get(tier).max_concurrent == 0 {
                return Err(Error::InvalidParams(format!(
                    "tiers: max_concurrent for {tier} must be > 0"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct TierState {
    capacity: usize,
    queue_depth: usize,
    queue_timeout: Duration,
    active: usize,
    waiting: usize,
}

struct TierSlot {
    state: Mutex<TierState>,
    released: Notify,
}

/// Per-tier concurrency limiter.
pub struct TierLimiter {
    slots: HashMap<ModelTier, Arc<TierSlot>>,
}

/// An admitted execution. Dropping the permit releases the slot.
pub struct TierPermit {
    tier: ModelTier,
    slot: Arc<TierSlot>,
}

impl std::fmt::Debug for TierPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierPermit").field("tier", &self.tier).finish()
    }
}

impl TierLimiter {
    /// Build from config.
    #[must_use]
    pub fn new(config: &TierLimitsConfig) -> Self {
        let mut slots = HashMap::new();
        for tier in ModelTier::ALL {
            let limit = config.get(tier);
            slots.insert(
                tier,
                Arc::new(TierSlot {
                    state: Mutex::new(TierState {
                        capacity: limit.max_concurrent,
                        queue_depth: limit.queue_depth,
                        queue_timeout: Duration::from_millis(limit.queue_timeout_ms),
                        active: 0,
                        waiting: 0,
                    }),
                    released: Notify::new(),
                }),
            );
        }
        Self { slots }
    }

    fn slot(&self, tier: ModelTier) -> &Arc<TierSlot> {
        self.slots
            .get(&tier)
            .unwrap_or_else(|| &self.slots[&ModelTier::Sub3B])
    }

    /// Acquire a permit for `tier`, waiting up to the tier's queue
    /// timeout when the cap is reached.
    ///
    /// # Errors
    ///
    /// `Overloaded` when the tier's wait queue is full; `Timeout` when
    /// the queue timeout elapses before a slot frees up.
    pub async fn acquire(&self, tier: ModelTier) -> Result<TierPermit> {
        let slot = Arc::clone(self.slot(tier));
        let timeout = {
            let mut state = slot.state.lock();
            if state.active < state.capacity {
                state.active += 1;
                ADMISSIONS.with_label_values(&[&tier.to_string()]).inc();
                ACTIVE
                    .with_label_values(&[&tier.to_string()])
                    .set(state.active as f64);
                return Ok(TierPermit { tier, slot: Arc::clone(&slot) });
            }
            if state.waiting >= state.queue_depth {
                REJECTIONS
                    .with_label_values(&[&tier.to_string(), "queue_full"])
                    .inc();
                return Err(Error::Overloaded(format!(
                    "tier {tier}: wait queue is full ({} waiting)",
                    state.waiting
                )));
            }
            state.waiting += 1;
            state.queue_timeout
        };

        // Decrements `waiting` on every exit, including caller
        // cancellation while parked in the select below.
        struct WaitGuard {
            slot: Arc<TierSlot>,
        }
        impl Drop for WaitGuard {
            fn drop(&mut self) {
                let mut state = self.slot.state.lock();
                state.waiting = state.waiting.saturating_sub(1);
            }
        }
        let guard = WaitGuard {
            slot: Arc::clone(&slot),
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = slot.released.notified();
            {
                let mut state = slot.state.lock();
                if state.active < state.capacity {
                    state.active += 1;
                    ADMISSIONS.with_label_values(&[&tier.to_string()]).inc();
                    ACTIVE
                        .with_label_values(&[&tier.to_string()])
                        .set(state.active as f64);
                    drop(state);
                    drop(guard);
                    return Ok(TierPermit { tier, slot: Arc::clone(&slot) });
                }
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    drop(guard);
                    REJECTIONS
                        .with_label_values(&[&tier.to_string(), "timeout"])
                        .inc();
                    return Err(Error::Timeout {
                        method: format!("tier_admission/{tier}"),
                        request_id: 0,
                        elapsed_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }

    /// Resize a tier's concurrency cap at runtime (auto-tuner and QoS
    /// remediation). Shrinking never interrupts active work; the cap
    /// takes effect as permits release.
    pub fn set_capacity(&self, tier: ModelTier, max_concurrent: usize) {
        let slot = self.slot(tier);
        {
            let mut state = slot.state.lock();
            info!(
                tier = %tier,
                from = state.capacity,
                to = max_concurrent.max(1),
                "Tier capacity adjusted"
            );
            state.capacity = max_concurrent.max(1);
        }
        slot.released.notify_waiters();
    }

    /// Current capacity for a tier.
    #[must_use]
    pub fn capacity(&self, tier: ModelTier) -> usize {
        self.slot(tier).state.lock().capacity
    }

    /// Currently active permits for a tier.
    #[must_use]
    pub fn active(&self, tier: ModelTier) -> usize {
        self.slot(tier).state.lock().active
    }

    /// Currently queued waiters for a tier.
    #[must_use]
    pub fn waiting(&self, tier: ModelTier) -> usize {
        self.slot(tier).state.lock().waiting
    }
}

impl TierPermit {
    /// The tier this permit belongs to.
    #[must_use]
    pub fn tier(&self) -> ModelTier {
        self.tier
    }
}

impl Drop for TierPermit {
    fn drop(&mut self) {
        {
            let mut state = self.slot.state.lock();
            state.active = state.active.saturating_sub(1);
            ACTIVE
                .with_label_values(&[&self.tier.to_string()])
                .set(state.active as f64);
            debug!(tier = %self.tier, active = state.active, "Tier permit released");
        }
        self.slot.released.notify_waiters();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_bucketing() {
        assert_eq!(ModelTier::from_parameter_count(70.0), ModelTier::Xl30BPlus);
        assert_eq!(ModelTier::from_parameter_count(30.0), ModelTier::Xl30BPlus);
        assert_eq!(ModelTier::from_parameter_count(13.0), ModelTier::Lg13To27B);
        assert_eq!(ModelTier::from_parameter_count(8.0), ModelTier::Md7To13B);
        assert_eq!(ModelTier::from_parameter_count(3.5), ModelTier::Sm3To7B);
        assert_eq!(ModelTier::from_parameter_count(0.5), ModelTier::Sub3B);
    }

    #[test]
    fn test_tier_guess_from_id() {
        assert_eq!(
            ModelTier::guess_from_id("mlx-community/Qwen2.5-7B-Instruct-4bit"),
            ModelTier::Md7To13B
        );
        assert_eq!(
            ModelTier::guess_from_id("llama-70b-chat"),
            ModelTier::Xl30BPlus
        );
        assert_eq!(ModelTier::guess_from_id("phi-1.5b"), ModelTier::Sub3B);
        assert_eq!(ModelTier::guess_from_id("gemma-2-27b-it"), ModelTier::Lg13To27B);
        assert_eq!(ModelTier::guess_from_id("some-model"), ModelTier::Sub3B);
    }

    #[test]
    fn test_config_rejects_zero_cap() {
        let mut config = TierLimitsConfig::default();
        config.sub_3b.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_cap() {
        let limiter = TierLimiter::new(&TierLimitsConfig::default());
        let p1 = limiter.acquire(ModelTier::Sub3B).await.unwrap();
        let p2 = limiter.acquire(ModelTier::Sub3B).await.unwrap();
        assert_eq!(limiter.active(ModelTier::Sub3B), 2);
        drop(p1);
        drop(p2);
        assert_eq!(limiter.active(ModelTier::Sub3B), 0);
    }

    #[tokio::test]
    async fn test_cap_never_exceeded() {
        let mut config = TierLimitsConfig::default();
        config.xl_30b_plus = TierLimit {
            max_concurrent: 1,
            queue_depth: 10,
            queue_timeout_ms: 5_000,
        };
        let limiter = Arc::new(TierLimiter::new(&config));

        let p1 = limiter.acquire(ModelTier::Xl30BPlus).await.unwrap();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(ModelTier::Xl30BPlus).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.active(ModelTier::Xl30BPlus), 1);
        assert_eq!(limiter.waiting(ModelTier::Xl30BPlus), 1);

        drop(p1);
        let p2 = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.active(ModelTier::Xl30BPlus), 1);
        drop(p2);
    }

    #[tokio::test]
    async fn test_queue_timeout() {
        let mut config = TierLimitsConfig::default();
        config.xl_30b_plus = TierLimit {
            max_concurrent: 1,
            queue_depth: 10,
            queue_timeout_ms: 50,
        };
        let limiter = TierLimiter::new(&config);
        let _held = limiter.acquire(ModelTier::Xl30BPlus).await.unwrap();
        let err = limiter.acquire(ModelTier::Xl30BPlus).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(limiter.waiting(ModelTier::Xl30BPlus), 0);
    }

    #[tokio::test]
    async fn test_queue_depth_rejection() {
        let mut config = TierLimitsConfig::default();
        config.xl_30b_plus = TierLimit {
            max_concurrent: 1,
            queue_depth: 1,
            queue_timeout_ms: 5_000,
        };
        let limiter = Arc::new(TierLimiter::new(&config));
        let _held = limiter.acquire(ModelTier::Xl30BPlus).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(ModelTier::Xl30BPlus).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = limiter.acquire(ModelTier::Xl30BPlus).await.unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));
        waiter.abort();
    }

    #[tokio::test]
    async fn test_capacity_resize_wakes_waiters() {
        let mut config = TierLimitsConfig::default();
        config.lg_13_to_27b = TierLimit {
            max_concurrent: 1,
            queue_depth: 10,
            queue_timeout_ms: 5_000,
        };
        let limiter = Arc::new(TierLimiter::new(&config));
        let _held = limiter.acquire(ModelTier::Lg13To27B).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(ModelTier::Lg13To27B).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        limiter.set_capacity(ModelTier::Lg13To27B, 2);
        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(limiter.active(ModelTier::Lg13To27B), 2);
        drop(permit);
    }
}
