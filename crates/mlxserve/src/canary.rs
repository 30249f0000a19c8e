// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Canary Rollouts - Staged Traffic Shifts With Automatic Rollback
//!
//! Shifts a deterministic fraction of traffic from the stable variant to
//! a canary variant, watches both through a sliding window, and rolls
//! back automatically when the canary regresses.
//!
//! ## Key Concepts
//!
//! - **CanaryRouter**: hash-bucket traffic split with optional sticky
//!   decision caching
//! - **VariantWindow**: per-variant 1-hour sliding window of request
//!   records (percentiles, error rate, throughput, memory growth)
//! - **RollbackController**: trigger evaluation, gradual step-down,
//!   cooldown against flapping
//! - **CanaryManager**: health loop, stage advancement, transitions,
//!   optional state persistence

use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_CANARY_REQUESTS_TOTAL, METRIC_CANARY_ROLLBACKS_TOTAL, METRIC_CANARY_TRANSITIONS_TOTAL,
};
use lru::LruCache;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Opts};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

static ROUTED: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_CANARY_REQUESTS_TOTAL, "Requests routed per variant"),
        &["variant"],
    )
});
static TRANSITIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_CANARY_TRANSITIONS_TOTAL, "Canary stage transitions"),
        &["type"],
    )
});
static ROLLBACKS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_CANARY_ROLLBACKS_TOTAL, "Automatic canary rollbacks")
});

/// Sliding window length for variant metrics.
const METRICS_WINDOW: Duration = Duration::from_secs(3600);

/// Rollout stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryStage {
    /// Canary receives no traffic
    Off,
    /// 10% of traffic
    Stage10,
    /// 25% of traffic
    Stage25,
    /// 50% of traffic
    Stage50,
    /// All traffic
    Stage100,
}

impl CanaryStage {
    /// Rollout percentage for this stage.
    #[must_use]
    pub fn percentage(self) -> u32 {
        match self {
            CanaryStage::Off => 0,
            CanaryStage::Stage10 => 10,
            CanaryStage::Stage25 => 25,
            CanaryStage::Stage50 => 50,
            CanaryStage::Stage100 => 100,
        }
    }

    /// The next stage up, when one exists.
    #[must_use]
    pub fn next(self) -> Option<CanaryStage> {
        match self {
            CanaryStage::Off => Some(CanaryStage::Stage10),
            CanaryStage::Stage10 => Some(CanaryStage::Stage25),
            CanaryStage::Stage25 => Some(CanaryStage::Stage50),
            CanaryStage::Stage50 => Some(CanaryStage::Stage100),
            CanaryStage::Stage100 => None,
        }
    }

    /// The gradual-rollback step below: subtract `step_percent` from
    /// the rollout percentage and land on the highest stage at or
    /// below the result. Always strictly lower than `self`, saturating
    /// at `Off`.
    #[must_use]
    pub fn step_down_by(self, step_percent: u32) -> CanaryStage {
        let target = self.percentage().saturating_sub(step_percent.max(1));
        [
            CanaryStage::Stage50,
            CanaryStage::Stage25,
            CanaryStage::Stage10,
        ]
        .into_iter()
        .find(|stage| stage.percentage() <= target && stage.percentage() < self.percentage())
        .unwrap_or(CanaryStage::Off)
    }
}

impl std::fmt::Display for CanaryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.percentage())
    }
}

/// Which variant serves a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// The stable variant
    Baseline,
    /// The rollout variant
    Canary,
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Baseline => write!(f, "baseline"),
            Variant::Canary => write!(f, "canary"),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Router strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterStrategy {
    /// Pure deterministic hash bucketing
    Hash,
    /// Hash bucketing plus a sticky decision cache
    Sticky,
}

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing strategy
    pub strategy: RouterStrategy,
    /// Key mixed into the bucket hash
    #[serde(alias = "hash_seed")]
    pub hash_key: String,
    /// Cache decisions for stickiness
    pub enable_cache: bool,
    /// Sticky cache capacity
    pub cache_size: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RouterStrategy::Hash,
            hash_key: "mlxserve".to_string(),
            enable_cache: true,
            cache_size: 10_000,
        }
    }
}

/// Rollback trigger thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackTriggers {
    /// Canary error rate must exceed baseline by this multiplier
    pub error_rate_multiplier: f64,
    /// ... and exceed this floor in absolute terms
    pub error_rate_min: f64,
    /// Canary p95 latency vs baseline multiplier
    pub latency_p95_multiplier: f64,
    /// Canary memory growth ceiling in MB/hour
    pub memory_growth_mb_per_hour: f64,
    /// Roll back when the canary crashes more than the baseline
    pub crash_delta: bool,
}

impl Default for RollbackTriggers {
    fn default() -> Self {
        Self {
            error_rate_multiplier: 2.0,
            error_rate_min: 0.01,
            latency_p95_multiplier: 1.5,
            memory_growth_mb_per_hour: 512.0,
            crash_delta: true,
        }
    }
}

/// Rollback behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    /// Automatic rollback enabled
    pub enabled: bool,
    /// No further rollback within this window
    pub cooldown_ms: u64,
    /// Step down through the stages instead of jumping to off
    pub gradual: bool,
    /// Percentage points shed per gradual step; the stage ladder lands
    /// on the highest stage at or below the reduced percentage
    pub gradual_step_percent: u32,
    /// Dwell time per gradual step
    pub gradual_step_duration_ms: u64,
    /// Trigger thresholds
    pub triggers: RollbackTriggers,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_ms: 600_000,
            gradual: false,
            gradual_step_percent: 25,
            gradual_step_duration_ms: 60_000,
            triggers: RollbackTriggers::default(),
        }
    }
}

/// Canary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Master switch; disabled routes everything to baseline
    pub enabled: bool,
    /// Stage applied at startup
    pub initial_stage: CanaryStage,
    /// Health evaluation interval
    pub health_check_interval_ms: u64,
    /// Canary requests required before a stage can advance
    pub min_requests_per_stage: u64,
    /// Dwell time required per stage
    pub min_stage_wait_ms: u64,
    /// Advance stages automatically when healthy
    pub auto_advance: bool,
    /// Persist stage state to this file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_state: Option<PathBuf>,
    /// Router tuning
    pub router: RouterConfig,
    /// Rollback tuning
    pub rollback: RollbackConfig,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_stage: CanaryStage::Off,
            health_check_interval_ms: 15_000,
            min_requests_per_stage: 100,
            min_stage_wait_ms: 300_000,
            auto_advance: false,
            persist_state: None,
            router: RouterConfig::default(),
            rollback: RollbackConfig::default(),
        }
    }
}

impl CanaryConfig {
    /// Validate tuning values.
    ///
    /// # Errors
    ///
    /// `InvalidParams` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.router.cache_size == 0 && self.router.enable_cache {
            return Err(Error::InvalidParams(
                "canary.router.cache_size must be > 0 when the cache is enabled".to_string(),
            ));
        }
        if self.health_check_interval_ms == 0 {
            return Err(Error::InvalidParams(
                "canary.health_check_interval_ms must be > 0".to_string(),
            ));
        }
        if !(1..=100).contains(&self.rollback.gradual_step_percent) {
            return Err(Error::InvalidParams(
                "canary.rollback.gradual_step_percent must be within [1, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Router
// ============================================================================

/// Deterministic traffic splitter.
pub struct CanaryRouter {
    config: RouterConfig,
    sticky: Option<Mutex<LruCache<String, Variant>>>,
}

impl CanaryRouter {
    /// Build from config.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        let sticky = (config.strategy == RouterStrategy::Sticky && config.enable_cache)
            .then(|| {
                let capacity =
                    NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
                Mutex::new(LruCache::new(capacity))
            });
        Self { config, sticky }
    }

    /// Bucket an identifier into `[0, 10000)`.
    #[must_use]
    pub fn bucket(&self, identifier: &str) -> u32 {
        let mut hasher = Sha256::new();
        hasher.update(self.config.hash_key.as_bytes());
        hasher.update(identifier.as_bytes());
        let digest = hasher.finalize();
        let word = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]);
        (word % 10_000) as u32
    }

    /// Route an identifier at the given rollout percentage.
    #[must_use]
    pub fn route(&self, identifier: &str, rollout_percentage: u32) -> Variant {
        if rollout_percentage == 0 {
            return Variant::Baseline;
        }
        if rollout_percentage >= 100 {
            return Variant::Canary;
        }
        if let Some(sticky) = &self.sticky {
            if let Some(cached) = sticky.lock().get(identifier) {
                return *cached;
            }
        }
        let variant = if self.bucket(identifier) < rollout_percentage * 100 {
            Variant::Canary
        } else {
            Variant::Baseline
        };
        if let Some(sticky) = &self.sticky {
            sticky.lock().push(identifier.to_string(), variant);
        }
        variant
    }
}

// ============================================================================
// Metrics collection
// ============================================================================

/// One request observation.
#[derive(Debug, Clone)]
struct RequestRecord {
    at: Instant,
    latency_ms: f64,
    success: bool,
    memory_mb: f64,
    crashed: bool,
}

/// Windowed statistics for one variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantStats {
    /// Requests in the window
    pub request_count: u64,
    /// Failures over requests
    pub error_rate: f64,
    /// p50 latency in milliseconds
    pub latency_p50_ms: f64,
    /// p95 latency in milliseconds
    pub latency_p95_ms: f64,
    /// Requests per second over the window
    pub throughput_rps: f64,
    /// Worker memory growth in MB/hour
    pub memory_growth_mb_per_hour: f64,
    /// Crashes in the window
    pub crash_count: u64,
}

#[derive(Default)]
struct VariantWindow {
    records: VecDeque<RequestRecord>,
}

impl VariantWindow {
    fn push(&mut self, record: RequestRecord) {
        self.records.push_back(record);
        self.prune();
    }

    fn prune(&mut self) {
        while let Some(front) = self.records.front() {
            if front.at.elapsed() > METRICS_WINDOW {
                self.records.pop_front();
            } else {
                break;
            }
        }
    }

    fn stats(&mut self) -> VariantStats {
        self.prune();
        let count = self.records.len() as u64;
        if count == 0 {
            return VariantStats::default();
        }
        let failures = self.records.iter().filter(|r| !r.success).count() as u64;
        let crashes = self.records.iter().filter(|r| r.crashed).count() as u64;

        let mut latencies: Vec<f64> = self.records.iter().map(|r| r.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let pct = |q: f64| -> f64 {
            let idx = ((latencies.len() - 1) as f64 * q).round() as usize;
            latencies[idx]
        };

        let span = self
            .records
            .back()
            .map(|newest| {
                newest
                    .at
                    .duration_since(self.records[0].at)
                    .as_secs_f64()
                    .max(1.0)
            })
            .unwrap_or(1.0);
        let memory_growth = {
            let first = self.records[0].memory_mb;
            let last = self.records[self.records.len() - 1].memory_mb;
            (last - first) / (span / 3600.0)
        };

        VariantStats {
            request_count: count,
            error_rate: failures as f64 / count as f64,
            latency_p50_ms: pct(0.50),
            latency_p95_ms: pct(0.95),
            throughput_rps: count as f64 / span,
            memory_growth_mb_per_hour: memory_growth,
            crash_count: crashes,
        }
    }
}

// ============================================================================
// Rollback controller
// ============================================================================

/// Decides whether canary health warrants a rollback.
pub struct RollbackController {
    config: RollbackConfig,
    last_rollback: Mutex<Option<Instant>>,
}

impl RollbackController {
    /// Build from config.
    #[must_use]
    pub fn new(config: RollbackConfig) -> Self {
        Self {
            config,
            last_rollback: Mutex::new(None),
        }
    }

    /// Whether the cooldown since the previous rollback is still active.
    #[must_use]
    pub fn in_cooldown(&self) -> bool {
        self.last_rollback
            .lock()
            .is_some_and(|at| at.elapsed() < Duration::from_millis(self.config.cooldown_ms))
    }

    /// Evaluate triggers. Returns the firing trigger's reason, or `None`
    /// when the canary is healthy, rollback is disabled, or the
    /// controller is cooling down.
    #[must_use]
    pub fn evaluate(&self, baseline: &VariantStats, canary: &VariantStats) -> Option<String> {
        if !self.config.enabled || self.in_cooldown() || canary.request_count == 0 {
            return None;
        }
        let triggers = &self.config.triggers;

        if canary.error_rate > triggers.error_rate_min
            && canary.error_rate > baseline.error_rate * triggers.error_rate_multiplier
        {
            return Some(format!(
                "canary error rate {:.4} vs baseline {:.4}",
                canary.error_rate, baseline.error_rate
            ));
        }
        if baseline.latency_p95_ms > 0.0
            && canary.latency_p95_ms > baseline.latency_p95_ms * triggers.latency_p95_multiplier
        {
            return Some(format!(
                "canary p95 {:.0}ms vs baseline {:.0}ms",
                canary.latency_p95_ms, baseline.latency_p95_ms
            ));
        }
        if canary.memory_growth_mb_per_hour > triggers.memory_growth_mb_per_hour {
            return Some(format!(
                "canary memory growth {:.0} MB/h",
                canary.memory_growth_mb_per_hour
            ));
        }
        if triggers.crash_delta && canary.crash_count > baseline.crash_count {
            return Some(format!(
                "canary crashes {} vs baseline {}",
                canary.crash_count, baseline.crash_count
            ));
        }
        None
    }

    /// Record that a rollback fired (starts the cooldown).
    pub fn mark_rolled_back(&self) {
        *self.last_rollback.lock() = Some(Instant::now());
    }
}

// ============================================================================
// Manager
// ============================================================================

/// How a stage transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Automatic advancement
    Advance,
    /// Automatic or gradual rollback
    Rollback,
    /// Operator command
    Manual,
}

impl std::fmt::Display for TransitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionType::Advance => write!(f, "advance"),
            TransitionType::Rollback => write!(f, "rollback"),
            TransitionType::Manual => write!(f, "manual"),
        }
    }
}

/// A recorded stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    /// Stage before
    pub from: CanaryStage,
    /// Stage after
    pub to: CanaryStage,
    /// How the transition happened
    pub transition_type: TransitionType,
    /// Operator-facing reason
    pub reason: String,
    /// Canary stats at transition time
    pub canary_stats: VariantStats,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    stage: CanaryStage,
    updated_at: chrono::DateTime<chrono::Utc>,
}

struct ManagerState {
    stage: CanaryStage,
    stage_started: Instant,
    gradual_next_step_at: Option<Instant>,
    transitions: Vec<StageTransition>,
}

/// The canary manager.
pub struct CanaryManager {
    config: CanaryConfig,
    router: CanaryRouter,
    rollback: RollbackController,
    state: Mutex<ManagerState>,
    baseline_window: Mutex<VariantWindow>,
    canary_window: Mutex<VariantWindow>,
    events: broadcast::Sender<StageTransition>,
}

impl CanaryManager {
    /// Build from validated config, restoring persisted stage state when
    /// configured.
    #[must_use]
    pub fn new(config: CanaryConfig) -> Arc<Self> {
        let stage = Self::restore_stage(&config).unwrap_or(config.initial_stage);
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            router: CanaryRouter::new(config.router.clone()),
            rollback: RollbackController::new(config.rollback.clone()),
            state: Mutex::new(ManagerState {
                stage,
                stage_started: Instant::now(),
                gradual_next_step_at: None,
                transitions: Vec::new(),
            }),
            baseline_window: Mutex::new(VariantWindow::default()),
            canary_window: Mutex::new(VariantWindow::default()),
            events,
            config,
        })
    }

    /// Subscribe to stage transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StageTransition> {
        self.events.subscribe()
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> CanaryStage {
        self.state.lock().stage
    }

    /// Recorded transitions.
    #[must_use]
    pub fn transitions(&self) -> Vec<StageTransition> {
        self.state.lock().transitions.clone()
    }

    /// Route one request by its stickiness identifier.
    #[must_use]
    pub fn route(&self, identifier: &str) -> Variant {
        if !self.config.enabled {
            return Variant::Baseline;
        }
        let stage = self.stage();
        let variant = self.router.route(identifier, stage.percentage());
        ROUTED.with_label_values(&[&variant.to_string()]).inc();
        variant
    }

    /// Record one request outcome for a variant.
    pub fn record_request(
        &self,
        variant: Variant,
        latency_ms: f64,
        success: bool,
        memory_mb: f64,
        crashed: bool,
    ) {
        let record = RequestRecord {
            at: Instant::now(),
            latency_ms,
            success,
            memory_mb,
            crashed,
        };
        match variant {
            Variant::Baseline => self.baseline_window.lock().push(record),
            Variant::Canary => self.canary_window.lock().push(record),
        }
    }

    /// Windowed stats for both variants.
    #[must_use]
    pub fn stats(&self) -> (VariantStats, VariantStats) {
        (
            self.baseline_window.lock().stats(),
            self.canary_window.lock().stats(),
        )
    }

    /// One health evaluation: rollback triggers first, then gradual-step
    /// continuation, then auto-advancement.
    pub fn health_check(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let (baseline, canary) = self.stats();

        if self.stage() != CanaryStage::Off {
            if let Some(reason) = self.rollback.evaluate(&baseline, &canary) {
                self.start_rollback(&reason, &canary);
                return;
            }
        }

        // Continue an in-progress gradual rollback.
        let due_step = {
            let state = self.state.lock();
            state
                .gradual_next_step_at
                .is_some_and(|at| Instant::now() >= at)
        };
        if due_step {
            self.gradual_step(&canary);
            return;
        }

        if self.config.auto_advance && self.can_advance(&canary) {
            let from = self.stage();
            if let Some(to) = from.next() {
                self.transition(from, to, TransitionType::Advance, "healthy stage", &canary);
            }
        }
    }

    /// Whether the current stage is eligible to advance.
    #[must_use]
    pub fn can_advance(&self, canary: &VariantStats) -> bool {
        let state = self.state.lock();
        if state.gradual_next_step_at.is_some() {
            return false;
        }
        let dwell_ok = state.stage_started.elapsed()
            >= Duration::from_millis(self.config.min_stage_wait_ms);
        drop(state);
        let volume_ok = match self.stage() {
            CanaryStage::Off => true,
            _ => canary.request_count >= self.config.min_requests_per_stage,
        };
        dwell_ok && volume_ok && !self.rollback.in_cooldown() && self.stage().next().is_some()
    }

    /// Operator-driven stage change.
    pub fn set_stage(self: &Arc<Self>, to: CanaryStage, reason: &str) {
        let from = self.stage();
        if from == to {
            return;
        }
        let (_, canary) = self.stats();
        self.transition(from, to, TransitionType::Manual, reason, &canary);
        // A manual change abandons any gradual rollback in flight.
        self.state.lock().gradual_next_step_at = None;
    }

    /// Spawn the health loop.
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = Duration::from_millis(manager.config.health_check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.health_check();
            }
        })
    }

    fn start_rollback(self: &Arc<Self>, reason: &str, canary: &VariantStats) {
        let from = self.stage();
        self.rollback.mark_rolled_back();
        ROLLBACKS.inc();
        warn!(from = %from, reason, "Canary rollback triggered");

        let to = from.step_down_by(self.config.rollback.gradual_step_percent);
        if self.config.rollback.gradual && to != CanaryStage::Off {
            self.transition(from, to, TransitionType::Rollback, reason, canary);
            self.state.lock().gradual_next_step_at = Some(
                Instant::now()
                    + Duration::from_millis(self.config.rollback.gradual_step_duration_ms),
            );
        } else {
            self.transition(from, CanaryStage::Off, TransitionType::Rollback, reason, canary);
        }
    }

    fn gradual_step(self: &Arc<Self>, canary: &VariantStats) {
        let from = self.stage();
        let to = from.step_down_by(self.config.rollback.gradual_step_percent);
        self.transition(from, to, TransitionType::Rollback, "gradual rollback step", canary);
        let mut state = self.state.lock();
        state.gradual_next_step_at = (to != CanaryStage::Off).then(|| {
            Instant::now() + Duration::from_millis(self.config.rollback.gradual_step_duration_ms)
        });
    }

    fn transition(
        self: &Arc<Self>,
        from: CanaryStage,
        to: CanaryStage,
        transition_type: TransitionType,
        reason: &str,
        canary: &VariantStats,
    ) {
        let record = StageTransition {
            from,
            to,
            transition_type,
            reason: reason.to_string(),
            canary_stats: canary.clone(),
        };
        {
            let mut state = self.state.lock();
            state.stage = to;
            state.stage_started = Instant::now();
            state.transitions.push(record.clone());
        }
        TRANSITIONS
            .with_label_values(&[&transition_type.to_string()])
            .inc();
        info!(from = %from, to = %to, kind = %transition_type, reason, "Canary stage transition");
        let _ = self.events.send(record);
        self.persist_stage(to);
    }

    fn persist_stage(&self, stage: CanaryStage) {
        let Some(path) = &self.config.persist_state else {
            return;
        };
        let state = PersistedState {
            stage,
            updated_at: chrono::Utc::now(),
        };
        match serde_json::to_vec_pretty(&state) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!(path = %path.display(), error = %e, "Failed to persist canary state");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize canary state"),
        }
    }

    fn restore_stage(config: &CanaryConfig) -> Option<CanaryStage> {
        let path = config.persist_state.as_ref()?;
        let raw = std::fs::read_to_string(path).ok()?;
        let state: PersistedState = serde_json::from_str(&raw).ok()?;
        debug!(stage = %state.stage, "Restored persisted canary stage");
        Some(state.stage)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_config() -> CanaryConfig {
        CanaryConfig {
            enabled: true,
            initial_stage: CanaryStage::Stage10,
            min_stage_wait_ms: 0,
            min_requests_per_stage: 0,
            ..CanaryConfig::default()
        }
    }

    // ============================================
    // Router
    // ============================================

    #[test]
    fn test_router_deterministic() {
        let router = CanaryRouter::new(RouterConfig {
            hash_key: "test".to_string(),
            ..RouterConfig::default()
        });
        for i in 0..100 {
            let id = format!("user-{i}");
            assert_eq!(router.route(&id, 25), router.route(&id, 25));
        }
    }

    #[test]
    fn test_router_fraction_within_tolerance() {
        let router = CanaryRouter::new(RouterConfig {
            hash_key: "test".to_string(),
            ..RouterConfig::default()
        });
        let canary = (0..10_000)
            .filter(|i| router.route(&format!("id-{i}"), 10) == Variant::Canary)
            .count() as f64;
        let fraction = canary / 10_000.0;
        assert!(
            (0.08..=0.12).contains(&fraction),
            "10% rollout routed {fraction}"
        );
    }

    #[test]
    fn test_router_edges() {
        let router = CanaryRouter::new(RouterConfig::default());
        assert_eq!(router.route("anyone", 0), Variant::Baseline);
        assert_eq!(router.route("anyone", 100), Variant::Canary);
    }

    #[test]
    fn test_router_config_accepts_hash_key_and_legacy_alias() {
        let config: RouterConfig =
            serde_json::from_value(serde_json::json!({"hash_key": "from-config"})).unwrap();
        assert_eq!(config.hash_key, "from-config");

        let config: RouterConfig =
            serde_json::from_value(serde_json::json!({"hash_seed": "legacy"})).unwrap();
        assert_eq!(config.hash_key, "legacy");
    }

    #[test]
    fn test_router_key_changes_assignment() {
        let a = CanaryRouter::new(RouterConfig {
            hash_key: "seed-a".to_string(),
            ..RouterConfig::default()
        });
        let b = CanaryRouter::new(RouterConfig {
            hash_key: "seed-b".to_string(),
            ..RouterConfig::default()
        });
        let differing = (0..1_000)
            .filter(|i| {
                let id = format!("id-{i}");
                a.route(&id, 50) != b.route(&id, 50)
            })
            .count();
        assert!(differing > 100, "seeds should shuffle assignments");
    }

    #[test]
    fn test_sticky_cache_pins_decisions() {
        let router = CanaryRouter::new(RouterConfig {
            strategy: RouterStrategy::Sticky,
            enable_cache: true,
            cache_size: 100,
            hash_key: "test".to_string(),
        });
        // Decision at 50% sticks even when consulted at a lower stage.
        let decisions: Vec<Variant> = (0..50)
            .map(|i| router.route(&format!("u-{i}"), 50))
            .collect();
        for (i, expected) in decisions.iter().enumerate() {
            assert_eq!(router.route(&format!("u-{i}"), 10), *expected);
        }
    }

    // ============================================
    // Stages
    // ============================================

    #[test]
    fn test_stage_percentages() {
        assert_eq!(CanaryStage::Off.percentage(), 0);
        assert_eq!(CanaryStage::Stage10.percentage(), 10);
        assert_eq!(CanaryStage::Stage100.percentage(), 100);
        assert_eq!(CanaryStage::Stage50.next(), Some(CanaryStage::Stage100));
        assert_eq!(CanaryStage::Stage100.next(), None);
    }

    #[test]
    fn test_step_down_by_percent() {
        // Default 25-point steps walk 100 → 50 → 25 → off.
        assert_eq!(CanaryStage::Stage100.step_down_by(25), CanaryStage::Stage50);
        assert_eq!(CanaryStage::Stage50.step_down_by(25), CanaryStage::Stage25);
        assert_eq!(CanaryStage::Stage25.step_down_by(25), CanaryStage::Off);
        assert_eq!(CanaryStage::Stage10.step_down_by(25), CanaryStage::Off);

        // Larger steps shed more per transition.
        assert_eq!(CanaryStage::Stage100.step_down_by(50), CanaryStage::Stage50);
        assert_eq!(CanaryStage::Stage100.step_down_by(75), CanaryStage::Stage25);
        assert_eq!(CanaryStage::Stage100.step_down_by(100), CanaryStage::Off);

        // Small steps still make strict progress down the ladder.
        assert_eq!(CanaryStage::Stage100.step_down_by(10), CanaryStage::Stage50);
        assert_eq!(CanaryStage::Stage25.step_down_by(10), CanaryStage::Stage10);
        assert_eq!(CanaryStage::Off.step_down_by(25), CanaryStage::Off);
    }

    // ============================================
    // Rollback controller
    // ============================================

    fn stats(error_rate: f64, p95: f64, crashes: u64) -> VariantStats {
        VariantStats {
            request_count: 1_000,
            error_rate,
            latency_p50_ms: p95 / 2.0,
            latency_p95_ms: p95,
            throughput_rps: 10.0,
            memory_growth_mb_per_hour: 0.0,
            crash_count: crashes,
        }
    }

    #[test]
    fn test_rollback_on_error_rate() {
        let controller = RollbackController::new(RollbackConfig::default());
        let reason = controller
            .evaluate(&stats(0.005, 100.0, 0), &stats(0.05, 100.0, 0))
            .unwrap();
        assert!(reason.contains("error rate"));
    }

    #[test]
    fn test_no_rollback_below_absolute_floor() {
        let controller = RollbackController::new(RollbackConfig::default());
        // 3x the baseline but under the 1% floor.
        assert!(controller
            .evaluate(&stats(0.002, 100.0, 0), &stats(0.006, 100.0, 0))
            .is_none());
    }

    #[test]
    fn test_rollback_on_latency() {
        let controller = RollbackController::new(RollbackConfig::default());
        let reason = controller
            .evaluate(&stats(0.0, 100.0, 0), &stats(0.0, 200.0, 0))
            .unwrap();
        assert!(reason.contains("p95"));
    }

    #[test]
    fn test_rollback_on_crash_delta() {
        let controller = RollbackController::new(RollbackConfig::default());
        let reason = controller
            .evaluate(&stats(0.0, 100.0, 0), &stats(0.0, 100.0, 1))
            .unwrap();
        assert!(reason.contains("crash"));
    }

    #[test]
    fn test_cooldown_suppresses_evaluation() {
        let controller = RollbackController::new(RollbackConfig::default());
        controller.mark_rolled_back();
        assert!(controller.in_cooldown());
        assert!(controller
            .evaluate(&stats(0.0, 100.0, 0), &stats(0.5, 100.0, 0))
            .is_none());
    }

    // ============================================
    // Manager
    // ============================================

    #[tokio::test]
    async fn test_disabled_routes_baseline() {
        let manager = CanaryManager::new(CanaryConfig::default());
        for i in 0..100 {
            assert_eq!(manager.route(&format!("id-{i}")), Variant::Baseline);
        }
    }

    #[tokio::test]
    async fn test_rollback_sets_stage_off() {
        let manager = CanaryManager::new(enabled_config());
        // Unhealthy canary traffic.
        for i in 0..200 {
            manager.record_request(Variant::Baseline, 100.0, true, 100.0, false);
            manager.record_request(Variant::Canary, 100.0, i % 3 != 0, 100.0, false);
        }
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Off);

        let transitions = manager.transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].transition_type, TransitionType::Rollback);
        assert_eq!(transitions[0].to, CanaryStage::Off);
    }

    #[tokio::test]
    async fn test_no_second_rollback_within_cooldown() {
        let manager = CanaryManager::new(enabled_config());
        for _ in 0..200 {
            manager.record_request(Variant::Baseline, 100.0, true, 100.0, false);
            manager.record_request(Variant::Canary, 100.0, false, 100.0, false);
        }
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Off);

        // Manually restart the canary; an immediate re-evaluation must
        // not fire inside the cooldown.
        manager.set_stage(CanaryStage::Stage10, "retry");
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage10);
        assert_eq!(manager.transitions().len(), 2);
    }

    #[tokio::test]
    async fn test_gradual_rollback_steps() {
        let mut config = enabled_config();
        config.initial_stage = CanaryStage::Stage100;
        config.rollback.gradual = true;
        config.rollback.gradual_step_percent = 25;
        config.rollback.gradual_step_duration_ms = 10;
        let manager = CanaryManager::new(config);

        for _ in 0..200 {
            manager.record_request(Variant::Baseline, 100.0, true, 100.0, false);
            manager.record_request(Variant::Canary, 100.0, false, 100.0, false);
        }
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage50);

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage25);

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Off);
    }

    #[tokio::test]
    async fn test_gradual_rollback_large_step_skips_stages() {
        let mut config = enabled_config();
        config.initial_stage = CanaryStage::Stage100;
        config.rollback.gradual = true;
        config.rollback.gradual_step_percent = 75;
        config.rollback.gradual_step_duration_ms = 10;
        let manager = CanaryManager::new(config);

        for _ in 0..200 {
            manager.record_request(Variant::Baseline, 100.0, true, 100.0, false);
            manager.record_request(Variant::Canary, 100.0, false, 100.0, false);
        }
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage25);

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Off);
    }

    #[test]
    fn test_validation_rejects_bad_step_percent() {
        let mut config = CanaryConfig::default();
        config.rollback.gradual_step_percent = 0;
        assert!(config.validate().is_err());

        let mut config = CanaryConfig::default();
        config.rollback.gradual_step_percent = 101;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_auto_advance_when_healthy() {
        let mut config = enabled_config();
        config.auto_advance = true;
        let manager = CanaryManager::new(config);

        for _ in 0..50 {
            manager.record_request(Variant::Baseline, 100.0, true, 100.0, false);
            manager.record_request(Variant::Canary, 100.0, true, 100.0, false);
        }
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage25);
        manager.health_check();
        assert_eq!(manager.stage(), CanaryStage::Stage50);
    }

    #[tokio::test]
    async fn test_manual_stage_change_recorded() {
        let manager = CanaryManager::new(enabled_config());
        manager.set_stage(CanaryStage::Stage50, "operator");
        assert_eq!(manager.stage(), CanaryStage::Stage50);
        let transitions = manager.transitions();
        assert_eq!(transitions[0].transition_type, TransitionType::Manual);
        assert_eq!(transitions[0].reason, "operator");
    }

    #[tokio::test]
    async fn test_state_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("canary.json");

        let mut config = enabled_config();
        config.persist_state = Some(path.clone());
        let manager = CanaryManager::new(config.clone());
        manager.set_stage(CanaryStage::Stage50, "operator");
        drop(manager);

        let restored = CanaryManager::new(config);
        assert_eq!(restored.stage(), CanaryStage::Stage50);
    }

    #[tokio::test]
    async fn test_transition_events_broadcast() {
        let manager = CanaryManager::new(enabled_config());
        let mut events = manager.subscribe();
        manager.set_stage(CanaryStage::Stage25, "operator");
        let event = events.try_recv().unwrap();
        assert_eq!(event.to, CanaryStage::Stage25);
    }
}
