// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # QoS Policy Engine - SLO Evaluation and Remediation
//!
//! Continuously evaluates service-level objectives over streaming
//! percentile sketches and triggers remediation when they are violated.
//!
//! ## Key Concepts
//!
//! - **MetricsStore**: t-digest-backed windowed observations keyed by
//!   `(metric, tenant?, model?)`
//! - **SloDefinition**: a threshold over a metric and window
//! - **QosPolicy**: prioritized bundle of SLOs and remediation actions
//! - **RemediationExecutor**: dispatches actions with loop detection
//!
//! Warning-severity SLOs must be violated on K consecutive evaluation
//! ticks before remediation fires; critical severity fires on the first.
//! A ring buffer of recent executions opens a per-action-type circuit
//! when the same action fires too often within a window, and dry-run
//! mode logs intent without executing anything.

use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_REMEDIATIONS_TOTAL, METRIC_SLO_RECOVERIES_TOTAL, METRIC_SLO_VIOLATIONS_TOTAL,
};
use crate::tdigest::TDigest;
use parking_lot::{Mutex, RwLock};
use prometheus::{CounterVec, Opts};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

static SLO_VIOLATIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_SLO_VIOLATIONS_TOTAL, "SLO violations observed"),
        &["metric", "severity"],
    )
});

static SLO_RECOVERIES: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_SLO_RECOVERIES_TOTAL, "SLO recoveries observed"),
        &["metric"],
    )
});

static REMEDIATIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_REMEDIATIONS_TOTAL, "Remediation actions dispatched"),
        &["action", "mode"],
    )
});

/// Observation bucket width for windowed queries.
const BUCKET_WIDTH: Duration = Duration::from_secs(1);
/// Longest window any SLO may request (bounds bucket retention).
const MAX_WINDOW: Duration = Duration::from_secs(600);

// ============================================================================
// Metric identity
// ============================================================================

/// Metric kinds SLOs can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QosMetric {
    /// Time to first token (milliseconds)
    Ttft,
    /// End-to-end latency p95 (milliseconds)
    LatencyP95,
    /// Failures over total in the window
    ErrorRate,
    /// Requests per second over the window
    Throughput,
}

impl std::fmt::Display for QosMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QosMetric::Ttft => write!(f, "ttft"),
            QosMetric::LatencyP95 => write!(f, "latency_p95"),
            QosMetric::ErrorRate => write!(f, "error_rate"),
            QosMetric::Throughput => write!(f, "throughput"),
        }
    }
}

/// Key for one observation series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    /// Metric kind
    pub metric: QosMetric,
    /// Tenant scope, when per-tenant
    pub tenant_id: Option<String>,
    /// Model scope, when per-model
    pub model_id: Option<String>,
}

// ============================================================================
// Metrics store
// ============================================================================

#[derive(Debug)]
struct Bucket {
    started: Instant,
    digest: TDigest,
    successes: u64,
    failures: u64,
}

#[derive(Debug)]
struct Series {
    buckets: VecDeque<Bucket>,
}

impl Series {
    fn new() -> Self {
        Self {
            buckets: VecDeque::new(),
        }
    }

    fn current(&mut self, compression: f64, now: Instant) -> &mut Bucket {
        let rotate = match self.buckets.back() {
            Some(b) => now.duration_since(b.started) >= BUCKET_WIDTH,
            None => true,
        };
        if rotate {
            self.buckets.push_back(Bucket {
                started: now,
                digest: TDigest::new(compression),
                successes: 0,
                failures: 0,
            });
            while let Some(front) = self.buckets.front() {
                if now.duration_since(front.started) > MAX_WINDOW {
                    self.buckets.pop_front();
                } else {
                    break;
                }
            }
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    fn window(&self, window: Duration, now: Instant) -> (TDigest, u64, u64) {
        let mut digest = TDigest::default();
        let mut successes = 0;
        let mut failures = 0;
        for bucket in &self.buckets {
            if now.duration_since(bucket.started) <= window {
                digest.merge_from(&bucket.digest);
                successes += bucket.successes;
                failures += bucket.failures;
            }
        }
        (digest, successes, failures)
    }
}

/// Windowed observation storage for the evaluator.
pub struct MetricsStore {
    compression: f64,
    series: RwLock<HashMap<MetricKey, Series>>,
}

impl MetricsStore {
    /// Create a store; `compression` sizes the per-bucket digests.
    #[must_use]
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            series: RwLock::new(HashMap::new()),
        }
    }

    /// Record a latency-style observation.
    pub fn observe(&self, key: MetricKey, value_ms: f64) {
        let mut series = self.series.write();
        let entry = series.entry(key).or_insert_with(Series::new);
        entry
            .current(self.compression, Instant::now())
            .digest
            .add(value_ms);
    }

    /// Record a request outcome (drives error rate and throughput).
    pub fn observe_outcome(&self, key: MetricKey, success: bool) {
        let mut series = self.series.write();
        let entry = series.entry(key).or_insert_with(Series::new);
        let bucket = entry.current(self.compression, Instant::now());
        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
    }

    /// Evaluate one metric over a window. Returns `None` when the window
    /// holds no observations.
    #[must_use]
    pub fn evaluate(&self, key: &MetricKey, window: Duration) -> Option<f64> {
        let series = self.series.read();
        let entry = series.get(key)?;
        let (mut digest, successes, failures) = entry.window(window, Instant::now());
        match key.metric {
            QosMetric::Ttft | QosMetric::LatencyP95 => {
                if digest.count() == 0 {
                    return None;
                }
                Some(digest.percentile(0.95))
            }
            QosMetric::ErrorRate => {
                let total = successes + failures;
                if total == 0 {
                    return None;
                }
                Some(failures as f64 / total as f64)
            }
            QosMetric::Throughput => {
                let total = successes + failures;
                if total == 0 {
                    return None;
                }
                Some(total as f64 / window.as_secs_f64().max(f64::EPSILON))
            }
        }
    }
}

// ============================================================================
// Policy declarations
// ============================================================================

/// Violation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloSeverity {
    /// Remediate only after consecutive violations
    Warning,
    /// Remediate on the first violation
    Critical,
}

impl std::fmt::Display for SloSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SloSeverity::Warning => write!(f, "warning"),
            SloSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// One service-level objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloDefinition {
    /// Metric under evaluation
    pub metric: QosMetric,
    /// Threshold; direction depends on the metric (throughput violates
    /// below, everything else above)
    pub threshold: f64,
    /// Evaluation window
    pub window_ms: u64,
    /// Optional tenant scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Optional model scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Severity
    pub severity: SloSeverity,
}

impl SloDefinition {
    fn key(&self) -> MetricKey {
        MetricKey {
            metric: self.metric,
            tenant_id: self.tenant_id.clone(),
            model_id: self.model_id.clone(),
        }
    }

    fn is_violated(&self, current: f64) -> bool {
        match self.metric {
            QosMetric::Throughput => current < self.threshold,
            _ => current > self.threshold,
        }
    }
}

/// Remediation action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationType {
    /// Raise the target's concurrency
    ScaleUp,
    /// Lower the target's concurrency
    ScaleDown,
    /// Reject or delay low-priority admissions for the target
    Throttle,
    /// Emit an alert event only
    Alert,
    /// Restart the worker runtime
    Restart,
}

impl std::fmt::Display for RemediationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemediationType::ScaleUp => write!(f, "scale_up"),
            RemediationType::ScaleDown => write!(f, "scale_down"),
            RemediationType::Throttle => write!(f, "throttle"),
            RemediationType::Alert => write!(f, "alert"),
            RemediationType::Restart => write!(f, "restart"),
        }
    }
}

/// A declared remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    /// Action type
    #[serde(rename = "type")]
    pub action_type: RemediationType,
    /// Target component or model
    pub target: String,
    /// Action-specific parameters
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// Operator-facing reason
    pub reason: String,
}

/// A prioritized policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QosPolicy {
    /// Stable policy id
    pub id: String,
    /// Higher handles a violation first; at most one policy fires
    pub priority: u32,
    /// Disabled policies are skipped entirely
    pub enabled: bool,
    /// Objectives this policy watches
    pub slos: Vec<SloDefinition>,
    /// Actions dispatched on violation
    pub remediations: Vec<RemediationAction>,
}

/// Loop detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDetectionConfig {
    /// Executions of one action type tolerated within the window
    pub max_executions: usize,
    /// Window over which executions are counted
    pub window_ms: u64,
    /// Circuit-open duration once tripped
    pub cooldown_ms: u64,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            max_executions: 3,
            window_ms: 60_000,
            cooldown_ms: 120_000,
        }
    }
}

/// QoS engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Master switch
    pub enabled: bool,
    /// Evaluator tick interval
    pub evaluation_interval_ms: u64,
    /// Digest compression for the metrics store
    pub compression: f64,
    /// Consecutive violations required for warning severity
    pub consecutive_warning_violations: u32,
    /// Log intended actions without executing
    pub dry_run: bool,
    /// Loop detection tuning
    pub loop_detection: LoopDetectionConfig,
    /// Declared policies
    pub policies: Vec<QosPolicy>,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_ms: 5_000,
            compression: 100.0,
            consecutive_warning_violations: 3,
            dry_run: false,
            loop_detection: LoopDetectionConfig::default(),
            policies: Vec::new(),
        }
    }
}

impl QosConfig {
    /// Validate thresholds and policy shape.
    ///
    /// # Errors
    ///
    /// `InvalidParams` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.evaluation_interval_ms == 0 {
            return Err(Error::InvalidParams(
                "qos.evaluation_interval_ms must be > 0".to_string(),
            ));
        }
        for policy in &self.policies {
            if policy.id.is_empty() {
                return Err(Error::InvalidParams("qos policy id must not be empty".to_string()));
            }
            for slo in &policy.slos {
                if slo.window_ms == 0 {
                    return Err(Error::InvalidParams(format!(
                        "qos policy {}: slo window_ms must be > 0",
                        policy.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Outcome of evaluating one SLO on one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloEvaluation {
    /// Policy that owns the SLO
    pub policy_id: String,
    /// Metric under evaluation
    pub metric: QosMetric,
    /// Whether the SLO is violated on this tick
    pub violated: bool,
    /// Severity from the definition
    pub severity: SloSeverity,
    /// Windowed metric value
    pub current_value: f64,
    /// Declared threshold
    pub threshold: f64,
}

/// Edge events published by the engine.
#[derive(Debug, Clone)]
pub enum QosEvent {
    /// An SLO transitioned into violation
    Violation(SloEvaluation),
    /// An SLO transitioned back to healthy
    Recovery(SloEvaluation),
    /// A remediation was dispatched (or logged, in dry-run)
    Remediation {
        /// Owning policy
        policy_id: String,
        /// The action
        action: RemediationAction,
        /// True when dry-run suppressed execution
        dry_run: bool,
    },
}

/// Hook invoked for each executed remediation. Installed by the engine
/// facade; the executor records and rate-limits around it.
pub type RemediationHook = Arc<dyn Fn(&RemediationAction) + Send + Sync>;

#[derive(Debug, Default)]
struct ExecutorState {
    /// Recent executions: (instant, action type) ring
    recent: VecDeque<(Instant, RemediationType)>,
    /// Open circuits per action type
    open_until: HashMap<RemediationType, Instant>,
}

#[derive(Debug, Default)]
struct EvaluatorState {
    /// Consecutive violation count per (policy, slo index)
    consecutive: HashMap<(String, usize), u32>,
    /// Whether the SLO was violated on the previous tick
    was_violated: HashMap<(String, usize), bool>,
}

/// The QoS policy engine.
pub struct QosEngine {
    config: QosConfig,
    store: Arc<MetricsStore>,
    events: broadcast::Sender<QosEvent>,
    hook: RwLock<Option<RemediationHook>>,
    executor: Mutex<ExecutorState>,
    evaluator: Mutex<EvaluatorState>,
}

impl QosEngine {
    /// Build from validated config.
    #[must_use]
    pub fn new(config: QosConfig) -> Arc<Self> {
        let store = Arc::new(MetricsStore::new(config.compression));
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            store,
            events,
            hook: RwLock::new(None),
            executor: Mutex::new(ExecutorState::default()),
            evaluator: Mutex::new(EvaluatorState::default()),
        })
    }

    /// The observation sink shared with the facade.
    #[must_use]
    pub fn store(&self) -> Arc<MetricsStore> {
        Arc::clone(&self.store)
    }

    /// Subscribe to violation/recovery/remediation events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<QosEvent> {
        self.events.subscribe()
    }

    /// Install the remediation hook (replaces any previous hook).
    pub fn set_remediation_hook(&self, hook: RemediationHook) {
        *self.hook.write() = Some(hook);
    }

    /// Spawn the evaluation loop. Returns the task handle; aborting the
    /// handle stops evaluation.
    pub fn spawn_evaluator(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let interval = Duration::from_millis(engine.config.evaluation_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.evaluate_tick();
            }
        })
    }

    /// Run one evaluation pass over every enabled policy. Violations are
    /// grouped per tick; the highest-priority matching policy remediates.
    pub fn evaluate_tick(&self) {
        if !self.config.enabled {
            return;
        }

        // Policies in priority order; the first one to fire on this tick
        // claims remediation so overlapping policies cannot stack actions.
        let mut ordered: Vec<&QosPolicy> =
            self.config.policies.iter().filter(|p| p.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut remediated_this_tick = false;

        for policy in ordered {
            for (idx, slo) in policy.slos.iter().enumerate() {
                let Some(current) = self
                    .store
                    .evaluate(&slo.key(), Duration::from_millis(slo.window_ms))
                else {
                    continue;
                };
                let violated = slo.is_violated(current);
                let evaluation = SloEvaluation {
                    policy_id: policy.id.clone(),
                    metric: slo.metric,
                    violated,
                    severity: slo.severity,
                    current_value: current,
                    threshold: slo.threshold,
                };

                let state_key = (policy.id.clone(), idx);
                let mut state = self.evaluator.lock();
                let was = state.was_violated.insert(state_key.clone(), violated);
                let consecutive = if violated {
                    let c = state.consecutive.entry(state_key.clone()).or_insert(0);
                    *c += 1;
                    *c
                } else {
                    state.consecutive.insert(state_key, 0);
                    0
                };
                drop(state);

                if violated && was != Some(true) {
                    SLO_VIOLATIONS
                        .with_label_values(&[&slo.metric.to_string(), &slo.severity.to_string()])
                        .inc();
                    let _ = self.events.send(QosEvent::Violation(evaluation.clone()));
                    warn!(
                        policy = %policy.id,
                        metric = %slo.metric,
                        current = current,
                        threshold = slo.threshold,
                        "SLO violation"
                    );
                } else if !violated && was == Some(true) {
                    SLO_RECOVERIES
                        .with_label_values(&[&slo.metric.to_string()])
                        .inc();
                    let _ = self.events.send(QosEvent::Recovery(evaluation.clone()));
                    info!(policy = %policy.id, metric = %slo.metric, "SLO recovered");
                }

                if !violated || remediated_this_tick {
                    continue;
                }
                let should_fire = match slo.severity {
                    SloSeverity::Critical => true,
                    SloSeverity::Warning => {
                        consecutive >= self.config.consecutive_warning_violations
                    }
                };
                if should_fire {
                    self.remediate(policy);
                    remediated_this_tick = true;
                }
            }
        }
    }

    fn remediate(&self, policy: &QosPolicy) {
        for action in &policy.remediations {
            if !self.admit_action(action.action_type) {
                debug!(
                    policy = %policy.id,
                    action = %action.action_type,
                    "Remediation suppressed by loop detection"
                );
                continue;
            }
            if self.config.dry_run {
                REMEDIATIONS
                    .with_label_values(&[&action.action_type.to_string(), "dry_run"])
                    .inc();
                info!(
                    policy = %policy.id,
                    action = %action.action_type,
                    target = %action.target,
                    reason = %action.reason,
                    "Dry-run: remediation not executed"
                );
            } else {
                REMEDIATIONS
                    .with_label_values(&[&action.action_type.to_string(), "live"])
                    .inc();
                if let Some(hook) = self.hook.read().as_ref() {
                    hook(action);
                }
                info!(
                    policy = %policy.id,
                    action = %action.action_type,
                    target = %action.target,
                    "Remediation executed"
                );
            }
            let _ = self.events.send(QosEvent::Remediation {
                policy_id: policy.id.clone(),
                action: action.clone(),
                dry_run: self.config.dry_run,
            });
        }
    }

    /// Ring-buffer loop detection: admit unless the action type fired
    /// more than `max_executions` times within the window, in which case
    /// its circuit opens for the cooldown.
    fn admit_action(&self, action_type: RemediationType) -> bool {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.loop_detection.window_ms);
        let cooldown = Duration::from_millis(self.config.loop_detection.cooldown_ms);
        let mut state = self.executor.lock();

        if let Some(until) = state.open_until.get(&action_type) {
            if now < *until {
                return false;
            }
            state.open_until.remove(&action_type);
        }

        while let Some((t, _)) = state.recent.front() {
            if now.duration_since(*t) > window {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        let fired = state
            .recent
            .iter()
            .filter(|(_, t)| *t == action_type)
            .count();
        if fired >= self.config.loop_detection.max_executions {
            state.open_until.insert(action_type, now + cooldown);
            warn!(action = %action_type, "Remediation loop detected; opening action circuit");
            return false;
        }
        state.recent.push_back((now, action_type));
        true
    }
}
