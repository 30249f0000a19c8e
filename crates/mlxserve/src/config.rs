// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine configuration.
//!
//! Every option group is a serde struct with a `Default` that matches
//! production tuning and a `validate()` that rejects out-of-range values
//! with [`Error::InvalidParams`] before any subsystem is constructed.
//! Per-subsystem groups that carry behavior (canary, QoS, tiers, feature
//! flags) live with their subsystem; this module aggregates them into
//! [`EngineConfig`] and owns TOML loading.

use crate::canary::CanaryConfig;
use crate::circuit::CircuitBreakerConfig;
use crate::error::{Error, Result};
use crate::features::FeatureFlagsConfig;
use crate::limiter::TierLimitsConfig;
use crate::qos::QosConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serde adapter: `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    /// Deserialize from milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Request batching (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchQueueConfig {
    /// Coalesce small stateless calls into batch dispatches
    pub enabled: bool,
    /// Flush when this many entries are pending
    pub max_batch_size: usize,
    /// Flush this long after the first pending entry
    pub flush_interval_ms: u64,
    /// Grow/shrink batch size toward `target_batch_time_ms`
    pub adaptive_sizing: bool,
    /// Target wall clock for one batched dispatch
    pub target_batch_time_ms: u64,
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 16,
            flush_interval_ms: 5,
            adaptive_sizing: false,
            target_batch_time_ms: 50,
        }
    }
}

impl BatchQueueConfig {
    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::InvalidParams(
                "batch_queue.max_batch_size must be > 0".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidParams(
                "batch_queue.flush_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker Runtime process supervision (the out-of-process numerics
/// backend; a Python MLX process in the reference deployment).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerRuntimeConfig {
    /// Interpreter path
    pub python_path: PathBuf,
    /// Worker entrypoint script
    pub script_path: PathBuf,
    /// Extra arguments passed to the worker
    pub args: Vec<String>,
    /// Automatic restarts allowed before the transport gives up
    pub max_restarts: u32,
    /// Worker must answer its first ping within this budget
    pub startup_timeout_ms: u64,
    /// Graceful shutdown budget before the process is killed
    pub shutdown_timeout_ms: u64,
    /// Base delay between restart attempts (doubles per attempt)
    pub restart_delay_base_ms: u64,
}

impl Default for WorkerRuntimeConfig {
    fn default() -> Self {
        Self {
            python_path: PathBuf::from("python3"),
            script_path: PathBuf::from("worker/main.py"),
            args: Vec::new(),
            max_restarts: 3,
            startup_timeout_ms: 30_000,
            shutdown_timeout_ms: 5_000,
            restart_delay_base_ms: 500,
        }
    }
}

impl WorkerRuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.startup_timeout_ms < 1_000 {
            return Err(Error::InvalidParams(
                "python_runtime.startup_timeout_ms must be >= 1000".to_string(),
            ));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(Error::InvalidParams(
                "python_runtime.shutdown_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.restart_delay_base_ms == 0 {
            return Err(Error::InvalidParams(
                "python_runtime.restart_delay_base_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry tuning for the worker wire (converted to [`RetryPolicy`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
    /// Error codes eligible for retry (matched against [`Error::code`])
    pub retryable_errors: Vec<String>,
    /// Jitter fraction in `[0, 1]`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            retryable_errors: vec![
                "TRANSPORT_ERROR".to_string(),
                "TIMEOUT".to_string(),
                "IO_ERROR".to_string(),
            ],
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidParams(
                "json_rpc.retry.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::InvalidParams(
                "json_rpc.retry.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidParams(
                "json_rpc.retry.backoff_multiplier must be >= 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::InvalidParams(
                "json_rpc.retry.jitter must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Convert to the runtime policy type.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Worker wire configuration (C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Default per-request timeout when a method has no override
    pub default_timeout_ms: u64,
    /// Byte cap on one serialized frame
    pub max_line_buffer_size: usize,
    /// Pending-map capacity; admission fails beyond it
    pub max_pending_requests: usize,
    /// Whether `generate` may be retried (non-idempotent; off by default)
    pub retry_generate: bool,
    /// Retry tuning for idempotent methods
    pub retry: RetryConfig,
    /// Circuit breaker guarding the worker
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_line_buffer_size: crate::codec::DEFAULT_MAX_LINE_BUFFER_SIZE,
            max_pending_requests: 256,
            retry_generate: false,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RpcConfig {
    fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(Error::InvalidParams(
                "json_rpc.default_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.max_line_buffer_size == 0 {
            return Err(Error::InvalidParams(
                "json_rpc.max_line_buffer_size must be > 0".to_string(),
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(Error::InvalidParams(
                "json_rpc.max_pending_requests must be > 0".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Adaptive stream-limit tuning (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveLimitsConfig {
    /// Enable auto-scaling of the active-stream cap
    pub enabled: bool,
    /// Floor of the adaptive range
    pub min: usize,
    /// Ceiling of the adaptive range
    pub max: usize,
    /// TTFT target in milliseconds
    pub target_ttft_ms: f64,
    /// End-to-end latency target in milliseconds
    pub target_latency_ms: f64,
    /// Fraction of target below which the cap scales up, in `[0, 1]`
    pub scale_up_threshold: f64,
    /// Fraction of target above which the cap scales down, in `[0, 1]`
    pub scale_down_threshold: f64,
}

impl Default for AdaptiveLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min: 4,
            max: 64,
            target_ttft_ms: 500.0,
            target_latency_ms: 10_000.0,
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.95,
        }
    }
}

impl AdaptiveLimitsConfig {
    fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(Error::InvalidParams(
                "stream_registry.adaptive_limits.min must be <= max".to_string(),
            ));
        }
        for (name, v) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::InvalidParams(format!(
                    "stream_registry.adaptive_limits.{name} must be within [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Backpressure tuning (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Outstanding unacked chunks before pushes stall
    pub max_unacked_chunks: usize,
    /// How long a producer waits for an ack before a stall retry
    pub ack_timeout_ms: u64,
    /// Consumer slower than this marks the stream degraded
    pub slow_consumer_threshold_ms: u64,
    /// Stall retries before the SlowConsumer diagnostic fires
    pub queue_put_max_retries: u32,
    /// Backoff between stall retries
    pub queue_put_backoff_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_unacked_chunks: 256,
            ack_timeout_ms: 5_000,
            slow_consumer_threshold_ms: 2_000,
            queue_put_max_retries: 10,
            queue_put_backoff_ms: 50,
        }
    }
}

/// Stream registry configuration (C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRegistryConfig {
    /// Inactivity budget before a stream is auto-cancelled
    pub default_timeout_ms: u64,
    /// Hard cap on concurrently registered streams
    pub max_active_streams: usize,
    /// Bounded per-stream channel capacity
    pub stream_queue_size: usize,
    /// Registry sweep interval
    pub cleanup_interval_ms: u64,
    /// Auto-scaling of `max_active_streams`
    pub adaptive_limits: AdaptiveLimitsConfig,
    /// Producer-side backpressure
    pub backpressure: BackpressureConfig,
}

impl Default for StreamRegistryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            max_active_streams: 32,
            stream_queue_size: 512,
            cleanup_interval_ms: 1_000,
            adaptive_limits: AdaptiveLimitsConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl StreamRegistryConfig {
    fn validate(&self) -> Result<()> {
        if self.max_active_streams == 0 {
            return Err(Error::InvalidParams(
                "stream_registry.max_active_streams must be > 0".to_string(),
            ));
        }
        if self.stream_queue_size == 0 {
            return Err(Error::InvalidParams(
                "stream_registry.stream_queue_size must be > 0".to_string(),
            ));
        }
        self.adaptive_limits.validate()
    }
}

/// PID coefficients for the adaptive governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    /// Proportional gain
    pub kp: f64,
    /// Integral gain
    pub ki: f64,
    /// Derivative gain
    pub kd: f64,
    /// Clamp on the accumulated integral term
    pub integral_saturation: f64,
    /// Controller sample interval
    pub sample_interval_ms: u64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: 0.5,
            ki: 0.1,
            kd: 0.0,
            integral_saturation: 100.0,
            sample_interval_ms: 1_000,
        }
    }
}

/// Per-tenant stream budgets enforced by the governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantBudgetConfig {
    /// Streams a tenant may hold at once
    pub hard_limit: usize,
    /// Short-burst allowance above the hard limit
    pub burst_limit: usize,
    /// Burst credit decay interval
    pub decay_ms: u64,
}

impl Default for TenantBudgetConfig {
    fn default() -> Self {
        Self {
            hard_limit: 8,
            burst_limit: 4,
            decay_ms: 10_000,
        }
    }
}

/// PID-based adaptive stream governor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveGovernorConfig {
    /// Enable the governor (otherwise the static cap applies)
    pub enabled: bool,
    /// TTFT setpoint in milliseconds
    pub target_ttft_ms: f64,
    /// Floor of the governed range
    pub min: usize,
    /// Ceiling of the governed range
    pub max: usize,
    /// Stale tenant-budget cleanup interval
    pub cleanup_interval_ms: u64,
    /// Controller coefficients
    pub pid: PidConfig,
    /// Per-tenant stream budgets
    pub tenant_budgets: TenantBudgetConfig,
}

impl Default for AdaptiveGovernorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_ttft_ms: 500.0,
            min: 4,
            max: 64,
            cleanup_interval_ms: 30_000,
            pid: PidConfig::default(),
            tenant_budgets: TenantBudgetConfig::default(),
        }
    }
}

impl AdaptiveGovernorConfig {
    fn validate(&self) -> Result<()> {
        if self.min > self.max {
            return Err(Error::InvalidParams(
                "adaptive_governor.min must be <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Model lifecycle configuration (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context length applied when the worker reports none
    pub default_context_length: u32,
    /// Loaded-handle cap; LRU eviction beyond it
    pub max_loaded_models: usize,
    /// Quantization applied when the descriptor carries none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_quantization: Option<String>,
    /// Directories an explicit `local_path` must resolve into
    pub trusted_model_directories: Vec<PathBuf>,
    /// Dummy generations issued by `warmup_model`
    pub warmup_generations: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_context_length: 4_096,
            max_loaded_models: 4,
            default_quantization: None,
            trusted_model_directories: Vec::new(),
            warmup_generations: 2,
        }
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        if self.max_loaded_models == 0 {
            return Err(Error::InvalidParams(
                "model.max_loaded_models must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Artifact cache eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently used
    Lru,
    /// Least frequently used
    Lfu,
    /// First in, first out
    Fifo,
}

/// On-disk artifact cache configuration (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Disabled mode always reports a miss
    pub enabled: bool,
    /// Cache root; `index.json` and `artifacts/` live beneath it
    pub cache_dir: PathBuf,
    /// Byte cap; eviction runs when crossed
    pub max_size_bytes: u64,
    /// Entries older than this are swept regardless of size
    pub max_age_days: u32,
    /// Which entries are evicted first
    pub eviction_policy: EvictionPolicy,
    /// Verify index entries against disk on startup
    pub validate_on_startup: bool,
    /// Reserved: compress artifacts at rest
    pub enable_compression: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: PathBuf::from(".mlxserve/cache"),
            max_size_bytes: 50 * 1024 * 1024 * 1024,
            max_age_days: 30,
            eviction_policy: EvictionPolicy::Lru,
            validate_on_startup: false,
            enable_compression: false,
        }
    }
}

/// Deduplication configuration (C3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Disable to dispatch every generation independently
    pub enabled: bool,
    /// Hard upper bound on entry lifetime
    pub ttl_ms: u64,
    /// Entry cap; FIFO eviction beyond it
    pub max_entries: usize,
    /// Prompts above this size bypass deduplication
    pub max_payload_bytes: usize,
    /// Expired-entry sweep interval
    pub cleanup_interval_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 30_000,
            max_entries: 1_024,
            max_payload_bytes: 64 * 1024,
            cleanup_interval_ms: 5_000,
        }
    }
}

/// Scheduler configuration (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrent executions the scheduler admits
    pub max_concurrent: usize,
    /// Wait beyond this bumps a request one level (per level, ms,
    /// CRITICAL first; CRITICAL's entry is unused)
    pub aging_threshold_ms: [u64; 5],
    /// Fraction of decisions forced to the lowest non-empty level
    pub fairness_ratio: f64,
    /// Drop requests already past their deadline instead of running
    /// them degraded
    pub drop_expired: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            aging_threshold_ms: [0, 10_000, 20_000, 30_000, 45_000],
            fairness_ratio: 0.05,
            drop_expired: false,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::InvalidParams(
                "scheduler.max_concurrent must be > 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fairness_ratio) {
            return Err(Error::InvalidParams(
                "scheduler.fairness_ratio must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admission queue configuration (C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrency bound; zero or negative means unbounded
    pub max_concurrent: i64,
    /// Default per-request timeout; zero disables
    pub request_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            request_timeout_ms: 0,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Request batching (C2)
    pub batch_queue: BatchQueueConfig,
    /// Worker process supervision
    #[serde(rename = "python_runtime")]
    pub worker_runtime: WorkerRuntimeConfig,
    /// Worker wire (C1)
    pub json_rpc: RpcConfig,
    /// Stream registry (C4)
    pub stream_registry: StreamRegistryConfig,
    /// PID stream governor
    pub adaptive_governor: AdaptiveGovernorConfig,
    /// Model lifecycle (C5)
    pub model: ModelConfig,
    /// Artifact cache (C5)
    pub cache: CacheConfig,
    /// Deduplication (C3)
    pub dedup: DedupConfig,
    /// Scheduler (C7)
    pub scheduler: SchedulerConfig,
    /// Admission queue (C8)
    pub queue: QueueConfig,
    /// Tier concurrency caps (C6)
    pub tiers: TierLimitsConfig,
    /// Canary rollout (C11)
    pub canary: CanaryConfig,
    /// QoS policies (C10)
    pub qos: QosConfig,
    /// Feature flags
    pub feature_flags: FeatureFlagsConfig,
}

impl EngineConfig {
    /// Validate every group.
    ///
    /// # Errors
    ///
    /// `InvalidParams` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.batch_queue.validate()?;
        self.worker_runtime.validate()?;
        self.json_rpc.validate()?;
        self.stream_registry.validate()?;
        self.adaptive_governor.validate()?;
        self.model.validate()?;
        self.scheduler.validate()?;
        self.tiers.validate()?;
        self.canary.validate()?;
        self.qos.validate()?;
        self.feature_flags.validate()?;
        Ok(())
    }

    /// Parse from a TOML document and validate.
    ///
    /// # Errors
    ///
    /// `InvalidParams` on parse failure or constraint violation.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::InvalidParams(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file and validate.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, otherwise as
    /// [`EngineConfig::from_toml_str`].
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_batch_queue_rejects_zero_batch_size() {
        let mut config = EngineConfig::default();
        config.batch_queue.max_batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_runtime_rejects_short_startup_timeout() {
        let mut config = EngineConfig::default();
        config.worker_runtime.startup_timeout_ms = 999;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_rejects_inverted_delays() {
        let mut config = EngineConfig::default();
        config.json_rpc.retry.initial_delay_ms = 5_000;
        config.json_rpc.retry.max_delay_ms = 1_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_delay_ms"));
    }

    #[test]
    fn test_retry_rejects_jitter_out_of_range() {
        let mut config = EngineConfig::default();
        config.json_rpc.retry.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adaptive_limits_rejects_min_above_max() {
        let mut config = EngineConfig::default();
        config.stream_registry.adaptive_limits.min = 100;
        config.stream_registry.adaptive_limits.max = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed = EngineConfig::from_toml_str(&raw).unwrap();
        assert_eq!(
            parsed.json_rpc.max_line_buffer_size,
            config.json_rpc.max_line_buffer_size
        );
        assert_eq!(parsed.scheduler.max_concurrent, config.scheduler.max_concurrent);
    }

    #[test]
    fn test_toml_python_runtime_group_name() {
        let raw = r#"
            [python_runtime]
            max_restarts = 7
            startup_timeout_ms = 2000
        "#;
        let config = EngineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.worker_runtime.max_restarts, 7);
        assert_eq!(config.worker_runtime.startup_timeout_ms, 2_000);
    }

    #[test]
    fn test_toml_fractional_max_concurrent_rejected() {
        // Typed integral: TOML refuses 2.5 for an integer field.
        let raw = r#"
            [queue]
            max_concurrent = 2.5
        "#;
        assert!(EngineConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_retry_config_to_policy() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 50,
            max_delay_ms: 2_000,
            backoff_multiplier: 3.0,
            retryable_errors: vec!["TRANSPORT_ERROR".to_string()],
            jitter: 0.1,
        };
        let policy = config.to_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
        assert_eq!(policy.max_delay, Duration::from_millis(2_000));
    }
}
