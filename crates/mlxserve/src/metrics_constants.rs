// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)
// mlxserve Metrics Constants
//
// Centralize all metric name strings to prevent duplication and typos.
// All mlxserve_* metrics should be defined here and imported where needed.

//! Prometheus metric name constants for mlxserve.
//!
//! This module centralizes all metric names to ensure consistency across
//! the crate. Metrics follow Prometheus naming conventions:
//! - Counters end with `_total`
//! - Histograms end with `_ms`, `_bytes`, etc. (unit suffix)
//! - Gauges have no special suffix

// ============================================================================
// Transport / codec
// ============================================================================

/// Total worker requests dispatched, labeled by method and outcome.
pub const METRIC_TRANSPORT_REQUESTS_TOTAL: &str = "mlxserve_transport_requests_total";

/// Worker request round-trip latency in milliseconds, labeled by method.
pub const METRIC_TRANSPORT_REQUEST_DURATION_MS: &str = "mlxserve_transport_request_duration_ms";

/// Requests currently awaiting a worker reply.
pub const METRIC_TRANSPORT_INFLIGHT: &str = "mlxserve_transport_inflight_requests";

/// Total worker process restarts.
pub const METRIC_WORKER_RESTARTS_TOTAL: &str = "mlxserve_worker_restarts_total";

/// Total inbound frames that failed to decode.
pub const METRIC_CODEC_DECODE_FAILURES_TOTAL: &str = "mlxserve_codec_decode_failures_total";

/// Serialized frame size in bytes.
pub const METRIC_CODEC_FRAME_BYTES: &str = "mlxserve_codec_frame_bytes";

/// Total retry attempts, labeled by operation.
pub const METRIC_RETRIES_TOTAL: &str = "mlxserve_retries_total";

/// Circuit breaker state transitions, labeled by breaker and target state.
pub const METRIC_CIRCUIT_STATE_CHANGES_TOTAL: &str = "mlxserve_circuit_state_changes_total";

// ============================================================================
// Batcher
// ============================================================================

/// Total batch calls dispatched to the worker, labeled by method.
pub const METRIC_BATCHES_DISPATCHED_TOTAL: &str = "mlxserve_batches_dispatched_total";

/// Total individual requests that rode in a batch, labeled by method.
pub const METRIC_BATCHED_REQUESTS_TOTAL: &str = "mlxserve_batched_requests_total";

/// Total requests forwarded solo (batching disabled or flush-of-one).
pub const METRIC_SOLO_REQUESTS_TOTAL: &str = "mlxserve_solo_requests_total";

/// Observed batch sizes.
pub const METRIC_BATCH_SIZE: &str = "mlxserve_batch_size";

// ============================================================================
// Deduplication
// ============================================================================

/// Fingerprint cache hits (joined an in-flight generation).
pub const METRIC_DEDUP_HITS_TOTAL: &str = "mlxserve_dedup_hits_total";

/// Fingerprint cache misses (started a fresh generation).
pub const METRIC_DEDUP_MISSES_TOTAL: &str = "mlxserve_dedup_misses_total";

/// Entries evicted by capacity or TTL sweep.
pub const METRIC_DEDUP_EVICTIONS_TOTAL: &str = "mlxserve_dedup_evictions_total";

/// Requests that bypassed deduplication (oversized payload or opt-out).
pub const METRIC_DEDUP_BYPASS_TOTAL: &str = "mlxserve_dedup_bypass_total";

// ============================================================================
// Stream registry
// ============================================================================

/// Streams currently registered.
pub const METRIC_STREAMS_ACTIVE: &str = "mlxserve_streams_active";

/// Total tokens pushed through the registry.
pub const METRIC_STREAM_TOKENS_TOTAL: &str = "mlxserve_stream_tokens_total";

/// Producer stalls caused by backpressure.
pub const METRIC_STREAM_BACKPRESSURE_STALLS_TOTAL: &str =
    "mlxserve_stream_backpressure_stalls_total";

/// Streams marked degraded after the backpressure retry budget.
pub const METRIC_SLOW_CONSUMERS_TOTAL: &str = "mlxserve_slow_consumers_total";

/// Streams cancelled, labeled by reason class.
pub const METRIC_STREAMS_CANCELLED_TOTAL: &str = "mlxserve_streams_cancelled_total";

/// Time to first token in milliseconds.
pub const METRIC_STREAM_TTFT_MS: &str = "mlxserve_stream_ttft_ms";

/// End-to-end stream duration in milliseconds.
pub const METRIC_STREAM_DURATION_MS: &str = "mlxserve_stream_duration_ms";

// ============================================================================
// Models / artifact cache
// ============================================================================

/// Models currently loaded.
pub const METRIC_MODELS_LOADED: &str = "mlxserve_models_loaded";

/// Total model loads, labeled by outcome.
pub const METRIC_MODEL_LOADS_TOTAL: &str = "mlxserve_model_loads_total";

/// Total model unloads.
pub const METRIC_MODEL_UNLOADS_TOTAL: &str = "mlxserve_model_unloads_total";

/// Model load duration in milliseconds.
pub const METRIC_MODEL_LOAD_DURATION_MS: &str = "mlxserve_model_load_duration_ms";

/// Handles invalidated by worker restarts.
pub const METRIC_MODEL_INVALIDATIONS_TOTAL: &str = "mlxserve_model_invalidations_total";

/// Artifact cache lookup hits.
pub const METRIC_ARTIFACT_CACHE_HITS_TOTAL: &str = "mlxserve_artifact_cache_hits_total";

/// Artifact cache lookup misses.
pub const METRIC_ARTIFACT_CACHE_MISSES_TOTAL: &str = "mlxserve_artifact_cache_misses_total";

/// Artifact cache entries evicted.
pub const METRIC_ARTIFACT_CACHE_EVICTIONS_TOTAL: &str = "mlxserve_artifact_cache_evictions_total";

/// Bytes currently held by the artifact cache.
pub const METRIC_ARTIFACT_CACHE_BYTES: &str = "mlxserve_artifact_cache_bytes";

// ============================================================================
// Limiter / scheduler / queue
// ============================================================================

/// Tier admissions, labeled by tier.
pub const METRIC_TIER_ADMISSIONS_TOTAL: &str = "mlxserve_tier_admissions_total";

/// Tier rejections (queue depth or timeout), labeled by tier and reason.
pub const METRIC_TIER_REJECTIONS_TOTAL: &str = "mlxserve_tier_rejections_total";

/// Active permits per tier.
pub const METRIC_TIER_ACTIVE: &str = "mlxserve_tier_active";

/// Queued requests per priority level.
pub const METRIC_SCHEDULER_QUEUE_DEPTH: &str = "mlxserve_scheduler_queue_depth";

/// Scheduler wait time in milliseconds, labeled by priority level.
pub const METRIC_SCHEDULER_WAIT_MS: &str = "mlxserve_scheduler_wait_ms";

/// SLA deadline violations, labeled by priority level.
pub const METRIC_SLA_VIOLATIONS_TOTAL: &str = "mlxserve_sla_violations_total";

/// Requests promoted by aging.
pub const METRIC_AGING_BUMPS_TOTAL: &str = "mlxserve_aging_bumps_total";

/// Forced low-priority scheduling decisions.
pub const METRIC_FAIRNESS_INTERVENTIONS_TOTAL: &str = "mlxserve_fairness_interventions_total";

/// Admission-time preemptions, labeled by displaced priority level.
pub const METRIC_PREEMPTIONS_TOTAL: &str = "mlxserve_preemptions_total";

/// Requests pending in the admission queue.
pub const METRIC_QUEUE_PENDING: &str = "mlxserve_queue_pending";

/// Requests timed out while queued or active.
pub const METRIC_QUEUE_TIMEOUTS_TOTAL: &str = "mlxserve_queue_timeouts_total";

// ============================================================================
// QoS / canary
// ============================================================================

/// SLO violations observed, labeled by metric kind and severity.
pub const METRIC_SLO_VIOLATIONS_TOTAL: &str = "mlxserve_slo_violations_total";

/// SLO recoveries observed, labeled by metric kind.
pub const METRIC_SLO_RECOVERIES_TOTAL: &str = "mlxserve_slo_recoveries_total";

/// Remediation actions executed, labeled by action type and mode.
pub const METRIC_REMEDIATIONS_TOTAL: &str = "mlxserve_remediations_total";

/// Canary stage transitions, labeled by transition type.
pub const METRIC_CANARY_TRANSITIONS_TOTAL: &str = "mlxserve_canary_stage_transitions_total";

/// Requests routed per variant.
pub const METRIC_CANARY_REQUESTS_TOTAL: &str = "mlxserve_canary_requests_total";

/// Automatic canary rollbacks.
pub const METRIC_CANARY_ROLLBACKS_TOTAL: &str = "mlxserve_canary_rollbacks_total";

// ============================================================================
// Engine
// ============================================================================

/// Generations started, labeled by outcome.
pub const METRIC_GENERATIONS_TOTAL: &str = "mlxserve_generations_total";

/// Full generation duration in milliseconds.
pub const METRIC_GENERATION_DURATION_MS: &str = "mlxserve_generation_duration_ms";

/// Tokens produced across all streams.
pub const METRIC_TOKENS_GENERATED_TOTAL: &str = "mlxserve_tokens_generated_total";

/// Errors surfaced to callers, labeled by stable error code.
pub const METRIC_ERRORS_TOTAL: &str = "mlxserve_errors_total";

/// Lifecycle events dropped because a subscriber lagged.
pub const METRIC_EVENTS_DROPPED_TOTAL: &str = "mlxserve_events_dropped_total";
