// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Engine Facade - The Public Serving Surface
//!
//! Owns every subsystem and wires the admission pipeline in a fixed
//! order: Validation → Canary → Dedup → Tier limit → Scheduler → Queue
//! → Batcher → Transport. Generations come back as lazy cancellable
//! token streams; `generate` awaits the collected text and is the
//! surface the fingerprint deduplicator serves.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mlxserve::{Engine, EngineConfig, GenerateParams};
//!
//! let engine = Engine::spawn(EngineConfig::default()).await?;
//! engine.load_model(ModelDescriptor::new("llama-7b")).await?;
//! let text = engine
//!     .generate(GenerateParams::new("llama-7b", "Hello"), Default::default())
//!     .await?;
//! ```

use crate::artifact_cache::{ArtifactCache, CacheHealth};
use crate::autotuner::{AutoTuner, HardwareProfile, HealthSample, TuningDirection};
use crate::batcher::Batcher;
use crate::canary::{CanaryManager, Variant};
use crate::circuit::CircuitState;
use crate::codec;
use crate::config::EngineConfig;
use crate::dedup::Deduplicator;
use crate::error::{Error, ErrorObject, Result};
use crate::events::{EngineEvent, EventBus};
use crate::features::FeatureFlags;
use crate::limiter::{ModelTier, TierLimiter, TierPermit};
use crate::metrics_constants::{
    METRIC_ERRORS_TOTAL, METRIC_GENERATIONS_TOTAL, METRIC_GENERATION_DURATION_MS,
    METRIC_MODEL_LOADS_TOTAL, METRIC_MODEL_LOAD_DURATION_MS, METRIC_TOKENS_GENERATED_TOTAL,
};
use crate::models::{
    validate_local_path, validate_model_id, ModelDescriptor, ModelHandle, ModelManager,
    ModelMetadata, TokenizerInfo,
};
use crate::protocol::{methods, GenerateParams, StreamEventKind, TokenPayload};
use crate::qos::{MetricKey, QosEngine, QosMetric, RemediationAction, RemediationType};
use crate::queue::RequestQueue;
use crate::scheduler::{Priority, PriorityScheduler, SchedulerPermit};
use crate::streams::{StreamChunk, StreamRegistry, TokenStream};
use crate::transport::{ProcessTransport, WorkerClient, WorkerStatus, WorkerTransport};
use dashmap::DashMap;
use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts};
use serde_json::{json, Value};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

static GENERATIONS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_GENERATIONS_TOTAL, "Generations by outcome"),
        &["outcome"],
    )
});
static GENERATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(
            METRIC_GENERATION_DURATION_MS,
            "Full generation duration in milliseconds",
        )
        .buckets(vec![50.0, 250.0, 1000.0, 5000.0, 15000.0, 60000.0, 300_000.0]),
    )
});
static TOKENS_GENERATED: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_TOKENS_GENERATED_TOTAL, "Tokens produced across streams")
});
static ERRORS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_ERRORS_TOTAL, "Errors surfaced to callers"),
        &["code"],
    )
});
static MODEL_LOADS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_MODEL_LOADS_TOTAL, "Model loads by outcome"),
        &["outcome"],
    )
});
static MODEL_LOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(METRIC_MODEL_LOAD_DURATION_MS, "Model load duration in milliseconds")
            .buckets(vec![100.0, 500.0, 2000.0, 10000.0, 60000.0, 300_000.0]),
    )
});

/// Per-request generation options.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    /// Scheduling priority
    pub priority: Priority,
    /// SLA deadline
    pub deadline: Option<Instant>,
    /// Join identical concurrent generations (`generate` only;
    /// streaming always bypasses)
    pub dedupe: bool,
    /// Stickiness identifier for canary routing; defaults to the
    /// tenant, then to a prompt digest
    pub identifier: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            deadline: None,
            dedupe: true,
            identifier: None,
        }
    }
}

/// Terminal outcome shared by dedup joiners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Concatenated token text
    pub text: String,
    /// Worker finish reason
    pub finish_reason: String,
}

/// Runtime introspection snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Worker status
    pub worker_status: WorkerStatus,
    /// Worker restarts since startup
    pub restart_count: u32,
    /// Engine uptime in milliseconds
    pub uptime_ms: u64,
    /// Detected hardware
    pub hardware: HardwareProfile,
    /// Transport breaker state
    pub circuit_state: CircuitState,
    /// Loaded model count
    pub models_loaded: usize,
    /// Registered stream count
    pub active_streams: usize,
}

/// Health probe result.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall verdict
    pub healthy: bool,
    /// Worker answered a ping
    pub worker_responsive: bool,
    /// Transport breaker state
    pub circuit_state: CircuitState,
    /// Artifact cache health
    pub cache: CacheHealth,
}

/// Cache/stat introspection.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Artifact cache health
    pub artifact: CacheHealth,
    /// Live fingerprint entries
    pub dedup_entries: usize,
    /// Mean entries per dispatched batch
    pub average_batch_size: f64,
}

struct StreamMeta {
    model_id: String,
    tenant_id: Option<String>,
    variant: Variant,
    started: Instant,
}

/// A caller-held generation: the token stream plus the admission
/// permits, which release when the stream is dropped or consumed to its
/// terminal chunk.
pub struct Generation {
    stream: TokenStream,
    _tier_permit: TierPermit,
    _scheduler_permit: SchedulerPermit,
}

impl Generation {
    /// The worker stream id.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.stream.stream_id()
    }

    /// Collect to completion, concatenating token text.
    ///
    /// # Errors
    ///
    /// The terminal error chunk.
    pub async fn collect_text(self) -> Result<String> {
        self.stream.collect_text().await
    }
}

impl futures::Stream for Generation {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// The engine.
pub struct Engine {
    config: EngineConfig,
    client: Arc<WorkerClient>,
    batcher: Arc<Batcher>,
    registry: Arc<StreamRegistry>,
    models: Arc<ModelManager>,
    cache: Arc<ArtifactCache>,
    limiter: Arc<TierLimiter>,
    scheduler: Arc<PriorityScheduler>,
    queue: Arc<RequestQueue>,
    dedup: Arc<Deduplicator<GenerationOutcome>>,
    canary: Arc<CanaryManager>,
    qos: Arc<QosEngine>,
    features: FeatureFlags,
    events: Arc<EventBus>,
    tuner: AutoTuner,
    stream_meta: Arc<DashMap<String, StreamMeta>>,
    started_at: Instant,
    shut_down: AtomicBool,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over an existing transport (tests inject the
    /// scripted worker here).
    ///
    /// # Errors
    ///
    /// `InvalidParams` when the config fails validation; `Io` when the
    /// artifact cache cannot be opened.
    pub fn new(config: EngineConfig, transport: Arc<dyn WorkerTransport>) -> Result<Arc<Self>> {
        config.validate()?;

        let client = WorkerClient::new(transport, config.json_rpc.clone());
        let batcher = Batcher::new(
            config.batch_queue.clone(),
            Arc::clone(&client) as Arc<dyn crate::batcher::BatchTransport>,
        );
        let registry = StreamRegistry::new(
            config.stream_registry.clone(),
            config.adaptive_governor.clone(),
        );
        let models = Arc::new(ModelManager::new(config.model.clone()));
        let cache = Arc::new(ArtifactCache::open(config.cache.clone())?);
        let limiter = Arc::new(TierLimiter::new(&config.tiers));
        let scheduler = PriorityScheduler::new(config.scheduler.clone());
        let queue = RequestQueue::new(&config.queue);
        let dedup = Deduplicator::new(config.dedup.clone());
        let canary = CanaryManager::new(config.canary.clone());
        let qos = QosEngine::new(config.qos.clone());
        let features = FeatureFlags::new(config.feature_flags.clone());
        let events = Arc::new(EventBus::default());

        let engine = Arc::new(Self {
            client,
            batcher,
            registry,
            models,
            cache,
            limiter,
            scheduler,
            queue,
            dedup,
            canary,
            qos,
            features,
            events,
            tuner: AutoTuner::new(),
            stream_meta: Arc::new(DashMap::new()),
            started_at: Instant::now(),
            shut_down: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        engine.wire_cancel_hook();
        engine.wire_remediation_hook();
        engine.spawn_background_tasks();
        Ok(engine)
    }

    /// Spawn the worker process per config and build the engine on it.
    ///
    /// # Errors
    ///
    /// As [`Engine::new`], plus transport spawn failures.
    pub async fn spawn(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let transport = ProcessTransport::spawn(
            config.worker_runtime.clone(),
            config.json_rpc.clone(),
        )
        .await?;
        Self::new(config, transport as Arc<dyn WorkerTransport>)
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The canary manager (stage inspection, manual transitions).
    #[must_use]
    pub fn canary(&self) -> Arc<CanaryManager> {
        Arc::clone(&self.canary)
    }

    /// The QoS engine (policy events, metric sink).
    #[must_use]
    pub fn qos(&self) -> Arc<QosEngine> {
        Arc::clone(&self.qos)
    }

    /// The scheduler (statistics surface).
    #[must_use]
    pub fn scheduler(&self) -> Arc<PriorityScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// The tier limiter.
    #[must_use]
    pub fn limiter(&self) -> Arc<TierLimiter> {
        Arc::clone(&self.limiter)
    }

    // ========================================================================
    // Model lifecycle
    // ========================================================================

    /// Load a model.
    ///
    /// # Errors
    ///
    /// `InvalidParams` on validation failure (including path
    /// traversal), `ModelLoad` when the worker rejects the load.
    pub async fn load_model(&self, descriptor: ModelDescriptor) -> Result<ModelHandle> {
        self.load_model_inner(descriptor, false).await
    }

    /// Load a draft model for speculative decoding.
    ///
    /// # Errors
    ///
    /// As [`Engine::load_model`].
    pub async fn load_draft_model(&self, descriptor: ModelDescriptor) -> Result<ModelHandle> {
        self.load_model_inner(descriptor, true).await
    }

    async fn load_model_inner(
        &self,
        mut descriptor: ModelDescriptor,
        is_draft: bool,
    ) -> Result<ModelHandle> {
        self.check_running()?;
        self.validate_descriptor(&descriptor)?;
        if descriptor.quantization.is_none() {
            descriptor.quantization = self
                .config
                .model
                .default_quantization
                .as_deref()
                .and_then(|q| serde_json::from_value(Value::String(q.to_string())).ok());
        }

        if let Some(existing) = self.models.get(&descriptor.id) {
            if existing.state == crate::models::ModelState::Ready {
                return Ok(existing);
            }
            return Err(Error::InvalidParams(format!(
                "model {} is already {:?}",
                descriptor.id, existing.state
            )));
        }

        let started = Instant::now();
        let cached = self.cache.lookup(&descriptor);

        // Tier admission uses the size guessed from the id; the precise
        // count arrives with the worker's reply.
        let tier = ModelTier::guess_from_id(&descriptor.id);
        let _permit = self.limiter.acquire(tier).await?;

        let evicted = self
            .models
            .begin_load(descriptor.clone(), is_draft)
            .map_err(|e| self.surface(e))?;
        if let Some(victim) = evicted {
            info!(victim = %victim, "Evicting LRU model to make room");
            if let Err(e) = self.unload_model(&victim).await {
                warn!(victim = %victim, error = %e, "LRU eviction unload failed");
            }
        }

        let mut params = json!({
            "model_id": descriptor.id,
            "is_draft": is_draft,
        });
        if let Some(path) = &descriptor.local_path {
            params["local_path"] = json!(path);
        } else if let Some(hit) = &cached {
            params["local_path"] = json!(hit.path);
        }
        if let Some(revision) = &descriptor.revision {
            params["revision"] = json!(revision);
        }
        if let Some(quantization) = descriptor.quantization {
            params["quantization"] = json!(quantization);
        }

        match self.client.request(methods::LOAD_MODEL, params).await {
            Ok(reply) => {
                let context_length = reply
                    .get("context_length")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32);
                let tokenizer: TokenizerInfo = reply
                    .get("tokenizer")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let metadata: ModelMetadata = reply
                    .get("metadata")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                let handle = self
                    .models
                    .mark_ready(&descriptor.id, context_length, tokenizer, metadata)
                    .map_err(|e| self.surface(e))?;

                let duration_ms = started.elapsed().as_millis() as u64;
                MODEL_LOADS.with_label_values(&["ok"]).inc();
                MODEL_LOAD_DURATION.observe(duration_ms as f64);
                self.events.emit(EngineEvent::ModelLoaded {
                    model_id: descriptor.id.clone(),
                    duration_ms,
                });
                Ok(handle)
            }
            Err(err) => {
                self.models.mark_failed(&descriptor.id);
                MODEL_LOADS.with_label_values(&["error"]).inc();
                Err(self.surface(err))
            }
        }
    }

    /// Unload a model (or draft model).
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` when no handle exists.
    pub async fn unload_model(&self, model_id: &str) -> Result<()> {
        validate_model_id(model_id).map_err(|e| self.surface(e))?;
        if self.models.remove(model_id).is_none() {
            return Err(self.surface(Error::ModelNotLoaded(model_id.to_string())));
        }
        self.client
            .request(methods::UNLOAD_MODEL, json!({"model_id": model_id}))
            .await?;
        self.events.emit(EngineEvent::ModelUnloaded {
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    /// Unload a draft model.
    ///
    /// # Errors
    ///
    /// As [`Engine::unload_model`].
    pub async fn unload_draft_model(&self, model_id: &str) -> Result<()> {
        self.unload_model(model_id).await
    }

    /// Check draft-model compatibility for speculative decoding.
    ///
    /// # Errors
    ///
    /// Validation failures or the worker's guidance error.
    pub async fn is_draft_model_compatible(
        &self,
        model_id: &str,
        draft_model_id: &str,
    ) -> Result<bool> {
        self.check_running()?;
        validate_model_id(model_id).map_err(|e| self.surface(e))?;
        validate_model_id(draft_model_id).map_err(|e| self.surface(e))?;
        let reply = self
            .batcher
            .submit(
                methods::CHECK_DRAFT,
                json!({"model_id": model_id, "draft_model_id": draft_model_id}),
            )
            .await?;
        Ok(reply
            .get("compatible")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Warm a loaded model with short dummy generations.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` or a generation error from the worker.
    pub async fn warmup_model(&self, model_id: &str) -> Result<()> {
        self.check_running()?;
        self.models.ready(model_id).map_err(|e| self.surface(e))?;
        for i in 0..self.config.model.warmup_generations {
            let params = GenerateParams {
                max_tokens: Some(8),
                seed: Some(u64::from(i)),
                ..GenerateParams::new(model_id, "warmup")
            };
            let options = GenerationOptions {
                priority: Priority::Background,
                dedupe: false,
                ..GenerationOptions::default()
            };
            self.generate(params, options).await?;
        }
        debug!(model_id, "Warmup complete");
        Ok(())
    }

    // ========================================================================
    // Tokenization
    // ========================================================================

    /// Tokenize text with a loaded model's tokenizer.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded`, `BufferOverflow`, or the worker's tokenizer
    /// error.
    pub async fn tokenize(&self, model_id: &str, text: &str) -> Result<Vec<u32>> {
        self.check_running()?;
        validate_model_id(model_id).map_err(|e| self.surface(e))?;
        codec::check_payload_bytes(text.len(), self.config.json_rpc.max_line_buffer_size)
            .map_err(|e| self.surface(e))?;
        self.models.ready(model_id).map_err(|e| self.surface(e))?;

        let reply = self
            .batcher
            .submit(methods::TOKENIZE, json!({"model_id": model_id, "text": text}))
            .await?;
        let tokens = reply
            .get("tokens")
            .cloned()
            .ok_or_else(|| Error::Parse("tokenize reply missing tokens".to_string()))?;
        serde_json::from_value(tokens).map_err(|e| Error::Parse(format!("malformed tokens: {e}")))
    }

    /// Detokenize a token sequence back to text.
    ///
    /// # Errors
    ///
    /// As [`Engine::tokenize`].
    pub async fn detokenize(&self, model_id: &str, tokens: &[u32]) -> Result<String> {
        self.check_running()?;
        validate_model_id(model_id).map_err(|e| self.surface(e))?;
        self.models.ready(model_id).map_err(|e| self.surface(e))?;
        let reply = self
            .client
            .request(
                methods::DETOKENIZE,
                json!({"model_id": model_id, "tokens": tokens}),
            )
            .await?;
        Ok(reply
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Start a streaming generation: a lazy, cancellable sequence of
    /// `token | stats | terminal` chunks. Streaming always bypasses
    /// deduplication.
    ///
    /// # Errors
    ///
    /// Validation, admission (`Overloaded`/`Timeout`), or dispatch
    /// failures.
    pub async fn create_generator(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
    ) -> Result<Generation> {
        self.check_running()?;
        self.validate_generation(&params)?;
        let handle = self
            .models
            .ready(&params.model_id)
            .map_err(|e| self.surface(e))?;
        let variant = self.route_variant(&params, &options);
        self.admit_and_dispatch(params, options, &handle, variant)
            .await
    }

    /// Vision generation: same pipeline with image payloads.
    ///
    /// # Errors
    ///
    /// As [`Engine::create_generator`], plus `InvalidParams` when no
    /// image is supplied.
    pub async fn create_vision_generator(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
    ) -> Result<Generation> {
        if params.images.is_empty() {
            return Err(self.surface(Error::InvalidParams(
                "vision generation requires at least one image".to_string(),
            )));
        }
        for image in &params.images {
            codec::check_payload_bytes(image.len(), self.config.json_rpc.max_line_buffer_size)
                .map_err(|e| self.surface(e))?;
        }
        self.create_generator(params, options).await
    }

    /// Generate and await the full text. Identical concurrent requests
    /// (same fingerprint) share one dispatch and observe the same text.
    ///
    /// # Errors
    ///
    /// As [`Engine::create_generator`].
    pub async fn generate(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
    ) -> Result<String> {
        self.check_running()?;
        self.validate_generation(&params)?;
        self.models
            .ready(&params.model_id)
            .map_err(|e| self.surface(e))?;
        let variant = self.route_variant(&params, &options);

        let bypass = !options.dedupe;
        let producer_params = params.clone();
        let engine = self.clone_refs();
        let outcome = self
            .dedup
            .get_or_start(&params, bypass, move || async move {
                let generation = engine
                    .admit_and_dispatch_owned(producer_params, options, variant)
                    .await?;
                let text = generation.collect_text().await?;
                Ok(GenerationOutcome {
                    finish_reason: "stop".to_string(),
                    text,
                })
            })
            .await?;
        Ok(outcome.text)
    }

    /// Vision variant of [`Engine::generate`].
    ///
    /// # Errors
    ///
    /// As [`Engine::create_vision_generator`].
    pub async fn generate_vision(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
    ) -> Result<String> {
        let generation = self.create_vision_generator(params, options).await?;
        generation.collect_text().await
    }

    /// Cancel an in-flight generation stream. Idempotent.
    pub async fn cancel_generation(&self, stream_id: &str) {
        self.registry.cancel(stream_id, "caller").await;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Loaded models, most recently used first.
    #[must_use]
    pub fn list_models(&self) -> Vec<ModelHandle> {
        self.models.list()
    }

    /// One model's handle.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` when no handle exists.
    pub fn model_info(&self, model_id: &str) -> Result<ModelHandle> {
        self.models
            .get(model_id)
            .ok_or_else(|| Error::ModelNotLoaded(model_id.to_string()))
    }

    /// Runtime snapshot.
    #[must_use]
    pub fn runtime_info(&self) -> RuntimeInfo {
        let transport = self.client.transport();
        RuntimeInfo {
            worker_status: *transport.subscribe_status().borrow(),
            restart_count: transport.restart_count(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            hardware: self.tuner.hardware().clone(),
            circuit_state: self.client.circuit_state(),
            models_loaded: self.models.len(),
            active_streams: self.registry.active_count(),
        }
    }

    /// Active health probe: pings the worker through the full wire.
    pub async fn health_check(&self) -> HealthReport {
        let worker_responsive = self
            .client
            .request(methods::PING, Value::Null)
            .await
            .is_ok();
        let circuit_state = self.client.circuit_state();
        HealthReport {
            healthy: worker_responsive && circuit_state == CircuitState::Closed,
            worker_responsive,
            circuit_state,
            cache: self.cache.health(),
        }
    }

    /// Cache statistics.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            artifact: self.cache.health(),
            dedup_entries: self.dedup.len(),
            average_batch_size: self.batcher.stats().average_batch_size(),
        }
    }

    /// Apply a health sample to one tier: the auto-tuner recommendation
    /// is applied to the limiter and the learned profile persisted.
    pub fn apply_health_sample(&self, tier: ModelTier, sample: &HealthSample) {
        let current = self.limiter.capacity(tier);
        let recommendation = self.tuner.recommend(tier, current, sample);
        if recommendation.direction != TuningDirection::Hold {
            info!(
                tier = %tier,
                from = recommendation.current,
                to = recommendation.recommended,
                reason = %recommendation.reason,
                "Auto-tuner adjustment"
            );
            self.limiter.set_capacity(tier, recommendation.recommended);
            let mut limits = self.config.tiers.clone();
            for t in ModelTier::ALL {
                let mut limit = limits.get(t);
                limit.max_concurrent = self.limiter.capacity(t);
                limits.set(t, limit);
            }
            if let Err(e) = self.tuner.save_profile(&limits) {
                warn!(error = %e, "Failed to persist learned profile");
            }
        }
    }

    /// Drain and stop everything. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Engine shutting down");
        self.scheduler.shutdown();
        self.queue.clear_pending();
        self.queue.drain().await;
        self.registry.cancel_all("shutdown").await;
        self.batcher.flush_all().await;
        self.client.transport().shutdown().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.events.emit(EngineEvent::RuntimeStatus {
            status: "stopped".to_string(),
            restart_count: self.client.transport().restart_count(),
        });
    }

    // ========================================================================
    // Pipeline internals
    // ========================================================================

    fn check_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown("engine is shut down".to_string()));
        }
        Ok(())
    }

    fn validate_descriptor(&self, descriptor: &ModelDescriptor) -> Result<()> {
        validate_model_id(&descriptor.id).map_err(|e| self.surface(e))?;
        if let Some(path) = &descriptor.local_path {
            validate_local_path(path, &self.config.model.trusted_model_directories)
                .map_err(|e| self.surface(e))?;
        }
        Ok(())
    }

    fn validate_generation(&self, params: &GenerateParams) -> Result<()> {
        validate_model_id(&params.model_id).map_err(|e| self.surface(e))?;
        if params.prompt.is_empty() {
            return Err(self.surface(Error::InvalidParams("prompt must not be empty".to_string())));
        }
        if let Some(temperature) = params.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(self.surface(Error::InvalidParams(
                    "temperature must be within [0, 2]".to_string(),
                )));
            }
        }
        if let Some(top_p) = params.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(self.surface(Error::InvalidParams(
                    "top_p must be within [0, 1]".to_string(),
                )));
            }
        }
        // Byte cap on the prompt before any queueing happens; multibyte
        // characters count at their encoded width.
        codec::check_payload_bytes(
            params.prompt.len(),
            self.config.json_rpc.max_line_buffer_size,
        )
        .map_err(|e| self.surface(e))
    }

    fn route_variant(&self, params: &GenerateParams, options: &GenerationOptions) -> Variant {
        if self.features.rollback_to_baseline() {
            return Variant::Baseline;
        }
        let identifier = options
            .identifier
            .clone()
            .or_else(|| params.tenant_id.clone())
            .unwrap_or_else(|| crate::dedup::fingerprint(params));
        self.canary.route(&identifier)
    }

    /// A cheap bundle of the Arcs the dedup producer needs, so the
    /// spawned generation owns its subsystems.
    fn clone_refs(&self) -> EngineRefs {
        EngineRefs {
            client: Arc::clone(&self.client),
            registry: Arc::clone(&self.registry),
            limiter: Arc::clone(&self.limiter),
            scheduler: Arc::clone(&self.scheduler),
            queue: Arc::clone(&self.queue),
            models: Arc::clone(&self.models),
            events: Arc::clone(&self.events),
            stream_meta: Arc::clone(&self.stream_meta),
        }
    }

    async fn admit_and_dispatch(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
        handle: &ModelHandle,
        variant: Variant,
    ) -> Result<Generation> {
        let refs = self.clone_refs();
        let tier = handle.tier();
        refs.admit_and_dispatch_tiered(params, options, tier, variant)
            .await
    }
}

/// Subsystem references owned by an in-flight generation.
#[derive(Clone)]
struct EngineRefs {
    client: Arc<WorkerClient>,
    registry: Arc<StreamRegistry>,
    limiter: Arc<TierLimiter>,
    scheduler: Arc<PriorityScheduler>,
    queue: Arc<RequestQueue>,
    models: Arc<ModelManager>,
    events: Arc<EventBus>,
    stream_meta: Arc<DashMap<String, StreamMeta>>,
}

impl EngineRefs {
    async fn admit_and_dispatch_owned(
        self,
        params: GenerateParams,
        options: GenerationOptions,
        variant: Variant,
    ) -> Result<Generation> {
        let tier = self.models.ready(&params.model_id)?.tier();
        self.admit_and_dispatch_tiered(params, options, tier, variant)
            .await
    }

    /// Admission pipeline tail: Tier limit → Scheduler → Queue →
    /// Transport → Stream registration.
    async fn admit_and_dispatch_tiered(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
        tier: ModelTier,
        variant: Variant,
    ) -> Result<Generation> {
        let tier_permit = self.limiter.acquire(tier).await?;
        let scheduler_permit = self
            .scheduler
            .schedule(options.priority, options.deadline)
            .await?;

        let model_id = params.model_id.clone();
        let tenant_id = params.tenant_id.clone();
        let request_payload = serde_json::to_value(&params)?;
        let client = Arc::clone(&self.client);
        let reply = self
            .queue
            .execute(async move { client.request(methods::GENERATE, request_payload).await })
            .await?;

        let stream_id = reply
            .get("stream_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Parse("generate reply missing stream_id".to_string()))?
            .to_string();

        self.registry.register(&stream_id, tenant_id.clone())?;
        self.stream_meta.insert(
            stream_id.clone(),
            StreamMeta {
                model_id: model_id.clone(),
                tenant_id,
                variant,
                started: Instant::now(),
            },
        );
        let stream = self.registry.consume(&stream_id)?;

        GENERATIONS.with_label_values(&["started"]).inc();
        self.events.emit(EngineEvent::GenerationStarted {
            stream_id,
            model_id,
        });
        Ok(Generation {
            stream,
            _tier_permit: tier_permit,
            _scheduler_permit: scheduler_permit,
        })
    }
}

// ============================================================================
// Background wiring
// ============================================================================

impl Engine {
    fn wire_cancel_hook(self: &Arc<Self>) {
        let client = Arc::clone(&self.client);
        let stream_meta = Arc::clone(&self.stream_meta);
        self.registry.set_cancel_hook(Arc::new(move |stream_id: &str| {
            stream_meta.remove(stream_id);
            let client = Arc::clone(&client);
            let stream_id = stream_id.to_string();
            tokio::spawn(async move {
                let _ = client
                    .request(methods::CANCEL_STREAM, json!({"stream_id": stream_id}))
                    .await;
            });
        }));
    }

    fn wire_remediation_hook(self: &Arc<Self>) {
        let limiter = Arc::clone(&self.limiter);
        let events = Arc::clone(&self.events);
        self.qos
            .set_remediation_hook(Arc::new(move |action: &RemediationAction| {
                let factor = match action.action_type {
                    RemediationType::ScaleUp => Some(1.2),
                    RemediationType::ScaleDown | RemediationType::Throttle => Some(0.7),
                    RemediationType::Alert | RemediationType::Restart => None,
                };
                if let Some(factor) = factor {
                    for tier in ModelTier::ALL {
                        if action.target != "all" && action.target != tier.to_string() {
                            continue;
                        }
                        let current = limiter.capacity(tier);
                        let next = ((current as f64 * factor).round() as usize).max(1);
                        limiter.set_capacity(tier, next);
                    }
                }
                events.emit(EngineEvent::Error {
                    error: ErrorObject::new(
                        "REMEDIATION",
                        format!("{}: {}", action.action_type, action.reason),
                    ),
                });
            }));
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_event_pump());
        tasks.push(self.spawn_status_watch());
        tasks.push(self.registry.spawn_maintenance());
        tasks.push(self.dedup.spawn_cleanup());
        tasks.push(
            self.scheduler
                .spawn_maintenance(Duration::from_millis(250)),
        );
        tasks.push(self.qos.spawn_evaluator());
        if self.config.canary.enabled {
            tasks.push(self.canary.spawn_health_loop());
        }
        if self.config.cache.enabled {
            let cache = Arc::clone(&self.cache);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(3600));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    cache.sweep_expired();
                }
            }));
        }
    }

    /// Routes worker stream events into the registry in arrival order
    /// and attributes terminal outcomes to QoS and canary windows.
    fn spawn_event_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.client.transport().subscribe_events();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event pump lagged; stream events dropped");
                        EventBus::record_lag(skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                };

                let stream_id = event.stream_id.clone();
                match event.kind {
                    StreamEventKind::Token => {
                        let payload: TokenPayload =
                            match serde_json::from_value(event.payload) {
                                Ok(payload) => payload,
                                Err(e) => {
                                    warn!(error = %e, stream_id, "Malformed token payload");
                                    continue;
                                }
                            };
                        TOKENS_GENERATED.inc();
                        let _ = engine.registry.push_token(&stream_id, payload).await;
                    }
                    StreamEventKind::Stats => {
                        let _ = engine.registry.push_stats(&stream_id, event.payload).await;
                    }
                    StreamEventKind::Completed => {
                        let finish_reason = event
                            .payload
                            .get("finish_reason")
                            .and_then(Value::as_str)
                            .unwrap_or("stop")
                            .to_string();
                        engine
                            .registry
                            .complete(
                                &stream_id,
                                crate::protocol::CompletedPayload {
                                    finish_reason: finish_reason.clone(),
                                    is_final: true,
                                },
                            )
                            .await;
                        engine.finish_stream(&stream_id, true, &finish_reason);
                    }
                    StreamEventKind::Error => {
                        let error = ErrorObject {
                            code: event
                                .payload
                                .get("code")
                                .and_then(Value::as_str)
                                .unwrap_or("GENERATION_ERROR")
                                .to_string(),
                            message: event
                                .payload
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("worker stream error")
                                .to_string(),
                            details: None,
                        };
                        engine.registry.fail(&stream_id, error).await;
                        engine.finish_stream(&stream_id, false, "error");
                    }
                }
            }
        })
    }

    /// Attribute a terminal stream to telemetry, QoS, and canary.
    fn finish_stream(&self, stream_id: &str, success: bool, finish_reason: &str) {
        GENERATIONS
            .with_label_values(&[if success { "completed" } else { "error" }])
            .inc();
        if !success {
            ERRORS.with_label_values(&["GENERATION_ERROR"]).inc();
        }
        self.events.emit(EngineEvent::GenerationCompleted {
            stream_id: stream_id.to_string(),
            finish_reason: finish_reason.to_string(),
        });

        let Some((_, meta)) = self.stream_meta.remove(stream_id) else {
            return;
        };
        let latency_ms = meta.started.elapsed().as_secs_f64() * 1000.0;
        GENERATION_DURATION.observe(latency_ms);

        let store = self.qos.store();
        for metric in [QosMetric::LatencyP95, QosMetric::ErrorRate, QosMetric::Throughput] {
            let key = MetricKey {
                metric,
                tenant_id: meta.tenant_id.clone(),
                model_id: Some(meta.model_id.clone()),
            };
            match metric {
                QosMetric::LatencyP95 => store.observe(key, latency_ms),
                _ => store.observe_outcome(key, success),
            }
        }
        // Unscoped series drive global policies.
        store.observe(
            MetricKey {
                metric: QosMetric::LatencyP95,
                tenant_id: None,
                model_id: None,
            },
            latency_ms,
        );
        store.observe_outcome(
            MetricKey {
                metric: QosMetric::ErrorRate,
                tenant_id: None,
                model_id: None,
            },
            success,
        );

        self.canary
            .record_request(meta.variant, latency_ms, success, 0.0, false);
    }

    /// Invalidates handles when the worker restarts. Watch updates
    /// coalesce, so the restart counter is the reliable signal: a
    /// restart is detected even when the transient `Restarting` state
    /// was overwritten by `Ready` before this task woke.
    fn spawn_status_watch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let transport = self.client.transport();
        let mut status = transport.subscribe_status();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_status = *status.borrow();
            let mut last_restarts = transport.restart_count();
            while status.changed().await.is_ok() {
                let current = *status.borrow();
                let restarts = transport.restart_count();
                if current != last_status {
                    engine.events.emit(EngineEvent::RuntimeStatus {
                        status: current.to_string(),
                        restart_count: restarts,
                    });
                    last_status = current;
                }
                if restarts > last_restarts || current == WorkerStatus::Restarting {
                    last_restarts = restarts;
                    let invalidated = engine.models.invalidate_all();
                    if !invalidated.is_empty() {
                        engine.events.emit(EngineEvent::ModelInvalidated {
                            model_ids: invalidated,
                        });
                    }
                    engine.registry.cancel_all("worker_restart").await;
                }
            }
        })
    }

    fn surface(&self, err: Error) -> Error {
        ERRORS.with_label_values(&[err.code()]).inc();
        self.events.emit(EngineEvent::Error {
            error: ErrorObject::from(&err),
        });
        err
    }
}
