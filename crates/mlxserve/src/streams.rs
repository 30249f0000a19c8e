// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Stream Registry - Token Streams with Backpressure
//!
//! Correlates worker-produced stream ids with consumer iterators.
//!
//! ## Guarantees
//!
//! - Tokens are delivered in worker-production order through a bounded
//!   per-stream channel
//! - Producers stall (bounded retries, then a SlowConsumer diagnostic
//!   and a blocking push) instead of dropping chunks
//! - Cancellation is idempotent and frees registry state; the consumer
//!   observes a terminal `Cancelled` error chunk
//! - Streams idle past `default_timeout_ms` are auto-cancelled
//!
//! The active-stream cap can be governed adaptively: a hysteresis
//! controller against TTFT/latency targets, or the PID governor when
//! configured. Per-tenant budgets bound how many streams one tenant can
//! hold with a decaying burst allowance.

use crate::config::{AdaptiveGovernorConfig, StreamRegistryConfig};
use crate::error::{Error, ErrorObject, Result};
use crate::metrics_constants::{
    METRIC_SLOW_CONSUMERS_TOTAL, METRIC_STREAMS_ACTIVE, METRIC_STREAMS_CANCELLED_TOTAL,
    METRIC_STREAM_BACKPRESSURE_STALLS_TOTAL, METRIC_STREAM_DURATION_MS, METRIC_STREAM_TOKENS_TOTAL,
    METRIC_STREAM_TTFT_MS,
};
use crate::protocol::{CompletedPayload, TokenPayload};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static ACTIVE_STREAMS: LazyLock<Gauge> = LazyLock::new(|| {
    crate::metrics_utils::gauge(METRIC_STREAMS_ACTIVE, "Streams currently registered")
});
static TOKENS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_STREAM_TOKENS_TOTAL, "Tokens pushed through the registry")
});
static STALLS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_STREAM_BACKPRESSURE_STALLS_TOTAL,
        "Producer stalls caused by backpressure",
    )
});
static SLOW_CONSUMERS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_SLOW_CONSUMERS_TOTAL,
        "Streams marked degraded after the backpressure retry budget",
    )
});
static CANCELLED: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_STREAMS_CANCELLED_TOTAL, "Streams cancelled"),
        &["reason"],
    )
});
static TTFT: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(METRIC_STREAM_TTFT_MS, "Time to first token in milliseconds").buckets(
            vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0],
        ),
    )
});
static DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(
            METRIC_STREAM_DURATION_MS,
            "End-to-end stream duration in milliseconds",
        )
        .buckets(vec![
            100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300_000.0,
        ]),
    )
});

/// One item of a consumer sequence.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// A produced token
    Token(TokenPayload),
    /// Generation statistics
    Stats(serde_json::Value),
    /// Terminal: generation finished normally
    Completed(CompletedPayload),
    /// Terminal: generation failed or was cancelled
    Error(ErrorObject),
}

impl StreamChunk {
    /// Whether this chunk closes the sequence.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Completed(_) | StreamChunk::Error(_))
    }
}

/// Stream lifecycle state; terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Registered, no token yet
    Idle,
    /// At least one token delivered
    Streaming,
    /// Finished normally
    Completed,
    /// Cancelled (explicitly or by timeout)
    Cancelled,
    /// Failed
    Errored,
}

impl StreamState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Cancelled | StreamState::Errored
        )
    }
}

struct StreamEntry {
    tenant_id: Option<String>,
    sender: mpsc::Sender<StreamChunk>,
    receiver: Mutex<Option<mpsc::Receiver<StreamChunk>>>,
    state: Mutex<StreamState>,
    degraded: AtomicBool,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    first_token_at: Mutex<Option<Instant>>,
}

/// Hook invoked when the registry cancels a stream (the engine posts the
/// cancel to the worker).
pub type CancelHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Lazy, cancellable sequence of stream chunks.
pub struct TokenStream {
    stream_id: String,
    receiver: mpsc::Receiver<StreamChunk>,
    finished: bool,
}

impl TokenStream {
    /// The worker-chosen stream id.
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Collect the stream to completion, concatenating token text.
    ///
    /// # Errors
    ///
    /// The terminal error chunk, when the stream errored or was
    /// cancelled.
    pub async fn collect_text(mut self) -> Result<String> {
        use futures::StreamExt;
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            match chunk {
                StreamChunk::Token(token) => text.push_str(&token.token),
                StreamChunk::Stats(_) => {}
                StreamChunk::Completed(_) => return Ok(text),
                StreamChunk::Error(err) => return Err(Error::from(err)),
            }
        }
        // Producer vanished without a terminal chunk.
        Err(Error::Generation("stream closed without completion".to_string()))
    }
}

impl futures::Stream for TokenStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                if chunk.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(chunk))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Debug, Default)]
struct TenantBudgetState {
    active: usize,
    burst_used: usize,
    last_decay: Option<Instant>,
}

/// Hysteresis/PID controller for the active-stream cap.
struct LimitController {
    limit: AtomicUsize,
    integral: Mutex<f64>,
    last_error: Mutex<f64>,
}

/// The stream registry.
pub struct StreamRegistry {
    config: StreamRegistryConfig,
    governor: AdaptiveGovernorConfig,
    entries: DashMap<String, Arc<StreamEntry>>,
    tenants: Mutex<HashMap<String, TenantBudgetState>>,
    controller: LimitController,
    cancel_hook: parking_lot::RwLock<Option<CancelHook>>,
    ttft_samples: Mutex<Vec<f64>>,
    latency_samples: Mutex<Vec<f64>>,
}

impl StreamRegistry {
    /// Build from config.
    #[must_use]
    pub fn new(config: StreamRegistryConfig, governor: AdaptiveGovernorConfig) -> Arc<Self> {
        let initial_limit = if governor.enabled {
            governor.max.min(config.max_active_streams)
        } else {
            config.max_active_streams
        };
        Arc::new(Self {
            config,
            governor,
            entries: DashMap::new(),
            tenants: Mutex::new(HashMap::new()),
            controller: LimitController {
                limit: AtomicUsize::new(initial_limit),
                integral: Mutex::new(0.0),
                last_error: Mutex::new(0.0),
            },
            cancel_hook: parking_lot::RwLock::new(None),
            ttft_samples: Mutex::new(Vec::new()),
            latency_samples: Mutex::new(Vec::new()),
        })
    }

    /// Install the worker-cancel hook.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        *self.cancel_hook.write() = Some(hook);
    }

    /// Effective active-stream cap right now.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.controller.limit.load(Ordering::Relaxed)
    }

    /// Registered stream count.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Register a stream id obtained from the worker.
    ///
    /// # Errors
    ///
    /// `Overloaded` at the active cap or when the tenant's budget is
    /// exhausted; `InvalidParams` when the id is already registered.
    pub fn register(&self, stream_id: &str, tenant_id: Option<String>) -> Result<()> {
        if self.entries.contains_key(stream_id) {
            return Err(Error::InvalidParams(format!(
                "stream {stream_id} already registered"
            )));
        }
        if self.entries.len() >= self.effective_limit() {
            return Err(Error::Overloaded(format!(
                "active stream limit {} reached",
                self.effective_limit()
            )));
        }
        if let Some(tenant) = &tenant_id {
            self.charge_tenant(tenant)?;
        }

        let capacity = self
            .config
            .backpressure
            .max_unacked_chunks
            .min(self.config.stream_queue_size)
            .max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let now = Instant::now();
        self.entries.insert(
            stream_id.to_string(),
            Arc::new(StreamEntry {
                tenant_id,
                sender,
                receiver: Mutex::new(Some(receiver)),
                state: Mutex::new(StreamState::Idle),
                degraded: AtomicBool::new(false),
                created_at: now,
                last_activity: Mutex::new(now),
                first_token_at: Mutex::new(None),
            }),
        );
        ACTIVE_STREAMS.set(self.entries.len() as f64);
        debug!(stream_id, "Stream registered");
        Ok(())
    }

    /// Take the consumer side. Each stream has exactly one consumer.
    ///
    /// # Errors
    ///
    /// `InvalidParams` when unknown or already consumed.
    pub fn consume(&self, stream_id: &str) -> Result<TokenStream> {
        let entry = self
            .entries
            .get(stream_id)
            .ok_or_else(|| Error::InvalidParams(format!("unknown stream {stream_id}")))?;
        let receiver = entry
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidParams(format!("stream {stream_id} already consumed")))?;
        Ok(TokenStream {
            stream_id: stream_id.to_string(),
            receiver,
            finished: false,
        })
    }

    /// Push one token, applying backpressure per config.
    ///
    /// # Errors
    ///
    /// `Cancelled` when the stream is already terminal or its consumer
    /// dropped the sequence.
    pub async fn push_token(&self, stream_id: &str, token: TokenPayload) -> Result<()> {
        let entry = self.entry_for_push(stream_id)?;
        {
            let mut state = entry.state.lock();
            if state.is_terminal() {
                return Err(Error::Cancelled(format!("stream {stream_id} is closed")));
            }
            if *state == StreamState::Idle {
                *state = StreamState::Streaming;
            }
        }
        {
            let mut first = entry.first_token_at.lock();
            if first.is_none() {
                *first = Some(Instant::now());
                let ttft_ms = entry.created_at.elapsed().as_secs_f64() * 1000.0;
                TTFT.observe(ttft_ms);
                self.ttft_samples.lock().push(ttft_ms);
            }
        }
        TOKENS.inc();
        self.deliver(stream_id, &entry, StreamChunk::Token(token))
            .await
    }

    /// Push a stats chunk.
    ///
    /// # Errors
    ///
    /// As [`StreamRegistry::push_token`].
    pub async fn push_stats(&self, stream_id: &str, stats: serde_json::Value) -> Result<()> {
        let entry = self.entry_for_push(stream_id)?;
        if entry.state.lock().is_terminal() {
            return Err(Error::Cancelled(format!("stream {stream_id} is closed")));
        }
        self.deliver(stream_id, &entry, StreamChunk::Stats(stats))
            .await
    }

    /// Terminal completion. Closes the consumer sequence and frees the
    /// registry entry.
    pub async fn complete(&self, stream_id: &str, payload: CompletedPayload) {
        let Some(entry) = self.remove_entry(stream_id, StreamState::Completed) else {
            return;
        };
        let _ = entry
            .sender
            .send(StreamChunk::Completed(payload))
            .await;
        self.finish_metrics(&entry);
        debug!(stream_id, "Stream completed");
    }

    /// Terminal error from the worker.
    pub async fn fail(&self, stream_id: &str, error: ErrorObject) {
        let Some(entry) = self.remove_entry(stream_id, StreamState::Errored) else {
            return;
        };
        let _ = entry.sender.send(StreamChunk::Error(error)).await;
        self.finish_metrics(&entry);
        warn!(stream_id, "Stream errored");
    }

    /// Cancel a stream. Idempotent: cancelling an unknown or already
    /// terminal stream is a no-op. Posts the cancel hook, emits a
    /// terminal `Cancelled` chunk, and frees the entry.
    pub async fn cancel(&self, stream_id: &str, reason: &str) {
        let Some(entry) = self.remove_entry(stream_id, StreamState::Cancelled) else {
            return;
        };
        CANCELLED.with_label_values(&[reason]).inc();
        if let Some(hook) = self.cancel_hook.read().as_ref() {
            hook(stream_id);
        }
        let _ = entry
            .sender
            .try_send(StreamChunk::Error(ErrorObject::new(
                "CANCELLED",
                format!("stream cancelled: {reason}"),
            )));
        self.finish_metrics(&entry);
        info!(stream_id, reason, "Stream cancelled");
    }

    /// Record an end-to-end latency sample for the adaptive controller.
    pub fn record_latency(&self, latency_ms: f64) {
        self.latency_samples.lock().push(latency_ms);
    }

    /// Spawn the maintenance loop: inactivity sweep plus one adaptive
    /// limit adjustment per tick.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = Duration::from_millis(registry.config.cleanup_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_inactive().await;
                registry.adjust_limit();
            }
        })
    }

    /// Cancel streams idle past the configured timeout.
    pub async fn sweep_inactive(&self) {
        let timeout = Duration::from_millis(self.config.default_timeout_ms);
        if timeout.is_zero() {
            return;
        }
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|kv| kv.value().last_activity.lock().elapsed() > timeout)
            .map(|kv| kv.key().clone())
            .collect();
        for stream_id in stale {
            self.cancel(&stream_id, "inactivity_timeout").await;
        }
    }

    /// Cancel every registered stream (shutdown path).
    pub async fn cancel_all(&self, reason: &str) {
        let ids: Vec<String> = self.entries.iter().map(|kv| kv.key().clone()).collect();
        for stream_id in ids {
            self.cancel(&stream_id, reason).await;
        }
    }

    /// One adaptive adjustment step over the samples gathered since the
    /// previous call.
    pub fn adjust_limit(&self) {
        let ttft: Vec<f64> = std::mem::take(&mut *self.ttft_samples.lock());
        let latency: Vec<f64> = std::mem::take(&mut *self.latency_samples.lock());

        if self.governor.enabled {
            self.adjust_limit_pid(&ttft);
            return;
        }
        let adaptive = &self.config.adaptive_limits;
        if !adaptive.enabled || ttft.is_empty() {
            return;
        }

        let avg_ttft = ttft.iter().sum::<f64>() / ttft.len() as f64;
        let avg_latency = if latency.is_empty() {
            0.0
        } else {
            latency.iter().sum::<f64>() / latency.len() as f64
        };

        let current = self.controller.limit.load(Ordering::Relaxed);
        let ttft_ratio = avg_ttft / adaptive.target_ttft_ms.max(f64::EPSILON);
        let latency_ratio = avg_latency / adaptive.target_latency_ms.max(f64::EPSILON);
        let pressure = ttft_ratio.max(latency_ratio);

        let next = if pressure < adaptive.scale_up_threshold {
            (current + 1).min(adaptive.max)
        } else if pressure > adaptive.scale_down_threshold {
            current.saturating_sub((current / 4).max(1)).max(adaptive.min)
        } else {
            current
        };
        if next != current {
            info!(from = current, to = next, pressure, "Adaptive stream limit adjusted");
            self.controller.limit.store(next, Ordering::Relaxed);
        }
    }

    fn adjust_limit_pid(&self, ttft: &[f64]) {
        if ttft.is_empty() {
            return;
        }
        let measured = ttft.iter().sum::<f64>() / ttft.len() as f64;
        let pid = &self.governor.pid;
        // Positive error: headroom below the TTFT target.
        let error = (self.governor.target_ttft_ms - measured) / self.governor.target_ttft_ms;

        let mut integral = self.controller.integral.lock();
        *integral = (*integral + error)
            .clamp(-pid.integral_saturation, pid.integral_saturation);
        let mut last = self.controller.last_error.lock();
        let derivative = error - *last;
        *last = error;

        let output = pid.kp * error + pid.ki * *integral + pid.kd * derivative;
        let current = self.controller.limit.load(Ordering::Relaxed) as f64;
        let next = (current + output.clamp(-8.0, 8.0))
            .round()
            .clamp(self.governor.min as f64, self.governor.max as f64)
            as usize;
        if next != current as usize {
            debug!(from = current, to = next, error, "PID stream limit adjusted");
            self.controller.limit.store(next, Ordering::Relaxed);
        }
    }

    fn entry_for_push(&self, stream_id: &str) -> Result<Arc<StreamEntry>> {
        let entry = self
            .entries
            .get(stream_id)
            .ok_or_else(|| Error::Cancelled(format!("stream {stream_id} is closed")))?;
        *entry.last_activity.lock() = Instant::now();
        Ok(Arc::clone(entry.value()))
    }

    async fn deliver(
        &self,
        stream_id: &str,
        entry: &Arc<StreamEntry>,
        chunk: StreamChunk,
    ) -> Result<()> {
        let backpressure = &self.config.backpressure;
        let mut pending = chunk;
        for _ in 0..backpressure.queue_put_max_retries {
            match entry.sender.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(back)) => {
                    pending = back;
                    STALLS.inc();
                    tokio::time::sleep(Duration::from_millis(backpressure.queue_put_backoff_ms))
                        .await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Consumer dropped the sequence.
                    self.cancel(stream_id, "consumer_dropped").await;
                    return Err(Error::Cancelled(format!(
                        "stream {stream_id}: consumer dropped"
                    )));
                }
            }
        }

        // Retry budget exhausted: the stream is degraded, not
        // cancelled, and the blocking send stalls production until the
        // consumer drains.
        if !entry.degraded.swap(true, Ordering::Relaxed) {
            SLOW_CONSUMERS.inc();
            warn!(stream_id, "Slow consumer; stream marked degraded");
        }
        entry.sender.send(pending).await.map_err(|_| {
            Error::Cancelled(format!("stream {stream_id}: consumer dropped"))
        })
    }

    fn remove_entry(&self, stream_id: &str, to: StreamState) -> Option<Arc<StreamEntry>> {
        let (_, entry) = self.entries.remove(stream_id)?;
        {
            let mut state = entry.state.lock();
            if state.is_terminal() {
                return None;
            }
            *state = to;
        }
        if let Some(tenant) = &entry.tenant_id {
            self.release_tenant(tenant);
        }
        ACTIVE_STREAMS.set(self.entries.len() as f64);
        Some(entry)
    }

    fn finish_metrics(&self, entry: &StreamEntry) {
        let total_ms = entry.created_at.elapsed().as_secs_f64() * 1000.0;
        DURATION.observe(total_ms);
        self.record_latency(total_ms);
    }

    fn charge_tenant(&self, tenant: &str) -> Result<()> {
        if !self.governor.enabled {
            return Ok(());
        }
        let budgets = &self.governor.tenant_budgets;
        let mut tenants = self.tenants.lock();
        let state = tenants.entry(tenant.to_string()).or_default();

        let decay = Duration::from_millis(budgets.decay_ms.max(1));
        match state.last_decay {
            Some(last) if last.elapsed() >= decay => {
                state.burst_used = 0;
                state.last_decay = Some(Instant::now());
            }
            None => state.last_decay = Some(Instant::now()),
            _ => {}
        }

        if state.active < budgets.hard_limit {
            state.active += 1;
            return Ok(());
        }
        if state.burst_used < budgets.burst_limit {
            state.burst_used += 1;
            state.active += 1;
            return Ok(());
        }
        Err(Error::Overloaded(format!(
            "tenant {tenant}: stream budget exhausted ({} active)",
            state.active
        )))
    }

    fn release_tenant(&self, tenant: &str) {
        let mut tenants = self.tenants.lock();
        if let Some(state) = tenants.get_mut(tenant) {
            state.active = state.active.saturating_sub(1);
            if state.active == 0 && state.burst_used == 0 {
                tenants.remove(tenant);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn token(text: &str) -> TokenPayload {
        TokenPayload {
            token: text.to_string(),
            token_id: None,
            logprob: None,
            is_final: false,
            cumulative_text: None,
        }
    }

    fn registry() -> Arc<StreamRegistry> {
        StreamRegistry::new(
            StreamRegistryConfig::default(),
            AdaptiveGovernorConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_tokens_delivered_in_order() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let stream = registry.consume("s-1").unwrap();

        for i in 0..10 {
            registry
                .push_token("s-1", token(&format!("t{i} ")))
                .await
                .unwrap();
        }
        registry
            .complete(
                "s-1",
                CompletedPayload {
                    finish_reason: "stop".to_string(),
                    is_final: true,
                },
            )
            .await;

        let chunks: Vec<StreamChunk> = stream.collect().await;
        assert_eq!(chunks.len(), 11);
        for (i, chunk) in chunks.iter().take(10).enumerate() {
            match chunk {
                StreamChunk::Token(t) => assert_eq!(t.token, format!("t{i} ")),
                other => panic!("expected token, got {other:?}"),
            }
        }
        assert!(chunks[10].is_terminal());
    }

    #[tokio::test]
    async fn test_collect_text() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let stream = registry.consume("s-1").unwrap();

        let producer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry.push_token("s-1", token("Hello")).await.unwrap();
                registry.push_token("s-1", token(", world")).await.unwrap();
                registry
                    .complete(
                        "s-1",
                        CompletedPayload {
                            finish_reason: "stop".to_string(),
                            is_final: true,
                        },
                    )
                    .await;
            })
        };
        let text = stream.collect_text().await.unwrap();
        producer.await.unwrap();
        assert_eq!(text, "Hello, world");
    }

    #[tokio::test]
    async fn test_single_consumer() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let _stream = registry.consume("s-1").unwrap();
        assert!(registry.consume("s-1").is_err());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let mut stream = registry.consume("s-1").unwrap();

        registry.cancel("s-1", "caller").await;
        registry.cancel("s-1", "caller").await;
        registry.cancel("unknown", "caller").await;

        let chunk = stream.next().await.unwrap();
        match chunk {
            StreamChunk::Error(err) => assert_eq!(err.code, "CANCELLED"),
            other => panic!("expected cancelled error, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_invokes_hook_once() {
        let registry = registry();
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        registry.set_cancel_hook(Arc::new(move |_| {
            hook_count.fetch_add(1, Ordering::SeqCst);
        }));

        registry.register("s-1", None).unwrap();
        registry.cancel("s-1", "caller").await;
        registry.cancel("s-1", "caller").await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_push_after_terminal_fails() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        registry.cancel("s-1", "caller").await;
        let err = registry.push_token("s-1", token("late")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_active_limit_enforced() {
        let config = StreamRegistryConfig {
            max_active_streams: 2,
            ..StreamRegistryConfig::default()
        };
        let registry = StreamRegistry::new(config, AdaptiveGovernorConfig::default());
        registry.register("s-1", None).unwrap();
        registry.register("s-2", None).unwrap();
        let err = registry.register("s-3", None).unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));

        registry.cancel("s-1", "make_room").await;
        registry.register("s-3", None).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        assert!(matches!(
            registry.register("s-1", None),
            Err(Error::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_backpressure_marks_degraded_without_cancel() {
        let config = StreamRegistryConfig {
            stream_queue_size: 2,
            backpressure: crate::config::BackpressureConfig {
                max_unacked_chunks: 2,
                queue_put_max_retries: 2,
                queue_put_backoff_ms: 1,
                ..crate::config::BackpressureConfig::default()
            },
            ..StreamRegistryConfig::default()
        };
        let registry = StreamRegistry::new(config, AdaptiveGovernorConfig::default());
        registry.register("s-1", None).unwrap();
        let mut stream = registry.consume("s-1").unwrap();

        // Fill the channel; the third push exhausts retries and blocks
        // until the consumer drains.
        registry.push_token("s-1", token("a")).await.unwrap();
        registry.push_token("s-1", token("b")).await.unwrap();

        let push = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.push_token("s-1", token("c")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!push.is_finished(), "push should be stalled");

        // Stream is degraded but alive.
        assert_eq!(registry.active_count(), 1);
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamChunk::Token(_)));
        push.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_consumer_drop_cancels_stream() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let stream = registry.consume("s-1").unwrap();
        drop(stream);

        let err = registry.push_token("s-1", token("x")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_inactivity_sweep() {
        let config = StreamRegistryConfig {
            default_timeout_ms: 20,
            ..StreamRegistryConfig::default()
        };
        let registry = StreamRegistry::new(config, AdaptiveGovernorConfig::default());
        registry.register("s-1", None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.sweep_inactive().await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_adaptive_scale_up_and_down() {
        let config = StreamRegistryConfig {
            max_active_streams: 10,
            adaptive_limits: crate::config::AdaptiveLimitsConfig {
                enabled: true,
                min: 2,
                max: 20,
                target_ttft_ms: 1000.0,
                target_latency_ms: 100_000.0,
                scale_up_threshold: 0.7,
                scale_down_threshold: 0.95,
            },
            ..StreamRegistryConfig::default()
        };
        let registry = StreamRegistry::new(config, AdaptiveGovernorConfig::default());
        let base = registry.effective_limit();

        // Fast TTFT: scale up by one.
        registry.ttft_samples.lock().push(100.0);
        registry.adjust_limit();
        assert_eq!(registry.effective_limit(), base + 1);

        // Slow TTFT: scale down toward min.
        registry.ttft_samples.lock().push(5_000.0);
        registry.adjust_limit();
        assert!(registry.effective_limit() < base + 1);
    }

    #[tokio::test]
    async fn test_pid_governor_respects_bounds() {
        let governor = AdaptiveGovernorConfig {
            enabled: true,
            target_ttft_ms: 500.0,
            min: 2,
            max: 8,
            ..AdaptiveGovernorConfig::default()
        };
        let registry = StreamRegistry::new(StreamRegistryConfig::default(), governor);

        // Persistently awful TTFT drives the limit to the floor, never below.
        for _ in 0..50 {
            registry.ttft_samples.lock().push(50_000.0);
            registry.adjust_limit();
        }
        assert_eq!(registry.effective_limit(), 2);

        // Persistently great TTFT drives it to the ceiling, never above.
        for _ in 0..200 {
            registry.ttft_samples.lock().push(1.0);
            registry.adjust_limit();
        }
        assert_eq!(registry.effective_limit(), 8);
    }

    #[tokio::test]
    async fn test_tenant_budget_enforced() {
        let governor = AdaptiveGovernorConfig {
            enabled: true,
            tenant_budgets: crate::config::TenantBudgetConfig {
                hard_limit: 1,
                burst_limit: 1,
                decay_ms: 60_000,
            },
            ..AdaptiveGovernorConfig::default()
        };
        let registry = StreamRegistry::new(StreamRegistryConfig::default(), governor);

        registry.register("s-1", Some("acme".to_string())).unwrap();
        registry.register("s-2", Some("acme".to_string())).unwrap(); // burst
        let err = registry
            .register("s-3", Some("acme".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Overloaded(_)));

        // Another tenant is unaffected.
        registry.register("s-4", Some("globex".to_string())).unwrap();

        // Releasing frees budget.
        registry.cancel("s-1", "done").await;
        registry.register("s-5", Some("acme".to_string())).unwrap();
    }

    #[tokio::test]
    async fn test_worker_error_surfaces_to_consumer() {
        let registry = registry();
        registry.register("s-1", None).unwrap();
        let stream = registry.consume("s-1").unwrap();
        registry
            .fail("s-1", ErrorObject::new("GENERATION_ERROR", "oom"))
            .await;

        let err = stream.collect_text().await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
    }
}
