// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Request multiplexing for small stateless worker calls.
//!
//! Tokenize and draft-compat checks are cheap on the worker but pay full
//! per-call IPC overhead. The batcher keeps a FIFO pending list per
//! method and flushes when `max_batch_size` entries are waiting or
//! `flush_interval_ms` has elapsed since the first, whichever comes
//! first. Errors are entry-scoped: one failing entry rejects only its
//! caller; a transport-level failure rejects the whole batch with the
//! same error.

use crate::error::{Error, ErrorObject, Result};
use crate::metrics_constants::{
    METRIC_BATCHED_REQUESTS_TOTAL, METRIC_BATCHES_DISPATCHED_TOTAL, METRIC_BATCH_SIZE,
    METRIC_SOLO_REQUESTS_TOTAL,
};
use crate::config::BatchQueueConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

static BATCHES: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_BATCHES_DISPATCHED_TOTAL, "Batch calls dispatched"),
        &["method"],
    )
});
static BATCHED: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_BATCHED_REQUESTS_TOTAL, "Requests that rode in a batch"),
        &["method"],
    )
});
static SOLO: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_SOLO_REQUESTS_TOTAL, "Requests forwarded solo")
});
static BATCH_SIZE: LazyLock<Histogram> = LazyLock::new(|| {
    crate::metrics_utils::histogram(
        HistogramOpts::new(METRIC_BATCH_SIZE, "Observed batch sizes")
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]),
    )
});

/// Per-entry outcome inside a batch reply.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BatchEntryResult {
    /// Whether this entry succeeded
    pub success: bool,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Entry-scoped error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

/// Downstream surface the batcher dispatches through (the transport, or
/// a scripted worker in tests).
#[async_trait]
pub trait BatchTransport: Send + Sync {
    /// Dispatch one call without batching.
    async fn dispatch_solo(&self, method: &str, params: Value) -> Result<Value>;

    /// Dispatch a batch; the reply must be index-aligned with `entries`.
    async fn dispatch_batch(&self, method: &str, entries: Vec<Value>) -> Result<Vec<BatchEntryResult>>;
}

struct PendingEntry {
    params: Value,
    reply: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingList {
    entries: Vec<PendingEntry>,
    epoch: u64,
}

/// Aggregate batcher statistics.
#[derive(Debug, Default)]
pub struct BatcherStats {
    batches_dispatched: AtomicU64,
    requests_batched: AtomicU64,
    solo_requests: AtomicU64,
}

impl BatcherStats {
    /// Batch calls dispatched.
    pub fn batches_dispatched(&self) -> u64 {
        self.batches_dispatched.load(Ordering::Relaxed)
    }

    /// Requests that rode in a batch.
    pub fn requests_batched(&self) -> u64 {
        self.requests_batched.load(Ordering::Relaxed)
    }

    /// Requests forwarded solo.
    pub fn solo_requests(&self) -> u64 {
        self.solo_requests.load(Ordering::Relaxed)
    }

    /// Mean entries per dispatched batch.
    pub fn average_batch_size(&self) -> f64 {
        let batches = self.batches_dispatched();
        if batches == 0 {
            return 0.0;
        }
        self.requests_batched() as f64 / batches as f64
    }
}

/// The request batcher.
pub struct Batcher {
    config: BatchQueueConfig,
    transport: Arc<dyn BatchTransport>,
    pending: Mutex<HashMap<String, PendingList>>,
    stats: Arc<BatcherStats>,
}

impl Batcher {
    /// Map a solo method onto its batch form.
    #[must_use]
    pub fn batch_method(method: &str) -> Option<&'static str> {
        match method {
            crate::protocol::methods::TOKENIZE => Some(crate::protocol::methods::BATCH_TOKENIZE),
            crate::protocol::methods::CHECK_DRAFT => {
                Some(crate::protocol::methods::BATCH_CHECK_DRAFT)
            }
            _ => None,
        }
    }

    /// Build from config.
    #[must_use]
    pub fn new(config: BatchQueueConfig, transport: Arc<dyn BatchTransport>) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            pending: Mutex::new(HashMap::new()),
            stats: Arc::new(BatcherStats::default()),
        })
    }

    /// Statistics handle.
    #[must_use]
    pub fn stats(&self) -> Arc<BatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Submit one call. Batched when the method has a batch form and
    /// batching is enabled, forwarded directly otherwise.
    ///
    /// # Errors
    ///
    /// The entry-scoped error, or the transport error that failed the
    /// whole batch.
    pub async fn submit(self: &Arc<Self>, method: &str, params: Value) -> Result<Value> {
        let Some(_) = Self::batch_method(method) else {
            self.stats.solo_requests.fetch_add(1, Ordering::Relaxed);
            SOLO.inc();
            return self.transport.dispatch_solo(method, params).await;
        };
        if !self.config.enabled || self.config.max_batch_size <= 1 {
            self.stats.solo_requests.fetch_add(1, Ordering::Relaxed);
            SOLO.inc();
            return self.transport.dispatch_solo(method, params).await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let flush_now = {
            let mut pending = self.pending.lock();
            let list = pending.entry(method.to_string()).or_default();
            list.entries.push(PendingEntry {
                params,
                reply: reply_tx,
            });
            if list.entries.len() == 1 {
                // First entry arms the interval flush for this epoch.
                let batcher = Arc::clone(self);
                let method = method.to_string();
                let epoch = list.epoch;
                let interval = Duration::from_millis(self.config.flush_interval_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    batcher.flush_epoch(&method, epoch).await;
                });
            }
            list.entries.len() >= self.config.max_batch_size
        };

        if flush_now {
            self.flush(method).await;
        }

        reply_rx
            .await
            .map_err(|_| Error::Internal("batch dispatch dropped the reply".to_string()))?
    }

    /// Flush a method's pending list immediately.
    pub async fn flush(self: &Arc<Self>, method: &str) {
        let entries = {
            let mut pending = self.pending.lock();
            let Some(list) = pending.get_mut(method) else {
                return;
            };
            list.epoch += 1;
            std::mem::take(&mut list.entries)
        };
        self.dispatch(method, entries).await;
    }

    /// Flush every pending list (shutdown path).
    pub async fn flush_all(self: &Arc<Self>) {
        let methods: Vec<String> = self.pending.lock().keys().cloned().collect();
        for method in methods {
            self.flush(&method).await;
        }
    }

    async fn flush_epoch(self: &Arc<Self>, method: &str, epoch: u64) {
        let entries = {
            let mut pending = self.pending.lock();
            let Some(list) = pending.get_mut(method) else {
                return;
            };
            if list.epoch != epoch {
                // A size-triggered flush already took this batch.
                return;
            }
            list.epoch += 1;
            std::mem::take(&mut list.entries)
        };
        self.dispatch(method, entries).await;
    }

    async fn dispatch(&self, method: &str, entries: Vec<PendingEntry>) {
        if entries.is_empty() {
            return;
        }
        let Some(batch_method) = Self::batch_method(method) else {
            return;
        };
        let count = entries.len();
        debug!(method, count, "Dispatching batch");
        BATCHES.with_label_values(&[method]).inc();
        BATCHED.with_label_values(&[method]).inc_by(count as f64);
        BATCH_SIZE.observe(count as f64);
        self.stats.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.stats
            .requests_batched
            .fetch_add(count as u64, Ordering::Relaxed);

        let params: Vec<Value> = entries.iter().map(|e| e.params.clone()).collect();
        match self.transport.dispatch_batch(batch_method, params).await {
            Ok(results) => {
                let mut results = results.into_iter();
                for entry in entries {
                    let outcome = match results.next() {
                        Some(BatchEntryResult {
                            success: true,
                            result,
                            ..
                        }) => Ok(result.unwrap_or(Value::Null)),
                        Some(BatchEntryResult { error, .. }) => Err(error
                            .map(Error::from)
                            .unwrap_or_else(|| Error::Internal("batch entry failed".to_string()))),
                        None => Err(Error::Internal(
                            "batch reply shorter than the batch".to_string(),
                        )),
                    };
                    let _ = entry.reply.send(outcome);
                }
            }
            Err(err) => {
                // Transport-level failure: every entry rejects with the
                // same error.
                let shared = ErrorObject::from(&err);
                for entry in entries {
                    let _ = entry.reply.send(Err(Error::from(shared.clone())));
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::methods;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct ScriptedTransport {
        batch_calls: AtomicU32,
        solo_calls: AtomicU32,
        fail_transport: bool,
        fail_entry_index: Option<usize>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batch_calls: AtomicU32::new(0),
                solo_calls: AtomicU32::new(0),
                fail_transport: false,
                fail_entry_index: None,
            })
        }

        fn failing_entry(index: usize) -> Arc<Self> {
            Arc::new(Self {
                batch_calls: AtomicU32::new(0),
                solo_calls: AtomicU32::new(0),
                fail_transport: false,
                fail_entry_index: Some(index),
            })
        }

        fn failing_transport() -> Arc<Self> {
            Arc::new(Self {
                batch_calls: AtomicU32::new(0),
                solo_calls: AtomicU32::new(0),
                fail_transport: true,
                fail_entry_index: None,
            })
        }
    }

    #[async_trait]
    impl BatchTransport for ScriptedTransport {
        async fn dispatch_solo(&self, _method: &str, params: Value) -> Result<Value> {
            self.solo_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"echo": params}))
        }

        async fn dispatch_batch(
            &self,
            _method: &str,
            entries: Vec<Value>,
        ) -> Result<Vec<BatchEntryResult>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_transport {
                return Err(Error::Transport("worker gone".to_string()));
            }
            Ok(entries
                .into_iter()
                .enumerate()
                .map(|(i, params)| {
                    if self.fail_entry_index == Some(i) {
                        BatchEntryResult {
                            success: false,
                            result: None,
                            error: Some(ErrorObject::new("TOKENIZER_ERROR", "bad entry")),
                        }
                    } else {
                        BatchEntryResult {
                            success: true,
                            result: Some(json!({"index": i, "params": params})),
                            error: None,
                        }
                    }
                })
                .collect())
        }
    }

    fn config(max: usize, interval_ms: u64) -> BatchQueueConfig {
        BatchQueueConfig {
            enabled: true,
            max_batch_size: max,
            flush_interval_ms: interval_ms,
            adaptive_sizing: false,
            target_batch_time_ms: 50,
        }
    }

    #[tokio::test]
    async fn test_size_triggered_flush_single_batch_call() {
        let transport = ScriptedTransport::new();
        let batcher = Batcher::new(config(3, 10_000), Arc::clone(&transport) as _);

        let mut handles = Vec::new();
        for i in 0..3 {
            let batcher = Arc::clone(&batcher);
            handles.push(tokio::spawn(async move {
                batcher
                    .submit(methods::TOKENIZE, json!({"text": format!("t{i}")}))
                    .await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            // Each caller gets the reply for its own entry regardless of
            // insertion order.
            assert_eq!(value["params"]["text"], json!(format!("t{i}")));
        }
        assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.solo_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_interval_triggered_flush() {
        let transport = ScriptedTransport::new();
        let batcher = Batcher::new(config(100, 20), Arc::clone(&transport) as _);

        let value = batcher
            .submit(methods::TOKENIZE, json!({"text": "lonely"}))
            .await
            .unwrap();
        assert_eq!(value["index"], json!(0));
        assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entry_scoped_error_rejects_only_that_caller() {
        let transport = ScriptedTransport::failing_entry(1);
        let batcher = Batcher::new(config(3, 10_000), Arc::clone(&transport) as _);

        let mut handles = Vec::new();
        for i in 0..3 {
            let batcher = Arc::clone(&batcher);
            handles.push(tokio::spawn(async move {
                batcher
                    .submit(methods::TOKENIZE, json!({"text": format!("t{i}")}))
                    .await
            }));
        }
        let results: Vec<Result<Value>> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|h| h.unwrap())
            .collect();

        // Exactly one caller (whichever landed at index 1) rejects with
        // the entry-scoped error; the rest succeed.
        let failures = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
        let err = results
            .iter()
            .find_map(|r| r.as_ref().err())
            .map(|e| e.to_string())
            .unwrap_or_default();
        assert!(err.contains("bad entry"));
    }

    #[tokio::test]
    async fn test_transport_failure_rejects_whole_batch() {
        let transport = ScriptedTransport::failing_transport();
        let batcher = Batcher::new(config(2, 10_000), Arc::clone(&transport) as _);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let batcher = Arc::clone(&batcher);
            handles.push(tokio::spawn(async move {
                batcher.submit(methods::TOKENIZE, json!({})).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
    }

    #[tokio::test]
    async fn test_disabled_forwards_solo() {
        let transport = ScriptedTransport::new();
        let mut cfg = config(8, 10);
        cfg.enabled = false;
        let batcher = Batcher::new(cfg, Arc::clone(&transport) as _);

        batcher
            .submit(methods::TOKENIZE, json!({"text": "x"}))
            .await
            .unwrap();
        assert_eq!(transport.solo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unbatchable_method_forwards_solo() {
        let transport = ScriptedTransport::new();
        let batcher = Batcher::new(config(8, 10), Arc::clone(&transport) as _);
        batcher
            .submit(methods::LOAD_MODEL, json!({"model_id": "m"}))
            .await
            .unwrap();
        assert_eq!(transport.solo_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_track_batches() {
        let transport = ScriptedTransport::new();
        let batcher = Batcher::new(config(2, 10_000), Arc::clone(&transport) as _);

        // Two full rounds of exactly max_batch_size entries.
        for _ in 0..2 {
            let a = {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move { batcher.submit(methods::TOKENIZE, json!({})).await })
            };
            let b = {
                let batcher = Arc::clone(&batcher);
                tokio::spawn(async move { batcher.submit(methods::TOKENIZE, json!({})).await })
            };
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();
        }
        let stats = batcher.stats();
        assert_eq!(stats.batches_dispatched(), 2);
        assert_eq!(stats.requests_batched(), 4);
        assert!((stats.average_batch_size() - 2.0).abs() < f64::EPSILON);
    }
}
