// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Worker Transport - Framed IPC to the Worker Runtime
//!
//! The Worker Runtime is an out-of-process numerics backend speaking
//! newline-delimited JSON over stdio. This module has two layers:
//!
//! - [`ProcessTransport`]: raw wire ownership. Process spawn and
//!   supervised restart, request/reply correlation through a pending
//!   map, per-request timeouts, and stream-event fan-out in arrival
//!   order.
//! - [`WorkerClient`]: the guarded dispatch surface the engine calls.
//!   Payload byte-cap enforcement, circuit breaking, and classified
//!   retries. `generate` is non-idempotent and dispatched with a
//!   single-attempt policy unless explicitly configured otherwise.
//!
//! The [`WorkerTransport`] trait is the seam between them, and what the
//! scripted test worker implements.

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::codec;
use crate::config::{RpcConfig, WorkerRuntimeConfig};
use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_TRANSPORT_INFLIGHT, METRIC_TRANSPORT_REQUESTS_TOTAL,
    METRIC_TRANSPORT_REQUEST_DURATION_MS, METRIC_WORKER_RESTARTS_TOTAL,
};
use crate::protocol::{
    methods, StreamEvent, WireError, WorkerFrame, WorkerRequest, WorkerResponse,
};
use crate::retry::{with_retry, RetryPolicy, RetryStats};
use async_trait::async_trait;
use dashmap::DashMap;
use prometheus::{Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

static REQUESTS: LazyLock<CounterVec> = LazyLock::new(|| {
    crate::metrics_utils::counter_vec(
        Opts::new(METRIC_TRANSPORT_REQUESTS_TOTAL, "Worker requests dispatched"),
        &["method", "outcome"],
    )
});
static REQUEST_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    crate::metrics_utils::histogram_vec(
        HistogramOpts::new(
            METRIC_TRANSPORT_REQUEST_DURATION_MS,
            "Worker request round-trip in milliseconds",
        )
        .buckets(vec![1.0, 5.0, 25.0, 100.0, 500.0, 2500.0, 10000.0, 60000.0]),
        &["method"],
    )
});
static INFLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    crate::metrics_utils::gauge(METRIC_TRANSPORT_INFLIGHT, "Requests awaiting a worker reply")
});
static RESTARTS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_WORKER_RESTARTS_TOTAL, "Worker process restarts")
});

/// Worker runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Process spawned, first ping not yet answered
    Starting,
    /// Serving
    Ready,
    /// Process died; restart in progress
    Restarting,
    /// Restart budget exhausted
    Failed,
    /// Shut down deliberately
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Restarting => write!(f, "restarting"),
            WorkerStatus::Failed => write!(f, "failed"),
            WorkerStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// The wire seam: implemented by [`ProcessTransport`] and by the
/// scripted worker in tests.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Send one request and await its reply.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// Subscribe to stream events in arrival order.
    fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent>;

    /// Watch worker status transitions.
    fn subscribe_status(&self) -> watch::Receiver<WorkerStatus>;

    /// Restarts since startup.
    fn restart_count(&self) -> u32;

    /// Stop the worker and release the wire.
    async fn shutdown(&self);
}

struct PendingSlot {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

/// Stdio transport to a supervised worker process.
pub struct ProcessTransport {
    worker_config: WorkerRuntimeConfig,
    rpc_config: RpcConfig,
    next_id: AtomicU64,
    pending: DashMap<u64, PendingSlot>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    events: broadcast::Sender<StreamEvent>,
    status: watch::Sender<WorkerStatus>,
    restarts: AtomicU32,
    shutting_down: AtomicBool,
}

impl ProcessTransport {
    /// Spawn the worker process and verify liveness with a ping.
    ///
    /// # Errors
    ///
    /// `Io` when the process cannot be spawned; `Timeout` when the
    /// worker does not answer its first ping within the startup budget.
    pub async fn spawn(
        worker_config: WorkerRuntimeConfig,
        rpc_config: RpcConfig,
    ) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(1024);
        let (status, _) = watch::channel(WorkerStatus::Starting);
        let transport = Arc::new(Self {
            worker_config,
            rpc_config,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            events,
            status,
            restarts: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        });

        transport.spawn_process().await?;
        Arc::clone(&transport).spawn_supervisor();

        let startup = Duration::from_millis(transport.worker_config.startup_timeout_ms);
        transport
            .request_with_timeout(methods::PING, Value::Null, startup)
            .await?;
        let _ = transport.status.send(WorkerStatus::Ready);
        info!("Worker runtime ready");
        Ok(transport)
    }

    async fn spawn_process(&self) -> Result<()> {
        let mut child = Command::new(&self.worker_config.python_path)
            .arg(&self.worker_config.script_path)
            .args(&self.worker_config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("worker stdin unavailable".to_string()))?;
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Reader/supervisor: pumps stdout frames, and on process death
    /// fails every pending request, then restarts with exponential
    /// delay up to the configured budget.
    fn spawn_supervisor(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let stdout = {
                    let mut child = self.child.lock().await;
                    child.as_mut().and_then(|c| c.stdout.take())
                };
                let Some(stdout) = stdout else {
                    error!("Worker stdout unavailable; supervisor exiting");
                    let _ = self.status.send(WorkerStatus::Failed);
                    return;
                };

                self.pump_lines(BufReader::new(stdout)).await;
                self.fail_all_pending("worker process exited");

                if self.shutting_down.load(Ordering::SeqCst) {
                    let _ = self.status.send(WorkerStatus::Stopped);
                    return;
                }

                let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > self.worker_config.max_restarts {
                    error!(attempt, "Worker restart budget exhausted");
                    let _ = self.status.send(WorkerStatus::Failed);
                    return;
                }

                RESTARTS.inc();
                let _ = self.status.send(WorkerStatus::Restarting);
                let delay = Duration::from_millis(
                    self.worker_config.restart_delay_base_ms << (attempt - 1).min(16),
                );
                warn!(attempt, delay_ms = delay.as_millis() as u64, "Restarting worker");
                tokio::time::sleep(delay).await;

                match self.spawn_process().await {
                    Ok(()) => {
                        let _ = self.status.send(WorkerStatus::Ready);
                        info!(attempt, "Worker restarted");
                    }
                    Err(e) => {
                        error!(error = %e, "Worker respawn failed");
                        let _ = self.status.send(WorkerStatus::Failed);
                        return;
                    }
                }
            }
        });
    }

    async fn pump_lines<R>(&self, reader: BufReader<R>)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let max_bytes = self.rpc_config.max_line_buffer_size;
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&line, max_bytes),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Worker stdout read failed");
                    return;
                }
            }
        }
    }

    fn handle_line(&self, line: &str, max_bytes: usize) {
        if line.trim().is_empty() {
            return;
        }
        let value: Value = match codec::decode_frame(line, max_bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable worker frame");
                return;
            }
        };
        match WorkerFrame::classify(&value) {
            Some("response") => match serde_json::from_value::<WorkerResponse>(value) {
                Ok(response) => self.complete_pending(response),
                Err(e) => warn!(error = %e, "Malformed worker response"),
            },
            Some("event") => match serde_json::from_value::<StreamEvent>(value) {
                Ok(event) => {
                    // FIFO order per subscriber is the broadcast
                    // channel's guarantee.
                    let _ = self.events.send(event);
                }
                Err(e) => warn!(error = %e, "Malformed stream event"),
            },
            _ => warn!("Worker frame is neither response nor event"),
        }
    }

    fn complete_pending(&self, response: WorkerResponse) {
        let Some((_, slot)) = self.pending.remove(&response.id) else {
            debug!(id = response.id, "Reply for unknown or timed-out request");
            return;
        };
        INFLIGHT.set(self.pending.len() as f64);
        debug!(id = response.id, method = %slot.method, "Worker reply");
        let outcome = match (response.result, response.error) {
            (Some(result), None) => Ok(result),
            (_, Some(WireError { code, message, .. })) => {
                Err(Error::from_worker_code(&code, message))
            }
            (None, None) => Err(Error::Parse(format!(
                "reply {} carries neither result nor error",
                response.id
            ))),
        };
        let _ = slot.reply.send(outcome);
    }

    fn fail_all_pending(&self, reason: &str) {
        let ids: Vec<u64> = self.pending.iter().map(|kv| *kv.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.pending.remove(&id) {
                let _ = slot
                    .reply
                    .send(Err(Error::Transport(format!("{reason} (request {id})"))));
            }
        }
        INFLIGHT.set(0.0);
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if matches!(*self.status.borrow(), WorkerStatus::Failed | WorkerStatus::Stopped) {
            return Err(Error::Transport(format!(
                "worker is {}",
                *self.status.borrow()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = codec::encode_frame(
            &WorkerRequest {
                id,
                method: method.to_string(),
                params,
            },
            self.rpc_config.max_line_buffer_size,
        )?;

        if self.pending.len() >= self.rpc_config.max_pending_requests {
            return Err(Error::Overloaded(format!(
                "{} pending worker requests",
                self.pending.len()
            )));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingSlot {
                method: method.to_string(),
                reply: reply_tx,
            },
        );
        INFLIGHT.set(self.pending.len() as f64);

        let write_result = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => stdin.write_all(frame.as_bytes()).await.map_err(Error::Io),
                None => Err(Error::Transport("worker stdin closed".to_string())),
            }
        };
        if let Err(e) = write_result {
            self.pending.remove(&id);
            INFLIGHT.set(self.pending.len() as f64);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Transport(format!(
                "reply channel dropped (request {id})"
            ))),
            Err(_) => {
                // Cancel the pending slot so a late reply is discarded.
                self.pending.remove(&id);
                INFLIGHT.set(self.pending.len() as f64);
                Err(Error::Timeout {
                    method: method.to_string(),
                    request_id: id,
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let timeout = Duration::from_millis(self.rpc_config.default_timeout_ms);
        self.request_with_timeout(method, params, timeout).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.fail_all_pending("shutting down");
        *self.stdin.lock().await = None;

        let shutdown_budget = Duration::from_millis(self.worker_config.shutdown_timeout_ms);
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            // Closing stdin asks the worker to exit; kill when it
            // overstays the budget.
            match tokio::time::timeout(shutdown_budget, child.wait()).await {
                Ok(_) => debug!("Worker exited cleanly"),
                Err(_) => {
                    warn!("Worker ignored shutdown; killing");
                    let _ = child.kill().await;
                }
            }
        }
        let _ = self.status.send(WorkerStatus::Stopped);
    }
}

// ============================================================================
// Guarded client
// ============================================================================

/// The engine's dispatch surface: payload caps, circuit breaking, and
/// classified retries around any [`WorkerTransport`].
pub struct WorkerClient {
    transport: Arc<dyn WorkerTransport>,
    config: RpcConfig,
    breaker: CircuitBreaker,
    retry_policy: RetryPolicy,
    stats: Arc<RetryStats>,
}

impl WorkerClient {
    /// Wrap a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn WorkerTransport>, config: RpcConfig) -> Arc<Self> {
        let breaker = CircuitBreaker::new("worker", config.circuit_breaker.clone());
        let retry_policy = config.retry.to_policy();
        Arc::new(Self {
            transport,
            config,
            breaker,
            retry_policy,
            stats: RetryStats::new(),
        })
    }

    /// The raw transport (event subscription, shutdown).
    #[must_use]
    pub fn transport(&self) -> Arc<dyn WorkerTransport> {
        Arc::clone(&self.transport)
    }

    /// Retry statistics.
    #[must_use]
    pub fn retry_stats(&self) -> Arc<RetryStats> {
        Arc::clone(&self.stats)
    }

    /// Breaker state (health surface).
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Dispatch one request under the cap, breaker, and retry policy.
    ///
    /// # Errors
    ///
    /// `BufferOverflow` before any dispatch when the payload exceeds
    /// the byte cap; `CircuitOpen` while the breaker rejects; otherwise
    /// the worker's mapped error.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        // The cap is measured on serialized bytes, so multibyte
        // characters count at full width. Checked before any queueing or
        // dispatch work happens.
        let serialized_len = serde_json::to_string(&params)?.len();
        codec::check_payload_bytes(serialized_len, self.config.max_line_buffer_size)?;

        let policy = self.policy_for(method);
        let started = Instant::now();
        let result = with_retry(&policy, method, Some(&self.stats), || {
            let params = params.clone();
            async move {
                let permit = self.breaker.try_acquire()?;
                match self.transport.request(method, params).await {
                    Ok(value) => {
                        self.breaker.record_success(permit);
                        Ok(value)
                    }
                    Err(err) => {
                        // Only transport-class failures count against
                        // the breaker; application errors are the
                        // worker answering correctly.
                        if err.is_retryable() {
                            self.breaker.record_failure(permit);
                        } else {
                            self.breaker.record_success(permit);
                        }
                        Err(err)
                    }
                }
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        REQUEST_DURATION
            .with_label_values(&[method])
            .observe(elapsed_ms);
        REQUESTS
            .with_label_values(&[method, if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    fn policy_for(&self, method: &str) -> RetryPolicy {
        if method == methods::GENERATE && !self.config.retry_generate {
            RetryPolicy::none()
        } else {
            self.retry_policy.clone()
        }
    }
}

#[async_trait]
impl crate::batcher::BatchTransport for WorkerClient {
    async fn dispatch_solo(&self, method: &str, params: Value) -> Result<Value> {
        self.request(method, params).await
    }

    async fn dispatch_batch(
        &self,
        method: &str,
        entries: Vec<Value>,
    ) -> Result<Vec<crate::batcher::BatchEntryResult>> {
        let reply = self
            .request(method, serde_json::json!({ "entries": entries }))
            .await?;
        let results = reply
            .get("results")
            .cloned()
            .ok_or_else(|| Error::Parse("batch reply missing results".to_string()))?;
        serde_json::from_value(results)
            .map_err(|e| Error::Parse(format!("malformed batch results: {e}")))
    }
}
