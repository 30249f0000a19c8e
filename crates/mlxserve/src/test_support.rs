// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Scripted Worker Runtime for tests.
//!
//! `MockWorker` implements [`WorkerTransport`] in-process: it records
//! every call, answers with plausible defaults (overridable per
//! method), can be scripted to fail N times, and emits stream events
//! for `generate` the way a real worker would.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use crate::error::{Error, ErrorObject, Result};
use crate::protocol::{methods, StreamEvent, StreamEventKind};
use crate::transport::{WorkerStatus, WorkerTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

struct FailScript {
    remaining: u32,
    error: ErrorObject,
}

/// In-process scripted worker.
pub struct MockWorker {
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Value>>,
    failures: Mutex<HashMap<String, FailScript>>,
    delay: Mutex<Option<Duration>>,
    generation_script: Mutex<Vec<String>>,
    next_stream: AtomicU64,
    events: broadcast::Sender<StreamEvent>,
    status: watch::Sender<WorkerStatus>,
    restarts: AtomicU64,
}

impl MockWorker {
    /// A worker with default replies and a two-token generation script.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(4096);
        let (status, _) = watch::channel(WorkerStatus::Ready);
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delay: Mutex::new(None),
            generation_script: Mutex::new(vec!["Hello".to_string(), ", world".to_string()]),
            next_stream: AtomicU64::new(1),
            events,
            status,
            restarts: AtomicU64::new(0),
        })
    }

    /// Override the reply for a method.
    pub fn set_response(&self, method: &str, value: Value) {
        self.responses.lock().insert(method.to_string(), value);
    }

    /// Fail the next `times` calls of `method` with `error`.
    pub fn fail_times(&self, method: &str, times: u32, error: Error) {
        self.failures.lock().insert(
            method.to_string(),
            FailScript {
                remaining: times,
                error: ErrorObject::from(&error),
            },
        );
    }

    /// Delay every reply (timeout tests).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Tokens emitted for each `generate`.
    pub fn script_generation(&self, tokens: Vec<&str>) {
        *self.generation_script.lock() = tokens.into_iter().map(String::from).collect();
    }

    /// All recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Calls recorded for one method.
    #[must_use]
    pub fn calls_for(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|(m, _)| m == method).count()
    }

    /// Total calls recorded.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Emit a raw token event.
    pub fn emit_token(&self, stream_id: &str, token: &str, is_final: bool) {
        let _ = self.events.send(StreamEvent {
            stream_id: stream_id.to_string(),
            kind: StreamEventKind::Token,
            payload: json!({"token": token, "is_final": is_final}),
        });
    }

    /// Emit a terminal completion event.
    pub fn emit_completed(&self, stream_id: &str, finish_reason: &str) {
        let _ = self.events.send(StreamEvent {
            stream_id: stream_id.to_string(),
            kind: StreamEventKind::Completed,
            payload: json!({"finish_reason": finish_reason, "is_final": true}),
        });
    }

    /// Emit a terminal error event.
    pub fn emit_stream_error(&self, stream_id: &str, code: &str, message: &str) {
        let _ = self.events.send(StreamEvent {
            stream_id: stream_id.to_string(),
            kind: StreamEventKind::Error,
            payload: json!({"code": code, "message": message}),
        });
    }

    /// Simulate a worker crash/restart cycle: bumps the restart count
    /// and walks status through restarting → ready.
    pub fn simulate_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let _ = self.status.send(WorkerStatus::Restarting);
        let _ = self.status.send(WorkerStatus::Ready);
    }

    fn default_response(&self, method: &str, params: &Value) -> Value {
        match method {
            methods::PING => json!({}),
            methods::LOAD_MODEL => json!({
                "context_length": 8192,
                "tokenizer": {"type": "bpe", "vocab_size": 32000},
                "metadata": {
                    "parameter_count": 7.0,
                    "dtype": "float16",
                    "architecture": "llama"
                }
            }),
            methods::UNLOAD_MODEL => json!({}),
            methods::TOKENIZE => {
                let text = params["text"].as_str().unwrap_or_default();
                let count = text.split_whitespace().count().max(1) as u32;
                let tokens: Vec<u32> = (0..count).collect();
                json!({"tokens": tokens, "count": count})
            }
            methods::DETOKENIZE => json!({"text": params["tokens"].to_string()}),
            methods::BATCH_TOKENIZE => {
                let entries = params["entries"].as_array().cloned().unwrap_or_default();
                let results: Vec<Value> = entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| {
                        json!({
                            "success": true,
                            "result": {"index": i, "entry": entry, "tokens": [1, 2, 3]}
                        })
                    })
                    .collect();
                json!({"results": results})
            }
            methods::BATCH_CHECK_DRAFT => {
                let entries = params["entries"].as_array().cloned().unwrap_or_default();
                let results: Vec<Value> = entries
                    .iter()
                    .map(|_| json!({"success": true, "result": {"compatible": true}}))
                    .collect();
                json!({"results": results})
            }
            methods::CHECK_DRAFT => json!({"compatible": true, "reason": null}),
            methods::GENERATE => {
                let stream_id = format!("stream-{}", self.next_stream.fetch_add(1, Ordering::SeqCst));
                // Emit the scripted tokens asynchronously, the way a
                // real worker streams after acking the request. An
                // empty script means the test drives events itself.
                let tokens = self.generation_script.lock().clone();
                if !tokens.is_empty() {
                    let events = self.events.clone();
                    let sid = stream_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        let count = tokens.len();
                        for (i, token) in tokens.into_iter().enumerate() {
                            let _ = events.send(StreamEvent {
                                stream_id: sid.clone(),
                                kind: StreamEventKind::Token,
                                payload: json!({"token": token, "is_final": i + 1 == count}),
                            });
                        }
                        let _ = events.send(StreamEvent {
                            stream_id: sid.clone(),
                            kind: StreamEventKind::Completed,
                            payload: json!({"finish_reason": "stop", "is_final": true}),
                        });
                    });
                }
                json!({"stream_id": stream_id})
            }
            methods::CANCEL_STREAM => json!({}),
            _ => json!({}),
        }
    }
}

#[async_trait]
impl WorkerTransport for MockWorker {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock();
            if let Some(script) = failures.get_mut(method) {
                if script.remaining > 0 {
                    script.remaining -= 1;
                    let err = Error::from(script.error.clone());
                    self.calls.lock().push((method.to_string(), params));
                    return Err(err);
                }
            }
        }

        self.calls.lock().push((method.to_string(), params.clone()));
        if let Some(scripted) = self.responses.lock().get(method) {
            return Ok(scripted.clone());
        }
        Ok(self.default_response(method, &params))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst) as u32
    }

    async fn shutdown(&self) {
        let _ = self.status.send(WorkerStatus::Stopped);
    }
}
