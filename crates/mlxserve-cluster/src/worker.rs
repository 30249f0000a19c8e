// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Worker role: serve cluster requests against the local engine.
//!
//! A worker registers on startup, heartbeats periodically, pre-warms
//! configured models, and executes routed requests. Admission is
//! guarded twice: a bounded request window (capacity + queue depth)
//! and an estimated-memory guard (soft limit rejects LOW/BACKGROUND
//! work, hard limit rejects everything). Rejections are marked
//! retryable so the controller reroutes them.

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::protocol::{
    subjects, ClusterReply, ClusterRequest, ControlCommand, Heartbeat, Registration,
    StreamEnvelope,
};
use futures::StreamExt;
use mlxserve::engine::{Engine, GenerationOptions};
use mlxserve::models::ModelDescriptor;
use mlxserve::protocol::{GenerateParams, StreamEvent, StreamEventKind};
use mlxserve::scheduler::Priority;
use mlxserve::streams::StreamChunk;
use mlxserve::ErrorObject;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bytes-per-parameter estimate for fp16 resident weights, in MB per
/// billion parameters.
const MB_PER_BILLION_PARAMS: f64 = 2048.0;

/// Worker role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerNodeConfig {
    /// Stable worker id
    pub worker_id: String,
    /// Advertised hostname
    pub hostname: String,
    /// Concurrent requests accepted
    pub capacity: usize,
    /// Queued requests tolerated beyond capacity
    pub queue_depth: usize,
    /// Heartbeat cadence
    pub heartbeat_interval_ms: u64,
    /// Estimated-memory soft limit; beyond it LOW/BACKGROUND work is
    /// rejected
    pub soft_memory_limit_mb: f64,
    /// Estimated-memory hard limit; beyond it all work is rejected
    pub hard_memory_limit_mb: f64,
    /// Models to load before serving
    pub prewarm_models: Vec<String>,
    /// Capability tags advertised in the registration
    pub skills: Vec<String>,
}

impl Default for WorkerNodeConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            hostname: "localhost".to_string(),
            capacity: 8,
            queue_depth: 32,
            heartbeat_interval_ms: 5_000,
            soft_memory_limit_mb: 48_000.0,
            hard_memory_limit_mb: 60_000.0,
            prewarm_models: Vec::new(),
            skills: Vec::new(),
        }
    }
}

/// The worker role.
pub struct WorkerNode {
    config: WorkerNodeConfig,
    engine: Arc<Engine>,
    bus: Arc<dyn MessageBus>,
    active: AtomicUsize,
    draining: AtomicBool,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerNode {
    /// Start serving: pre-warm, register, subscribe, heartbeat.
    ///
    /// # Errors
    ///
    /// `Bus` on subscription failure; engine errors from pre-warming
    /// are logged, not fatal (the model list just shrinks).
    pub async fn start(
        config: WorkerNodeConfig,
        engine: Arc<Engine>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Arc<Self>> {
        let node = Arc::new(Self {
            config,
            engine,
            bus,
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        for model_id in node.config.prewarm_models.clone() {
            match node.engine.load_model(ModelDescriptor::new(&model_id)).await {
                Ok(_) => info!(model_id, "Pre-warmed model"),
                Err(e) => warn!(model_id, error = %e, "Pre-warm load failed"),
            }
        }

        node.publish_registration().await?;
        let request_task = node.spawn_request_loop().await?;
        let control_task = node.spawn_control_loop().await?;
        let heartbeat_task = node.spawn_heartbeat();
        {
            let mut tasks = node.tasks.lock();
            tasks.push(request_task);
            tasks.push(control_task);
            tasks.push(heartbeat_task);
        }
        info!(worker_id = %node.config.worker_id, "Worker node serving");
        Ok(node)
    }

    /// Requests currently executing.
    #[must_use]
    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop taking new work; in-flight requests finish.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        info!(worker_id = %self.config.worker_id, "Worker draining");
    }

    /// Stop serving entirely.
    pub async fn stop(&self) {
        self.drain();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn publish_registration(&self) -> Result<()> {
        let mut models: Vec<String> = self
            .engine
            .list_models()
            .into_iter()
            .map(|h| h.descriptor.id)
            .collect();
        models.sort();
        let registration = Registration {
            worker_id: self.config.worker_id.clone(),
            hostname: self.config.hostname.clone(),
            available_models: models,
            skills: self.config.skills.clone(),
            capacity: self.config.capacity,
        };
        self.bus
            .publish(subjects::REGISTER, serde_json::to_vec(&registration)?)
            .await
    }

    async fn spawn_request_loop(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let subject = subjects::worker_requests(&self.config.worker_id);
        let mut requests = self.bus.subscribe(&subject).await?;
        let node = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = requests.recv().await {
                let request = match serde_json::from_slice::<ClusterRequest>(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Malformed cluster request");
                        continue;
                    }
                };
                if let Some(reject) = node.admission_reject(&request) {
                    node.send_reply(&request.reply_subject, reject).await;
                    continue;
                }
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    node.active.fetch_add(1, Ordering::SeqCst);
                    let reply_subject = request.reply_subject.clone();
                    let reply = node.execute(request).await;
                    node.active.fetch_sub(1, Ordering::SeqCst);
                    node.send_reply(&reply_subject, reply).await;
                });
            }
        }))
    }

    async fn spawn_control_loop(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let subject = subjects::worker_control(&self.config.worker_id);
        let mut commands = self.bus.subscribe(&subject).await?;
        let node = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = commands.recv().await {
                match serde_json::from_slice::<ControlCommand>(&message.payload) {
                    Ok(ControlCommand::Prewarm { models }) => {
                        for model_id in models {
                            match node.engine.load_model(ModelDescriptor::new(&model_id)).await
                            {
                                Ok(_) => info!(model_id, "Pre-warm complete"),
                                Err(e) => warn!(model_id, error = %e, "Pre-warm failed"),
                            }
                        }
                        if let Err(e) = node.publish_registration().await {
                            warn!(error = %e, "Re-registration after pre-warm failed");
                        }
                    }
                    Ok(ControlCommand::Drain) => node.drain(),
                    Err(e) => warn!(error = %e, "Malformed control command"),
                }
            }
        }))
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let node = Arc::clone(self);
        let interval = Duration::from_millis(node.config.heartbeat_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let heartbeat = Heartbeat {
                    worker_id: node.config.worker_id.clone(),
                    active_requests: node.active.load(Ordering::SeqCst),
                    draining: node.draining.load(Ordering::SeqCst),
                };
                match serde_json::to_vec(&heartbeat) {
                    Ok(payload) => {
                        if let Err(e) = node.bus.publish(subjects::HEARTBEAT, payload).await {
                            warn!(error = %e, "Heartbeat publish failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "Heartbeat serialization failed"),
                }
            }
        })
    }

    /// Estimated resident memory from loaded model parameter counts.
    #[must_use]
    pub fn estimated_memory_mb(&self) -> f64 {
        self.engine
            .list_models()
            .iter()
            .map(|h| h.metadata.parameter_count * MB_PER_BILLION_PARAMS)
            .sum()
    }

    fn admission_reject(&self, request: &ClusterRequest) -> Option<ClusterReply> {
        let reject = |message: String| {
            Some(ClusterReply {
                request_id: request.request_id,
                result: None,
                error: Some(ErrorObject::new("OVERLOADED", message)),
                retryable: true,
            })
        };

        if self.draining.load(Ordering::SeqCst) {
            return reject("worker is draining".to_string());
        }
        let active = self.active.load(Ordering::SeqCst);
        if active >= self.config.capacity + self.config.queue_depth {
            return reject(format!("request window full ({active} active)"));
        }

        let memory = self.estimated_memory_mb();
        if memory >= self.config.hard_memory_limit_mb {
            return reject(format!("hard memory limit ({memory:.0} MB estimated)"));
        }
        if memory >= self.config.soft_memory_limit_mb && request.priority >= Priority::Low as u8 {
            return reject(format!(
                "soft memory limit rejects low-priority work ({memory:.0} MB estimated)"
            ));
        }
        None
    }

    async fn execute(&self, request: ClusterRequest) -> ClusterReply {
        let request_id = request.request_id;
        debug!(request_id = %request_id, method = %request.method, "Executing cluster request");
        let outcome = self.execute_method(request).await;
        match outcome {
            Ok(value) => ClusterReply {
                request_id,
                result: Some(value),
                error: None,
                retryable: false,
            },
            Err(err) => {
                let retryable = match &err {
                    Error::Engine(engine_err) => engine_err.is_retryable(),
                    other => other.is_worker_retryable(),
                };
                ClusterReply {
                    request_id,
                    result: None,
                    error: Some(match &err {
                        Error::Engine(engine_err) => ErrorObject::from(engine_err),
                        other => ErrorObject::new("INTERNAL_ERROR", other.to_string()),
                    }),
                    retryable,
                }
            }
        }
    }

    async fn execute_method(&self, request: ClusterRequest) -> Result<Value> {
        let priority = match request.priority {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            _ => Priority::Background,
        };

        match request.method.as_str() {
            "load_model" => {
                let descriptor: ModelDescriptor = serde_json::from_value(request.params)?;
                let handle = self.engine.load_model(descriptor).await?;
                let result = serde_json::to_value(&handle)?;
                // The model list changed; refresh discovery.
                if let Err(e) = self.publish_registration().await {
                    warn!(error = %e, "Re-registration after load failed");
                }
                Ok(result)
            }
            "unload_model" => {
                let model_id = request.params["model_id"]
                    .as_str()
                    .ok_or_else(|| Error::Protocol("unload_model requires model_id".to_string()))?;
                self.engine.unload_model(model_id).await?;
                Ok(json!({}))
            }
            "tokenize" => {
                let model_id = request.params["model_id"]
                    .as_str()
                    .ok_or_else(|| Error::Protocol("tokenize requires model_id".to_string()))?;
                let text = request.params["text"]
                    .as_str()
                    .ok_or_else(|| Error::Protocol("tokenize requires text".to_string()))?;
                let tokens = self.engine.tokenize(model_id, text).await?;
                Ok(json!({"tokens": tokens}))
            }
            "check_draft" => {
                let model_id = request.params["model_id"]
                    .as_str()
                    .ok_or_else(|| Error::Protocol("check_draft requires model_id".to_string()))?;
                let draft = request.params["draft_model_id"].as_str().ok_or_else(|| {
                    Error::Protocol("check_draft requires draft_model_id".to_string())
                })?;
                let compatible = self.engine.is_draft_model_compatible(model_id, draft).await?;
                Ok(json!({"compatible": compatible}))
            }
            "generate" => {
                let params: GenerateParams = serde_json::from_value(request.params)?;
                let options = GenerationOptions {
                    priority,
                    identifier: request.session_id.clone(),
                    ..GenerationOptions::default()
                };
                match request.stream_subject {
                    Some(stream_subject) => {
                        self.generate_streaming(params, options, request.request_id, &stream_subject)
                            .await
                    }
                    None => {
                        let text = self.engine.generate(params, options).await?;
                        Ok(json!({"text": text}))
                    }
                }
            }
            "health" => {
                let health = self.engine.health_check().await;
                Ok(json!({"healthy": health.healthy}))
            }
            other => Err(Error::Engine(mlxserve::Error::MethodNotFound(
                other.to_string(),
            ))),
        }
    }

    /// Run a streaming generation, relaying every chunk to the stream
    /// subject as it is produced; the final reply carries the full text.
    async fn generate_streaming(
        &self,
        params: GenerateParams,
        options: GenerationOptions,
        request_id: uuid::Uuid,
        stream_subject: &str,
    ) -> Result<Value> {
        let mut generation = self
            .engine
            .create_generator(params, GenerationOptions {
                dedupe: false,
                ..options
            })
            .await?;

        let mut text = String::new();
        while let Some(chunk) = generation.next().await {
            let event = match &chunk {
                StreamChunk::Token(token) => {
                    text.push_str(&token.token);
                    StreamEvent {
                        stream_id: request_id.to_string(),
                        kind: StreamEventKind::Token,
                        payload: serde_json::to_value(token)?,
                    }
                }
                StreamChunk::Stats(stats) => StreamEvent {
                    stream_id: request_id.to_string(),
                    kind: StreamEventKind::Stats,
                    payload: stats.clone(),
                },
                StreamChunk::Completed(done) => StreamEvent {
                    stream_id: request_id.to_string(),
                    kind: StreamEventKind::Completed,
                    payload: serde_json::to_value(done)?,
                },
                StreamChunk::Error(err) => StreamEvent {
                    stream_id: request_id.to_string(),
                    kind: StreamEventKind::Error,
                    payload: serde_json::to_value(err)?,
                },
            };
            let envelope = StreamEnvelope { request_id, event };
            self.bus
                .publish(stream_subject, serde_json::to_vec(&envelope)?)
                .await?;
            if let StreamChunk::Error(err) = chunk {
                return Err(Error::Engine(mlxserve::Error::from(err)));
            }
        }
        Ok(json!({"text": text}))
    }

    async fn send_reply(&self, reply_subject: &str, reply: ClusterReply) {
        match serde_json::to_vec(&reply) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(reply_subject, payload).await {
                    warn!(error = %e, "Reply publish failed");
                }
            }
            Err(e) => warn!(error = %e, "Reply serialization failed"),
        }
    }
}
