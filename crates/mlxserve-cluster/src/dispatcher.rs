// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Controller-side request dispatch.
//!
//! Routes requests to workers over the bus with per-worker circuit
//! breakers, TTL session affinity, and bounded cross-worker retries.
//! Retries apply only to worker-scoped transient failures
//! (timeout/unavailable/overloaded) on idempotent methods; `generate`
//! never retries on a second worker.

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::protocol::{subjects, ClusterReply, ClusterRequest, ControlCommand, Heartbeat, Registration, StreamEnvelope};
use crate::registry::WorkerRegistry;
use crate::routing::{Router, RoutingStrategy};
use dashmap::DashMap;
use mlxserve::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session affinity tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionAffinityConfig {
    /// Pin sessions to the worker that served them last
    pub enabled: bool,
    /// Pin lifetime
    pub ttl_ms: u64,
}

impl Default for SessionAffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 600_000,
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Reply budget per dispatch
    pub request_timeout_ms: u64,
    /// Routing strategy
    pub strategy: RoutingStrategy,
    /// Dispatch attempts across distinct workers (idempotent methods)
    pub max_attempts: u32,
    /// Session affinity tuning
    pub session_affinity: SessionAffinityConfig,
    /// Per-worker breaker tuning
    pub circuit_breaker: CircuitBreakerConfig,
    /// Affinity map cleanup interval
    pub affinity_cleanup_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            strategy: RoutingStrategy::LeastLoaded,
            max_attempts: 3,
            session_affinity: SessionAffinityConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            affinity_cleanup_interval_ms: 30_000,
        }
    }
}

struct AffinityPin {
    worker_id: String,
    expires_at: Instant,
}

/// The controller dispatcher.
pub struct ClusterDispatcher {
    bus: Arc<dyn MessageBus>,
    registry: Arc<WorkerRegistry>,
    router: Router,
    config: DispatcherConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    affinity: DashMap<String, AffinityPin>,
}

impl ClusterDispatcher {
    /// Build a dispatcher over a bus and registry.
    #[must_use]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<WorkerRegistry>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            router: Router::new(config.strategy),
            bus,
            registry,
            breakers: DashMap::new(),
            affinity: DashMap::new(),
            config,
        })
    }

    /// Spawn discovery plumbing: registration and heartbeat listeners,
    /// the offline sweep, and affinity cleanup.
    ///
    /// # Errors
    ///
    /// `Bus` when the discovery subjects cannot be subscribed.
    pub async fn spawn_discovery(
        self: &Arc<Self>,
        offline_sweep_interval: Duration,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut tasks = Vec::new();

        let mut registrations = self.bus.subscribe(subjects::REGISTER).await?;
        let registry = Arc::clone(&self.registry);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = registrations.recv().await {
                match serde_json::from_slice::<Registration>(&message.payload) {
                    Ok(registration) => registry.register(registration),
                    Err(e) => warn!(error = %e, "Malformed registration"),
                }
            }
        }));

        let mut heartbeats = self.bus.subscribe(subjects::HEARTBEAT).await?;
        let registry = Arc::clone(&self.registry);
        tasks.push(tokio::spawn(async move {
            while let Some(message) = heartbeats.recv().await {
                match serde_json::from_slice::<Heartbeat>(&message.payload) {
                    Ok(heartbeat) => registry.heartbeat(&heartbeat),
                    Err(e) => warn!(error = %e, "Malformed heartbeat"),
                }
            }
        }));

        let registry = Arc::clone(&self.registry);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(offline_sweep_interval.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_offline();
            }
        }));

        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let interval =
                Duration::from_millis(dispatcher.config.affinity_cleanup_interval_ms.max(10));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                dispatcher.affinity.retain(|_, pin| pin.expires_at > now);
            }
        }));

        Ok(tasks)
    }

    /// Dispatch a request, retrying transient worker failures on a
    /// different worker for idempotent methods.
    ///
    /// # Errors
    ///
    /// `NoWorkerAvailable` when no online worker can serve the model;
    /// the last worker failure once attempts are exhausted; the relayed
    /// engine error otherwise.
    pub async fn dispatch(
        &self,
        method: &str,
        params: Value,
        model_id: Option<&str>,
        session_id: Option<&str>,
        priority: u8,
    ) -> Result<Value> {
        let idempotent = method != "generate";
        let max_attempts = if idempotent {
            self.config.max_attempts.max(1)
        } else {
            1
        };

        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_err: Option<Error> = None;

        for attempt in 1..=max_attempts {
            let Some(worker_id) = self.select_worker(model_id, session_id, &excluded) else {
                return Err(last_err.unwrap_or_else(|| {
                    Error::NoWorkerAvailable(
                        model_id.unwrap_or("any model").to_string(),
                    )
                }));
            };

            match self
                .dispatch_to(&worker_id, method, params.clone(), session_id, priority, None)
                .await
            {
                Ok(value) => {
                    self.pin_session(session_id, &worker_id);
                    return Ok(value);
                }
                Err(err) if err.is_worker_retryable() && attempt < max_attempts => {
                    warn!(
                        worker_id = %worker_id,
                        attempt,
                        error = %err,
                        "Worker failed; retrying on another"
                    );
                    excluded.insert(worker_id);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::NoWorkerAvailable("exhausted".to_string())))
    }

    /// Dispatch a streaming generation. Returns the relayed stream
    /// events; the channel closes after the terminal event.
    ///
    /// # Errors
    ///
    /// As [`ClusterDispatcher::dispatch`]; streaming never retries on a
    /// second worker.
    pub async fn dispatch_stream(
        self: &Arc<Self>,
        params: Value,
        model_id: Option<&str>,
        session_id: Option<&str>,
        priority: u8,
    ) -> Result<mpsc::Receiver<StreamEnvelope>> {
        let Some(worker_id) = self.select_worker(model_id, session_id, &HashSet::new()) else {
            return Err(Error::NoWorkerAvailable(
                model_id.unwrap_or("any model").to_string(),
            ));
        };

        let request_id = Uuid::new_v4();
        let stream_subject = subjects::stream(&request_id);
        let mut events = self.bus.subscribe(&stream_subject).await?;
        let (tx, rx) = mpsc::channel(256);

        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                match serde_json::from_slice::<StreamEnvelope>(&message.payload) {
                    Ok(envelope) => {
                        let terminal = matches!(
                            envelope.event.kind,
                            mlxserve::protocol::StreamEventKind::Completed
                                | mlxserve::protocol::StreamEventKind::Error
                        );
                        if forward_tx.send(envelope).await.is_err() {
                            return;
                        }
                        if terminal {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "Malformed stream envelope"),
                }
            }
        });

        // The worker's reply arrives after the terminal event; events
        // flow to the caller while the dispatch is in flight. A
        // dispatch failure is surfaced as a synthetic terminal error
        // envelope.
        self.pin_session(session_id, &worker_id);
        let session = session_id.map(String::from);
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = dispatcher
                .dispatch_to(
                    &worker_id,
                    "generate",
                    params,
                    session.as_deref(),
                    priority,
                    Some((request_id, stream_subject)),
                )
                .await
            {
                let _ = tx
                    .send(StreamEnvelope {
                        request_id,
                        event: mlxserve::protocol::StreamEvent {
                            stream_id: request_id.to_string(),
                            kind: mlxserve::protocol::StreamEventKind::Error,
                            payload: serde_json::json!({
                                "code": "TRANSPORT_ERROR",
                                "message": err.to_string(),
                            }),
                        },
                    })
                    .await;
            }
        });
        Ok(rx)
    }

    /// Instruct a worker to pre-load models.
    ///
    /// # Errors
    ///
    /// `Bus` on publish failure.
    pub async fn prewarm(&self, worker_id: &str, models: Vec<String>) -> Result<()> {
        let command = ControlCommand::Prewarm { models };
        self.bus
            .publish(
                &subjects::worker_control(worker_id),
                serde_json::to_vec(&command)?,
            )
            .await
    }

    fn select_worker(
        &self,
        model_id: Option<&str>,
        session_id: Option<&str>,
        excluded: &HashSet<String>,
    ) -> Option<String> {
        let candidates: Vec<_> = self
            .registry
            .online_workers(model_id)
            .into_iter()
            .filter(|w| !excluded.contains(&w.worker_id))
            .filter(|w| self.breaker(&w.worker_id).state() != CircuitState::Open)
            .collect();

        // Affinity wins when the pinned worker is still a candidate.
        if self.config.session_affinity.enabled {
            if let Some(session) = session_id {
                if let Some(pin) = self.affinity.get(session) {
                    if pin.expires_at > Instant::now()
                        && candidates.iter().any(|w| w.worker_id == pin.worker_id)
                    {
                        return Some(pin.worker_id.clone());
                    }
                }
            }
        }
        self.router.pick(&candidates, session_id)
    }

    async fn dispatch_to(
        &self,
        worker_id: &str,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        priority: u8,
        stream: Option<(Uuid, String)>,
    ) -> Result<Value> {
        let breaker = self.breaker(worker_id);
        let permit = breaker
            .try_acquire()
            .map_err(|e| Error::WorkerUnavailable(e.to_string()))?;

        let (request_id, stream_subject) = match stream {
            Some((id, subject)) => (id, Some(subject)),
            None => (Uuid::new_v4(), None),
        };
        let reply_subject = subjects::reply(&request_id);
        let mut replies = self.bus.subscribe(&reply_subject).await?;

        let request = ClusterRequest {
            request_id,
            method: method.to_string(),
            params,
            priority,
            session_id: session_id.map(String::from),
            reply_subject,
            stream_subject,
        };
        debug!(worker_id, method, request_id = %request_id, "Dispatching to worker");
        self.bus
            .publish(
                &subjects::worker_requests(worker_id),
                serde_json::to_vec(&request)?,
            )
            .await?;
        self.registry.adjust_active(worker_id, 1);

        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let Some(message) = replies.recv().await else {
                    return Err(Error::Bus("reply subscription closed".to_string()));
                };
                match serde_json::from_slice::<ClusterReply>(&message.payload) {
                    Ok(reply) if reply.request_id == request_id => return Ok(reply),
                    Ok(_) => continue,
                    Err(e) => return Err(Error::Protocol(format!("malformed reply: {e}"))),
                }
            }
        })
        .await;
        self.registry.adjust_active(worker_id, -1);

        match outcome {
            Ok(Ok(reply)) => {
                self.registry
                    .record_latency(worker_id, started.elapsed().as_secs_f64() * 1000.0);
                match (reply.result, reply.error) {
                    (Some(value), None) => {
                        breaker.record_success(permit);
                        Ok(value)
                    }
                    (_, Some(error)) => {
                        if reply.retryable {
                            breaker.record_failure(permit);
                            Err(Error::WorkerOverloaded(format!(
                                "{worker_id}: {error}"
                            )))
                        } else {
                            // The worker answered; the request itself
                            // failed. That is not worker ill-health.
                            breaker.record_success(permit);
                            Err(Error::Engine(mlxserve::Error::from(error)))
                        }
                    }
                    (None, None) => {
                        breaker.record_success(permit);
                        Ok(Value::Null)
                    }
                }
            }
            Ok(Err(err)) => {
                breaker.record_failure(permit);
                Err(err)
            }
            Err(_) => {
                breaker.record_failure(permit);
                Err(Error::WorkerTimeout {
                    worker_id: worker_id.to_string(),
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn pin_session(&self, session_id: Option<&str>, worker_id: &str) {
        if !self.config.session_affinity.enabled {
            return;
        }
        let Some(session) = session_id else { return };
        self.affinity.insert(
            session.to_string(),
            AffinityPin {
                worker_id: worker_id.to_string(),
                expires_at: Instant::now()
                    + Duration::from_millis(self.config.session_affinity.ttl_ms),
            },
        );
        info!(session, worker_id, "Session pinned");
    }

    fn breaker(&self, worker_id: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("worker/{worker_id}"),
                    self.config.circuit_breaker.clone(),
                ))
            })
            .clone()
    }
}
