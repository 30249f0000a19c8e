// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Worker registry: discovery, heartbeats, liveness.
//!
//! Workers announce themselves on startup and heartbeat periodically;
//! the controller marks a worker offline once
//! `now - last_heartbeat > offline_timeout` and routing skips anything
//! not online.

use crate::protocol::{Heartbeat, Registration};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Exponential moving average weight for latency samples.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Worker liveness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Accepting work
    Online,
    /// Finishing in-flight work, accepting nothing new
    Draining,
    /// Missed heartbeats past the timeout
    Offline,
}

/// A registered worker's routable view.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    /// Stable worker id
    pub worker_id: String,
    /// Host the worker runs on
    pub hostname: String,
    /// Models the worker can serve
    pub available_models: Vec<String>,
    /// Liveness state
    pub state: WorkerState,
    /// Requests currently executing
    pub active_requests: usize,
    /// Concurrent requests the worker accepts
    pub capacity: usize,
    /// Smoothed observed latency in milliseconds
    pub latency_ema_ms: f64,
}

struct WorkerEntry {
    registration: Registration,
    state: WorkerState,
    last_heartbeat: Instant,
    active_requests: usize,
    latency_ema_ms: f64,
}

/// The controller's worker registry.
pub struct WorkerRegistry {
    offline_timeout: Duration,
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    /// Create a registry with the given offline timeout.
    #[must_use]
    pub fn new(offline_timeout: Duration) -> Self {
        Self {
            offline_timeout,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or re-register) a worker. Re-registration refreshes
    /// the model list and resets liveness.
    pub fn register(&self, registration: Registration) {
        let mut workers = self.workers.write();
        let worker_id = registration.worker_id.clone();
        info!(
            worker_id = %worker_id,
            models = registration.available_models.len(),
            "Worker registered"
        );
        workers.insert(
            worker_id,
            WorkerEntry {
                registration,
                state: WorkerState::Online,
                last_heartbeat: Instant::now(),
                active_requests: 0,
                latency_ema_ms: 0.0,
            },
        );
    }

    /// Apply a heartbeat. Unknown workers are ignored until they
    /// register.
    pub fn heartbeat(&self, heartbeat: &Heartbeat) {
        let mut workers = self.workers.write();
        let Some(entry) = workers.get_mut(&heartbeat.worker_id) else {
            debug!(worker_id = %heartbeat.worker_id, "Heartbeat from unregistered worker");
            return;
        };
        entry.last_heartbeat = Instant::now();
        entry.active_requests = heartbeat.active_requests;
        entry.state = if heartbeat.draining {
            WorkerState::Draining
        } else {
            WorkerState::Online
        };
    }

    /// Record an observed request latency for a worker.
    pub fn record_latency(&self, worker_id: &str, latency_ms: f64) {
        let mut workers = self.workers.write();
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.latency_ema_ms = if entry.latency_ema_ms == 0.0 {
                latency_ms
            } else {
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * entry.latency_ema_ms
            };
        }
    }

    /// Adjust a worker's in-flight count from the controller's view.
    pub fn adjust_active(&self, worker_id: &str, delta: i64) {
        let mut workers = self.workers.write();
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.active_requests = entry
                .active_requests
                .saturating_add_signed(delta as isize);
        }
    }

    /// Sweep workers past the offline timeout. Returns newly-offline
    /// ids.
    pub fn sweep_offline(&self) -> Vec<String> {
        let mut workers = self.workers.write();
        let mut newly_offline = Vec::new();
        for (worker_id, entry) in workers.iter_mut() {
            if entry.state != WorkerState::Offline
                && entry.last_heartbeat.elapsed() > self.offline_timeout
            {
                entry.state = WorkerState::Offline;
                newly_offline.push(worker_id.clone());
                warn!(worker_id = %worker_id, "Worker marked offline");
            }
        }
        newly_offline
    }

    /// Remove a worker entirely.
    pub fn remove(&self, worker_id: &str) {
        self.workers.write().remove(worker_id);
    }

    /// Snapshot every worker.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read();
        workers
            .values()
            .map(|entry| WorkerSnapshot {
                worker_id: entry.registration.worker_id.clone(),
                hostname: entry.registration.hostname.clone(),
                available_models: entry.registration.available_models.clone(),
                state: entry.state,
                active_requests: entry.active_requests,
                capacity: entry.registration.capacity.max(1),
                latency_ema_ms: entry.latency_ema_ms,
            })
            .collect()
    }

    /// Online workers, optionally filtered to those hosting a model.
    #[must_use]
    pub fn online_workers(&self, model_id: Option<&str>) -> Vec<WorkerSnapshot> {
        self.workers()
            .into_iter()
            .filter(|w| w.state == WorkerState::Online)
            .filter(|w| {
                model_id.map_or(true, |model| {
                    w.available_models.iter().any(|m| m == model)
                })
            })
            .collect()
    }
}
