// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Engine lifecycle events.
//!
//! A lossy broadcast bus: emission never blocks the control plane, and a
//! subscriber that falls behind misses events (counted) rather than
//! stalling producers.

use crate::error::ErrorObject;
use crate::metrics_constants::METRIC_EVENTS_DROPPED_TOTAL;
use prometheus::Counter;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tokio::sync::broadcast;

static DROPPED: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_EVENTS_DROPPED_TOTAL,
        "Lifecycle events dropped by lagging subscribers",
    )
});

/// Engine lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A model finished loading
    ModelLoaded {
        /// Model id
        model_id: String,
        /// Load duration in milliseconds
        duration_ms: u64,
    },
    /// A model was unloaded
    ModelUnloaded {
        /// Model id
        model_id: String,
    },
    /// Worker restart invalidated every handle
    ModelInvalidated {
        /// Ids that were invalidated
        model_ids: Vec<String>,
    },
    /// A generation stream was admitted and started
    GenerationStarted {
        /// Worker stream id
        stream_id: String,
        /// Model id
        model_id: String,
    },
    /// A generation reached a terminal state
    GenerationCompleted {
        /// Worker stream id
        stream_id: String,
        /// Terminal reason (`stop`, `length`, `cancelled`, `error`)
        finish_reason: String,
    },
    /// An error was surfaced to a caller
    Error {
        /// Stable code and message
        error: ErrorObject,
    },
    /// Worker runtime status changed
    RuntimeStatus {
        /// `starting`, `ready`, `restarting`, `stopped`
        status: String,
        /// Restarts so far
        restart_count: u32,
    },
}

/// The event bus.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Never blocks; without subscribers this is a no-op.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Record a subscriber lag (called by consumers that observe
    /// `RecvError::Lagged`).
    pub fn record_lag(skipped: u64) {
        DROPPED.inc_by(skipped as f64);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::ModelLoaded {
            model_id: "llama-7b".to_string(),
            duration_ms: 1200,
        });
        match rx.recv().await.unwrap() {
            EngineEvent::ModelLoaded { model_id, .. } => assert_eq!(model_id, "llama-7b"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.emit(EngineEvent::ModelUnloaded {
            model_id: "m".to_string(),
        });
    }

    #[test]
    fn test_event_serialization_tags() {
        let event = EngineEvent::GenerationCompleted {
            stream_id: "s-1".to_string(),
            finish_reason: "stop".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"generation_completed\""));
    }
}
