// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cluster wire messages and subject naming.
//!
//! Persistent subjects carry request routing; ephemeral subjects carry
//! heartbeats, registrations, replies, and stream events.

use mlxserve::ErrorObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Subject names.
pub mod subjects {
    /// Worker registration announcements.
    pub const REGISTER: &str = "mlxserve.cluster.register";
    /// Periodic worker heartbeats.
    pub const HEARTBEAT: &str = "mlxserve.cluster.heartbeat";

    /// Per-worker request subject (persistent).
    #[must_use]
    pub fn worker_requests(worker_id: &str) -> String {
        format!("mlxserve.worker.{worker_id}.requests")
    }

    /// Per-worker control subject (pre-warming, drain).
    #[must_use]
    pub fn worker_control(worker_id: &str) -> String {
        format!("mlxserve.worker.{worker_id}.control")
    }

    /// Per-request reply subject (ephemeral).
    #[must_use]
    pub fn reply(request_id: &uuid::Uuid) -> String {
        format!("mlxserve.reply.{request_id}")
    }

    /// Per-request stream-event subject (ephemeral).
    #[must_use]
    pub fn stream(request_id: &uuid::Uuid) -> String {
        format!("mlxserve.stream.{request_id}")
    }
}

/// A routed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRequest {
    /// Correlation id
    pub request_id: Uuid,
    /// Engine method name
    pub method: String,
    /// Method parameters
    pub params: Value,
    /// Scheduling priority (0 highest)
    pub priority: u8,
    /// Session id for affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Where the worker publishes the reply
    pub reply_subject: String,
    /// Where the worker publishes stream events (generate only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_subject: Option<String>,
}

/// A worker's reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReply {
    /// Correlation id echoing the request
    pub request_id: Uuid,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    /// Whether the controller may retry elsewhere
    #[serde(default)]
    pub retryable: bool,
}

/// A worker joining the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Stable worker id
    pub worker_id: String,
    /// Host the worker runs on
    pub hostname: String,
    /// Models the worker can serve
    pub available_models: Vec<String>,
    /// Free-form capability tags
    #[serde(default)]
    pub skills: Vec<String>,
    /// Concurrent requests the worker accepts
    pub capacity: usize,
}

/// Periodic liveness + load report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Worker id
    pub worker_id: String,
    /// Requests currently executing
    pub active_requests: usize,
    /// Whether the worker is draining (no new work)
    #[serde(default)]
    pub draining: bool,
}

/// A stream event relayed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Correlation id
    pub request_id: Uuid,
    /// The relayed event
    pub event: mlxserve::protocol::StreamEvent,
}

/// Control commands from controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Load these models ahead of traffic
    Prewarm {
        /// Model ids to load
        models: Vec<String>,
    },
    /// Stop accepting new work
    Drain,
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subject_naming() {
        assert_eq!(
            subjects::worker_requests("w-1"),
            "mlxserve.worker.w-1.requests"
        );
        let id = Uuid::nil();
        assert!(subjects::reply(&id).starts_with("mlxserve.reply."));
        assert!(subjects::stream(&id).starts_with("mlxserve.stream."));
    }

    #[test]
    fn test_request_round_trip() {
        let request = ClusterRequest {
            request_id: Uuid::new_v4(),
            method: "tokenize".to_string(),
            params: json!({"text": "hi"}),
            priority: 2,
            session_id: Some("session-1".to_string()),
            reply_subject: "mlxserve.reply.x".to_string(),
            stream_subject: None,
        };
        let bytes = serde_json::to_vec(&request).unwrap();
        let parsed: ClusterRequest = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.request_id, request.request_id);
        assert_eq!(parsed.method, "tokenize");
    }

    #[test]
    fn test_control_command_tagging() {
        let command = ControlCommand::Prewarm {
            models: vec!["llama-7b".to_string()],
        };
        let json = serde_json::to_string(&command).unwrap();
        assert!(json.contains("\"command\":\"prewarm\""));
    }
}
