// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Wire protocol between the control plane and the Worker Runtime.
//!
//! One JSON object per line in each direction. Requests carry a `u64` id
//! for correlation; the worker replies with either `result` or `error`.
//! Asynchronous stream events carry a `stream_id` instead of an id and
//! are fanned out to the stream registry in arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Worker methods the control plane dispatches.
pub mod methods {
    /// Load a model into the worker.
    pub const LOAD_MODEL: &str = "load_model";
    /// Unload a model from the worker.
    pub const UNLOAD_MODEL: &str = "unload_model";
    /// Tokenize a single text.
    pub const TOKENIZE: &str = "tokenize";
    /// Tokenize a batch of texts in one call.
    pub const BATCH_TOKENIZE: &str = "batch_tokenize";
    /// Detokenize a token sequence back to text.
    pub const DETOKENIZE: &str = "detokenize";
    /// Start a generation; the reply carries the worker-chosen stream id.
    pub const GENERATE: &str = "generate";
    /// Check draft-model compatibility for speculative decoding.
    pub const CHECK_DRAFT: &str = "check_draft";
    /// Check a batch of draft-model pairs in one call.
    pub const BATCH_CHECK_DRAFT: &str = "batch_check_draft";
    /// Cancel an in-flight generation stream.
    pub const CANCEL_STREAM: &str = "cancel_stream";
    /// Liveness probe.
    pub const PING: &str = "ping";
}

/// Parameters of a `generate` dispatch. The deterministic subset
/// (model, prompt, sampling controls, seed) drives the dedup fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Target model id
    pub model_id: String,
    /// Prompt text
    pub prompt: String,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Token budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// RNG seed; identical seeds make generations deterministic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Base64 image payloads for vision models
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Caller tenant for QoS attribution and stream budgets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl GenerateParams {
    /// Minimal params for `model_id` and `prompt`.
    #[must_use]
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            temperature: None,
            top_p: None,
            top_k: None,
            max_tokens: None,
            seed: None,
            images: Vec::new(),
            tenant_id: None,
        }
    }
}

/// A framed request to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Correlation id, unique per transport lifetime
    pub id: u64,
    /// Method name (see [`methods`])
    pub method: String,
    /// Method parameters
    pub params: Value,
}

/// A framed reply from the worker. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Correlation id echoing the request
    pub id: u64,
    /// Success payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Application error payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Worker-reported application error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error code (mapped onto the crate taxonomy)
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Optional structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Kind discriminator for stream events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    /// A produced token
    Token,
    /// Periodic generation statistics
    Stats,
    /// Terminal: generation finished
    Completed,
    /// Terminal: generation failed
    Error,
}

/// An asynchronous per-stream event from the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Worker-chosen stream id
    pub stream_id: String,
    /// Event kind
    pub kind: StreamEventKind,
    /// Kind-specific payload
    #[serde(default)]
    pub payload: Value,
}

/// Token payload inside a `stream.token` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Token text
    pub token: String,
    /// Vocabulary id, when the worker reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<u32>,
    /// Log probability, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprob: Option<f64>,
    /// Whether this is the final token of the stream
    #[serde(default)]
    pub is_final: bool,
    /// Full text accumulated so far, when the worker reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cumulative_text: Option<String>,
}

/// Completion payload inside a `stream.completed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPayload {
    /// Why generation stopped (`stop`, `length`, `cancelled`, ...)
    pub finish_reason: String,
    /// Always true; terminal events close the stream
    #[serde(default = "default_true")]
    pub is_final: bool,
}

fn default_true() -> bool {
    true
}

/// A frame read off the worker's stdout: either a correlated reply or an
/// asynchronous stream event.
#[derive(Debug, Clone)]
pub enum WorkerFrame {
    /// Reply to a pending request
    Response(WorkerResponse),
    /// Stream event for the registry
    Event(StreamEvent),
}

impl WorkerFrame {
    /// Classify a decoded JSON value. Frames with an `id` are replies;
    /// frames with a `stream_id` are events. Anything else is a protocol
    /// violation handled by the caller.
    #[must_use]
    pub fn classify(value: &Value) -> Option<&'static str> {
        if value.get("id").is_some() {
            Some("response")
        } else if value.get("stream_id").is_some() {
            Some("event")
        } else {
            None
        }
    }
}
