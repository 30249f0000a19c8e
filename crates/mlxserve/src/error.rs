// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for mlxserve control-plane operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed schema or semantic validation (empty/oversized ids,
    /// path traversal, out-of-range parameters). Never retried.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Per-request wall clock exceeded
    #[error("Timeout after {elapsed_ms}ms: {method} (request {request_id})")]
    Timeout {
        /// Worker method that timed out
        method: String,
        /// Correlation id of the request
        request_id: u64,
        /// Elapsed wall clock in milliseconds
        elapsed_ms: u64,
    },

    /// Explicit cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialized payload exceeded the transport byte cap
    #[error("Buffer overflow: payload of {size} bytes exceeded {limit} bytes")]
    BufferOverflow {
        /// Serialized frame size in bytes
        size: usize,
        /// Configured cap in bytes
        limit: usize,
    },

    /// Rejected locally because the circuit breaker is open
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// IO or framing problem talking to the Worker Runtime
    #[error("Transport error: {0}")]
    Transport(String),

    /// Worker failed to load the model
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Operation referenced a model that is not loaded (possibly
    /// invalidated by a worker restart)
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    /// Application error on the generation hot path
    #[error("Generation error: {0}")]
    Generation(String),

    /// Tokenizer failure from the worker
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Guided/draft decoding failure from the worker
    #[error("Guidance error: {0}")]
    Guidance(String),

    /// Worker reply could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Worker does not implement the requested method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Worker-side internal failure
    #[error("Worker internal error: {0}")]
    Internal(String),

    /// Queue or scheduler rejected admission (at capacity)
    #[error("Overloaded: {0}")]
    Overloaded(String),

    /// Engine is shutting down or already shut down
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// Feature or configuration mode not available in this build
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    ///
    /// Codes are part of the wire surface (stream error chunks, cluster
    /// replies) and must not change between releases.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidParams(_) => "INVALID_PARAMS",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::BufferOverflow { .. } => "BUFFER_OVERFLOW",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::ModelLoad(_) => "MODEL_LOAD_ERROR",
            Error::ModelNotLoaded(_) => "MODEL_NOT_LOADED",
            Error::Generation(_) => "GENERATION_ERROR",
            Error::Tokenizer(_) => "TOKENIZER_ERROR",
            Error::Guidance(_) => "GUIDANCE_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::MethodNotFound(_) => "METHOD_NOT_FOUND",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Overloaded(_) => "OVERLOADED",
            Error::Shutdown(_) => "SHUTDOWN",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "PARSE_ERROR",
        }
    }

    /// Whether a retry of the same operation can reasonably succeed.
    ///
    /// Only transient transport-class failures qualify. Validation,
    /// cancellation, and application errors are terminal; `CircuitOpen`
    /// is terminal locally (the caller may retry after the cooldown, but
    /// the retry loop must not).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Transport(_) | Error::Io(_) | Error::Overloaded(_)
        )
    }

    /// Map a worker-reported error code string onto the taxonomy.
    ///
    /// Unknown codes degrade to `Internal` so new worker-side codes never
    /// break the control plane.
    #[must_use]
    pub fn from_worker_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "INVALID_PARAMS" => Error::InvalidParams(message),
            "TIMEOUT" => Error::Transport(message),
            "MODEL_LOAD_ERROR" => Error::ModelLoad(message),
            "MODEL_NOT_LOADED" => Error::ModelNotLoaded(message),
            "GENERATION_ERROR" => Error::Generation(message),
            "TOKENIZER_ERROR" => Error::Tokenizer(message),
            "GUIDANCE_ERROR" => Error::Guidance(message),
            "METHOD_NOT_FOUND" => Error::MethodNotFound(message),
            "PARSE_ERROR" => Error::Parse(message),
            _ => Error::Internal(message),
        }
    }
}

/// Result type for mlxserve operations
pub type Result<T> = std::result::Result<T, Error>;

/// An error payload safe to share across dedup waiters and event
/// subscribers: carries the stable code and message of the original.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorObject {
    /// Stable code from [`Error::code`]
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Optional structured details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorObject {
    /// Build from any crate error.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }
}

impl From<&Error> for ErrorObject {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            details: None,
        }
    }
}

impl From<ErrorObject> for Error {
    fn from(obj: ErrorObject) -> Self {
        Error::from_worker_code(&obj.code, obj.message)
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
