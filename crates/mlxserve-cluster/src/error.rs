// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for cluster dispatch.

use thiserror::Error;

/// Error types for controller/worker cluster operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// No online worker can serve the request
    #[error("No worker available: {0}")]
    NoWorkerAvailable(String),

    /// The selected worker did not reply within the budget
    #[error("Worker timeout: {worker_id} after {elapsed_ms}ms")]
    WorkerTimeout {
        /// Worker that timed out
        worker_id: String,
        /// Elapsed wall clock in milliseconds
        elapsed_ms: u64,
    },

    /// The selected worker is rejecting work (queue full, hard memory
    /// limit)
    #[error("Worker overloaded: {0}")]
    WorkerOverloaded(String),

    /// The worker went offline mid-request
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Bus publish/subscribe failure
    #[error("Bus error: {0}")]
    Bus(String),

    /// Requested bus mode is not available in this build
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Malformed cluster message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Engine-level error relayed from a worker
    #[error(transparent)]
    Engine(#[from] mlxserve::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether dispatch may retry this failure on a different worker.
    /// Only worker-scoped transient failures qualify, and only for
    /// idempotent methods.
    #[must_use]
    pub fn is_worker_retryable(&self) -> bool {
        matches!(
            self,
            Error::WorkerTimeout { .. }
                | Error::WorkerUnavailable(_)
                | Error::WorkerOverloaded(_)
        )
    }
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
