// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # mlxserve - Local LLM Inference Serving Control Plane
//!
//! A serving runtime for large language models executed by an
//! out-of-process numerics backend (MLX on Apple silicon). The crate is
//! the control plane: it turns heterogeneous generation, tokenization,
//! and model-lifecycle requests from many concurrent callers into
//! efficient dispatches against a small set of expensive, stateful
//! worker processes, with backpressure, fairness, QoS, and fault
//! isolation.
//!
//! ## Architecture
//!
//! ```text
//! caller ──▶ Engine (validate)
//!              │
//!              ├─ CanaryManager      pick variant
//!              ├─ Deduplicator       join identical generations
//!              ├─ TierLimiter        per-model-size concurrency caps
//!              ├─ PriorityScheduler  five levels, aging, fairness
//!              ├─ RequestQueue       FIFO admission window
//!              ├─ Batcher            coalesce tokenize/check_draft
//!              └─ WorkerClient ───▶ Worker Runtime (stdio JSON lines)
//!                     │                   │
//!              CircuitBreaker      stream events
//!                     │                   ▼
//!                 RetryPolicy      StreamRegistry ──▶ TokenStream
//! ```
//!
//! Throughout, the [`qos::QosEngine`] samples latency and outcome
//! metrics and triggers remediation, and all components export
//! Prometheus metrics through the default registry
//! ([`telemetry::render_metrics`]).
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use mlxserve::{Engine, EngineConfig, GenerateParams, ModelDescriptor};
//!
//! # async fn run() -> mlxserve::Result<()> {
//! let engine = Engine::spawn(EngineConfig::default()).await?;
//! engine.load_model(ModelDescriptor::new("mlx-community/Qwen2.5-7B")).await?;
//!
//! // Streaming:
//! use futures::StreamExt;
//! let mut generation = engine
//!     .create_generator(
//!         GenerateParams::new("mlx-community/Qwen2.5-7B", "Write a haiku"),
//!         Default::default(),
//!     )
//!     .await?;
//! while let Some(chunk) = generation.next().await {
//!     // token | stats | terminal
//! }
//!
//! // Or collected:
//! let text = engine
//!     .generate(
//!         GenerateParams::new("mlx-community/Qwen2.5-7B", "Write a haiku"),
//!         Default::default(),
//!     )
//!     .await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod artifact_cache;
pub mod autotuner;
pub mod batcher;
pub mod canary;
pub mod circuit;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod events;
pub mod features;
pub mod limiter;
pub mod metrics_constants;
pub(crate) mod metrics_utils;
pub mod models;
pub mod protocol;
pub mod qos;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod streams;
pub mod tdigest;
pub mod telemetry;
pub mod transport;

#[doc(hidden)]
pub mod test_support;

pub use config::EngineConfig;
pub use engine::{Engine, Generation, GenerationOptions, GenerationOutcome};
pub use error::{Error, ErrorObject, Result};
pub use models::{ModelDescriptor, ModelHandle};
pub use protocol::GenerateParams;
pub use scheduler::Priority;
pub use streams::{StreamChunk, TokenStream};
