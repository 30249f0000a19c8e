// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # mlxserve-cluster - Horizontal Fan-Out
//!
//! Controller/worker fan-out for mlxserve over a pub/sub message bus.
//! The controller keeps a worker registry fed by registrations and
//! heartbeats, routes requests by strategy (round-robin, least-loaded,
//! latency-aware, consistent-hash), guards each worker with a circuit
//! breaker, and pins sessions with a TTL affinity map. Workers run the
//! ordinary single-node engine and stream generation events back over
//! ephemeral subjects.
//!
//! ```text
//! caller ─▶ ClusterDispatcher ──(bus)──▶ WorkerNode ─▶ Engine ─▶ Worker Runtime
//!               │  ▲                        │
//!        WorkerRegistry ◀── heartbeats ─────┘
//! ```

pub mod bus;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use bus::{build_bus, BusConfig, BusMode, EmbeddedBus, MessageBus};
pub use dispatcher::{ClusterDispatcher, DispatcherConfig, SessionAffinityConfig};
pub use error::{Error, Result};
pub use registry::{WorkerRegistry, WorkerSnapshot, WorkerState};
pub use routing::{Router, RoutingStrategy};
pub use worker::{WorkerNode, WorkerNodeConfig};

/// Which roles this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Route requests to workers
    Controller,
    /// Serve routed requests
    Worker,
    /// Both roles in one process (embedded bus deployments)
    Both,
}

/// Discovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Worker heartbeat cadence
    pub heartbeat_interval_ms: u64,
    /// Silence after which a worker is offline
    pub offline_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            offline_timeout_ms: 15_000,
        }
    }
}

/// Top-level cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Role selection
    pub mode: ClusterMode,
    /// Bus deployment
    pub bus: BusConfig,
    /// Discovery tuning
    pub discovery: DiscoveryConfig,
    /// Controller dispatch tuning
    pub dispatcher: DispatcherConfig,
    /// Worker role tuning
    pub worker: WorkerNodeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::Both,
            bus: BusConfig::default(),
            discovery: DiscoveryConfig::default(),
            dispatcher: DispatcherConfig::default(),
            worker: WorkerNodeConfig::default(),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roles() {
        let config = ClusterConfig::default();
        assert_eq!(config.mode, ClusterMode::Both);
        assert_eq!(config.bus.mode, BusMode::Embedded);
        assert!(config.discovery.offline_timeout_ms > config.discovery.heartbeat_interval_ms);
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = ClusterConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ClusterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.mode, config.mode);
        assert_eq!(
            parsed.discovery.heartbeat_interval_ms,
            config.discovery.heartbeat_interval_ms
        );
    }
}
