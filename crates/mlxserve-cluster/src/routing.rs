// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Routing strategies.
//!
//! All strategies operate on the registry's online snapshots, so
//! offline and draining workers are never candidates. Consistent-hash
//! routing gives session affinity a stable bucket with a small
//! virtual-node ring; on failover the next nodes clockwise take over.

use crate::registry::WorkerSnapshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Virtual nodes per worker on the hash ring.
const RING_REPLICAS: usize = 64;

/// Load balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Rotate through online workers
    RoundRobin,
    /// Minimize `active / capacity`
    LeastLoaded,
    /// Minimize smoothed observed latency
    LatencyAware,
    /// Stable session-to-worker bucket on a hash ring ("smart" in
    /// load-balancing configs)
    #[serde(alias = "smart")]
    ConsistentHash,
}

/// The router.
pub struct Router {
    strategy: RoutingStrategy,
    round_robin_cursor: Mutex<usize>,
}

impl Router {
    /// Create a router for a strategy.
    #[must_use]
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            round_robin_cursor: Mutex::new(0),
        }
    }

    /// The configured strategy.
    #[must_use]
    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Pick a worker from the candidates. `session_id` drives the
    /// consistent-hash bucket; other strategies ignore it.
    #[must_use]
    pub fn pick(
        &self,
        candidates: &[WorkerSnapshot],
        session_id: Option<&str>,
    ) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        match self.strategy {
            RoutingStrategy::RoundRobin => {
                let mut cursor = self.round_robin_cursor.lock();
                let picked = &candidates[*cursor % candidates.len()];
                *cursor = cursor.wrapping_add(1);
                Some(picked.worker_id.clone())
            }
            RoutingStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| {
                    let load_a = a.active_requests as f64 / a.capacity as f64;
                    let load_b = b.active_requests as f64 / b.capacity as f64;
                    load_a.total_cmp(&load_b)
                })
                .map(|w| w.worker_id.clone()),
            RoutingStrategy::LatencyAware => candidates
                .iter()
                .min_by(|a, b| a.latency_ema_ms.total_cmp(&b.latency_ema_ms))
                .map(|w| w.worker_id.clone()),
            RoutingStrategy::ConsistentHash => {
                let key = session_id.unwrap_or("anonymous");
                Self::ring_lookup(candidates, key, 0)
            }
        }
    }

    /// Consistent-hash pick skipping the first `skip` ring owners
    /// (failover: the next replicas clockwise).
    #[must_use]
    pub fn pick_with_failover(
        &self,
        candidates: &[WorkerSnapshot],
        session_id: &str,
        skip: usize,
    ) -> Option<String> {
        Self::ring_lookup(candidates, session_id, skip)
    }

    fn ring_lookup(candidates: &[WorkerSnapshot], key: &str, skip: usize) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut ring: BTreeMap<u64, &str> = BTreeMap::new();
        for worker in candidates {
            for replica in 0..RING_REPLICAS {
                let point = hash64(&format!("{}#{replica}", worker.worker_id));
                ring.insert(point, worker.worker_id.as_str());
            }
        }

        let target = hash64(key);
        let mut seen: Vec<&str> = Vec::new();
        // Walk clockwise from the target, wrapping, collecting distinct
        // owners until we have skipped enough for failover.
        for (_, worker_id) in ring.range(target..).chain(ring.range(..target)) {
            if seen.contains(worker_id) {
                continue;
            }
            seen.push(worker_id);
            if seen.len() > skip {
                return Some((*worker_id).to_string());
            }
        }
        // Fewer distinct workers than skips: wrap to the first owner.
        seen.first().map(|w| (*w).to_string())
    }
}

fn hash64(input: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}
