// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Fingerprint deduplication of concurrent identical generations.
//!
//! Requests with identical deterministic parameters join a single
//! in-flight generation and observe the same terminal outcome. The cache
//! never poisons: a failed generation's entry is removed before the
//! error propagates, so the next identical request starts fresh.
//!
//! Deduplication serves generate-and-collect callers. Streaming callers
//! bypass it: joiners of a shared future see the same final text but
//! would miss intermediate tokens.

use crate::error::{Error, ErrorObject, Result};
use crate::metrics_constants::{
    METRIC_DEDUP_BYPASS_TOTAL, METRIC_DEDUP_EVICTIONS_TOTAL, METRIC_DEDUP_HITS_TOTAL,
    METRIC_DEDUP_MISSES_TOTAL,
};
use crate::protocol::GenerateParams;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use prometheus::Counter;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::debug;

static HITS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_DEDUP_HITS_TOTAL, "Fingerprint cache hits")
});
static MISSES: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_DEDUP_MISSES_TOTAL, "Fingerprint cache misses")
});
static EVICTIONS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_DEDUP_EVICTIONS_TOTAL, "Fingerprint entries evicted")
});
static BYPASS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_DEDUP_BYPASS_TOTAL, "Requests that bypassed dedup")
});

pub use crate::config::DedupConfig;

/// SHA-256 over the canonicalized deterministic generation parameters.
///
/// Keys are serialized in a fixed order; float parameters use their
/// shortest round-trip formatting, so equal values always produce equal
/// fingerprints.
#[must_use]
pub fn fingerprint(params: &GenerateParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.model_id.as_bytes());
    hasher.update([0]);
    hasher.update(params.prompt.as_bytes());
    hasher.update([0]);
    for float_field in [params.temperature, params.top_p] {
        match float_field {
            Some(v) => hasher.update(format!("{v}").as_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update([0]);
    }
    for int_field in [
        params.top_k.map(u64::from),
        params.max_tokens.map(u64::from),
        params.seed,
    ] {
        match int_field {
            Some(v) => hasher.update(v.to_le_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

type SharedOutcome<T> = Shared<BoxFuture<'static, std::result::Result<T, ErrorObject>>>;

struct FingerprintEntry<T: Clone> {
    generation: u64,
    future: SharedOutcome<T>,
    expires_at: Instant,
}

struct DedupState<T: Clone> {
    entries: HashMap<String, FingerprintEntry<T>>,
    insertion_order: VecDeque<String>,
    next_generation: u64,
}

/// The fingerprint cache. `T` is the shared terminal outcome type.
pub struct Deduplicator<T: Clone + Send + Sync + 'static> {
    config: DedupConfig,
    state: Mutex<DedupState<T>>,
}

impl<T: Clone + Send + Sync + 'static> Deduplicator<T> {
    /// Build from config.
    #[must_use]
    pub fn new(config: DedupConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(DedupState {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
                next_generation: 0,
            }),
        })
    }

    /// In-flight or recently completed entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Join the in-flight generation for `params`, or start one via
    /// `make`. `bypass` forces a fresh dispatch (streaming callers).
    ///
    /// The producer runs as a spawned task, so it completes exactly once
    /// even if every waiter is cancelled.
    ///
    /// # Errors
    ///
    /// The producer's error; on producer failure the entry is removed
    /// before the error propagates.
    pub async fn get_or_start<F, Fut>(
        self: &Arc<Self>,
        params: &GenerateParams,
        bypass: bool,
        make: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.config.enabled || bypass || params.prompt.len() > self.config.max_payload_bytes {
            BYPASS.inc();
            return make().await;
        }

        let key = fingerprint(params);
        let now = Instant::now();

        let (shared, generation, joined) = {
            let mut state = self.state.lock();
            let existing = state
                .entries
                .get(&key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| (entry.future.clone(), entry.generation));
            match existing {
                Some((future, generation)) => {
                    HITS.inc();
                    (future, generation, true)
                }
                None => {
                    MISSES.inc();
                    let generation = state.next_generation;
                    state.next_generation += 1;

                    let handle = tokio::spawn(make());
                    let future: SharedOutcome<T> = async move {
                        match handle.await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(ErrorObject::from(&err)),
                            Err(join_err) => Err(ErrorObject::new(
                                "INTERNAL_ERROR",
                                format!("generation task failed: {join_err}"),
                            )),
                        }
                    }
                    .boxed()
                    .shared();

                    if state.entries.remove(&key).is_none()
                        && state.entries.len() >= self.config.max_entries
                    {
                        // FIFO eviction of the oldest live entry.
                        while let Some(oldest) = state.insertion_order.pop_front() {
                            if state.entries.remove(&oldest).is_some() {
                                EVICTIONS.inc();
                                break;
                            }
                        }
                    }
                    state.entries.insert(
                        key.clone(),
                        FingerprintEntry {
                            generation,
                            future: future.clone(),
                            expires_at: now + Duration::from_millis(self.config.ttl_ms),
                        },
                    );
                    state.insertion_order.push_back(key.clone());
                    (future, generation, false)
                }
            }
        };

        if joined {
            debug!(fingerprint = %&key[..12], "Joined in-flight generation");
        }

        match shared.await {
            Ok(value) => Ok(value),
            Err(err) => {
                // No poisoning: drop the entry so the next identical
                // request starts a fresh generation.
                self.remove_if_generation(&key, generation);
                Err(Error::from(err))
            }
        }
    }

    /// Remove expired entries. Called by the cleanup loop.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.entries.remove(key);
            EVICTIONS.inc();
        }
        if !expired.is_empty() {
            let DedupState {
                entries,
                insertion_order,
                ..
            } = &mut *state;
            insertion_order.retain(|k| entries.contains_key(k));
            debug!(count = expired.len(), "Swept expired fingerprints");
        }
    }

    /// Spawn the periodic sweep.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let dedup = Arc::clone(self);
        let interval = Duration::from_millis(dedup.config.cleanup_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                dedup.sweep_expired();
            }
        })
    }

    fn remove_if_generation(&self, key: &str, generation: u64) {
        let mut state = self.state.lock();
        if state
            .entries
            .get(key)
            .is_some_and(|e| e.generation == generation)
        {
            state.entries.remove(key);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn params(prompt: &str, seed: Option<u64>) -> GenerateParams {
        GenerateParams {
            model_id: "llama-7b".to_string(),
            prompt: prompt.to_string(),
            temperature: Some(0.7),
            top_p: Some(0.9),
            top_k: Some(40),
            max_tokens: Some(128),
            seed,
            images: Vec::new(),
            tenant_id: None,
        }
    }

    fn dedup(config: DedupConfig) -> Arc<Deduplicator<String>> {
        Deduplicator::new(config)
    }

    #[test]
    fn test_fingerprint_equality() {
        assert_eq!(
            fingerprint(&params("hello", Some(1))),
            fingerprint(&params("hello", Some(1)))
        );
        assert_ne!(
            fingerprint(&params("hello", Some(1))),
            fingerprint(&params("hello", Some(2)))
        );
        assert_ne!(
            fingerprint(&params("hello", Some(1))),
            fingerprint(&params("world", Some(1)))
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_none_from_zero() {
        assert_ne!(
            fingerprint(&params("x", None)),
            fingerprint(&params("x", Some(0)))
        );
    }

    #[tokio::test]
    async fn test_identical_requests_share_one_dispatch() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let dedup = Arc::clone(&dedup);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                dedup
                    .get_or_start(&params("same", Some(42)), false, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("generated text".to_string())
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "generated text");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_params_do_not_share() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        for seed in [1u64, 2] {
            let calls = Arc::clone(&calls);
            dedup
                .get_or_start(&params("same", Some(seed)), false, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("t".to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicU32::new(0));

        let p = params("flaky", Some(7));
        let calls_first = Arc::clone(&calls);
        let err = dedup
            .get_or_start(&p, false, move || async move {
                calls_first.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(Error::Generation("worker oom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert!(dedup.is_empty(), "failed entry must be removed");

        let calls_second = Arc::clone(&calls);
        let text = dedup
            .get_or_start(&p, false, move || async move {
                calls_second.fetch_add(1, Ordering::SeqCst);
                Ok("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(text, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_payload_bypasses() {
        let config = DedupConfig {
            max_payload_bytes: 8,
            ..DedupConfig::default()
        };
        let dedup = dedup(config);
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            dedup
                .get_or_start(
                    &params("a prompt well over eight bytes", Some(1)),
                    false,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("t".to_string())
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_bypass() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            dedup
                .get_or_start(&params("stream me", Some(1)), true, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("t".to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_sweeps() {
        let config = DedupConfig {
            ttl_ms: 10,
            ..DedupConfig::default()
        };
        let dedup = dedup(config);
        dedup
            .get_or_start(&params("short lived", Some(1)), false, || async {
                Ok("t".to_string())
            })
            .await
            .unwrap();
        assert_eq!(dedup.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        dedup.sweep_expired();
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_max_entries_fifo_eviction() {
        let config = DedupConfig {
            max_entries: 2,
            ..DedupConfig::default()
        };
        let dedup = dedup(config);
        for i in 0..3u64 {
            dedup
                .get_or_start(&params("p", Some(i)), false, || async {
                    Ok("t".to_string())
                })
                .await
                .unwrap();
        }
        assert_eq!(dedup.len(), 2);
    }

    #[tokio::test]
    async fn test_completed_entry_serves_from_cache_within_ttl() {
        let dedup = dedup(DedupConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            let text = dedup
                .get_or_start(&params("cached", Some(9)), false, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("hello".to_string())
                })
                .await
                .unwrap();
            assert_eq!(text, "hello");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
