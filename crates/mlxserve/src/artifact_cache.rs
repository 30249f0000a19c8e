// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Content-addressed on-disk model artifact cache.
//!
//! Artifacts are stored by a deterministic hash over
//! `(id, revision, quantization)`, enabling:
//! - Deduplication (store is idempotent per hash)
//! - Cheap lookups before the worker touches the network
//! - Safe concurrent readers (writes are temp-then-rename)
//!
//! Layout: `<cache_dir>/index.json` plus `<cache_dir>/artifacts/<hash>/`.
//! Eviction honors the configured policy (LRU/LFU/FIFO) and the byte
//! cap; disabled mode always reports a miss.

use crate::config::{CacheConfig, EvictionPolicy};
use crate::error::{Error, Result};
use crate::metrics_constants::{
    METRIC_ARTIFACT_CACHE_BYTES, METRIC_ARTIFACT_CACHE_EVICTIONS_TOTAL,
    METRIC_ARTIFACT_CACHE_HITS_TOTAL, METRIC_ARTIFACT_CACHE_MISSES_TOTAL,
};
use crate::models::ModelDescriptor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static HITS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_ARTIFACT_CACHE_HITS_TOTAL, "Artifact cache hits")
});
static MISSES: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_ARTIFACT_CACHE_MISSES_TOTAL, "Artifact cache misses")
});
static EVICTIONS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_ARTIFACT_CACHE_EVICTIONS_TOTAL,
        "Artifact cache evictions",
    )
});
static CACHE_BYTES: LazyLock<Gauge> = LazyLock::new(|| {
    crate::metrics_utils::gauge(METRIC_ARTIFACT_CACHE_BYTES, "Bytes held by the artifact cache")
});

/// One cached artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactCacheEntry {
    /// Content key
    pub hash: String,
    /// Bytes on disk
    pub size_bytes: u64,
    /// Insertion time
    pub created_at: DateTime<Utc>,
    /// Last lookup time
    pub last_accessed_at: DateTime<Utc>,
    /// Lookup count (drives LFU)
    pub access_count: u64,
    /// Artifact directory
    pub artifact_path: PathBuf,
    /// Caller metadata stored alongside
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Lookup outcome.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// Artifact directory for a hit
    pub path: PathBuf,
    /// The index entry
    pub entry: ArtifactCacheEntry,
}

/// Store outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    /// Content key
    pub hash: String,
    /// Bytes stored (or already present)
    pub size_bytes: u64,
}

/// Cache health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealth {
    /// Whether the cache is enabled
    pub enabled: bool,
    /// Entries in the index
    pub entry_count: usize,
    /// Bytes on disk
    pub total_bytes: u64,
    /// Configured cap
    pub max_bytes: u64,
    /// `total_bytes / max_bytes`
    pub utilization: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: HashMap<String, ArtifactCacheEntry>,
}

/// Deterministic content key over `(id, revision, quantization)`.
#[must_use]
pub fn cache_key(descriptor: &ModelDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.id.as_bytes());
    hasher.update([0]);
    hasher.update(descriptor.revision.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(
        descriptor
            .quantization
            .map(|q| q.to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// The on-disk cache.
pub struct ArtifactCache {
    config: CacheConfig,
    index: Mutex<CacheIndex>,
}

impl ArtifactCache {
    /// Open (or initialize) the cache under `config.cache_dir`.
    ///
    /// # Errors
    ///
    /// `Io` when the directory tree cannot be created or the index is
    /// unreadable.
    pub fn open(config: CacheConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self {
                config,
                index: Mutex::new(CacheIndex::default()),
            });
        }

        std::fs::create_dir_all(config.cache_dir.join("artifacts"))?;
        let index_path = config.cache_dir.join("index.json");
        let mut index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "Corrupt cache index; starting empty");
                CacheIndex::default()
            })
        } else {
            CacheIndex::default()
        };

        if config.validate_on_startup {
            let before = index.entries.len();
            index
                .entries
                .retain(|_, entry| entry.artifact_path.is_dir());
            let dropped = before - index.entries.len();
            if dropped > 0 {
                info!(dropped, "Dropped index entries missing on disk");
            }
        }

        let cache = Self {
            config,
            index: Mutex::new(index),
        };
        CACHE_BYTES.set(cache.total_bytes() as f64);
        Ok(cache)
    }

    /// Look up an artifact. Refreshes recency and access count on a hit.
    /// Disabled mode always misses.
    #[must_use]
    pub fn lookup(&self, descriptor: &ModelDescriptor) -> Option<CacheLookup> {
        if !self.config.enabled {
            return None;
        }
        let key = cache_key(descriptor);
        let mut index = self.index.lock();
        match index.entries.get_mut(&key) {
            Some(entry) => {
                entry.last_accessed_at = Utc::now();
                entry.access_count += 1;
                HITS.inc();
                let lookup = CacheLookup {
                    path: entry.artifact_path.clone(),
                    entry: entry.clone(),
                };
                drop(index);
                self.persist_index();
                Some(lookup)
            }
            None => {
                MISSES.inc();
                None
            }
        }
    }

    /// Store an artifact directory. Idempotent per hash: a second store
    /// of the same key returns the existing receipt without copying.
    ///
    /// # Errors
    ///
    /// `Io` on copy failures; `InvalidParams` when `source_dir` is not a
    /// directory.
    pub fn store(
        &self,
        descriptor: &ModelDescriptor,
        source_dir: &Path,
        metadata: serde_json::Value,
    ) -> Result<StoreReceipt> {
        let key = cache_key(descriptor);
        if !self.config.enabled {
            return Ok(StoreReceipt {
                hash: key,
                size_bytes: 0,
            });
        }
        if !source_dir.is_dir() {
            return Err(Error::InvalidParams(format!(
                "{} is not a directory",
                source_dir.display()
            )));
        }

        {
            let index = self.index.lock();
            if let Some(existing) = index.entries.get(&key) {
                debug!(hash = %key, "Artifact already cached; store is a no-op");
                return Ok(StoreReceipt {
                    hash: key.clone(),
                    size_bytes: existing.size_bytes,
                });
            }
        }

        let final_dir = self.config.cache_dir.join("artifacts").join(&key);
        let tmp_dir = self
            .config
            .cache_dir
            .join("artifacts")
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        let size_bytes = copy_dir_recursive(source_dir, &tmp_dir)?;
        // Readers never observe a partial artifact: the directory appears
        // atomically under its final name.
        match std::fs::rename(&tmp_dir, &final_dir) {
            Ok(()) => {}
            Err(e) if final_dir.is_dir() => {
                // Lost a store race for the same hash; the winner's copy
                // is equivalent by construction.
                let _ = std::fs::remove_dir_all(&tmp_dir);
                debug!(hash = %key, error = %e, "Concurrent store won the rename");
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&tmp_dir);
                return Err(Error::Io(e));
            }
        }

        let now = Utc::now();
        {
            let mut index = self.index.lock();
            index.entries.insert(
                key.clone(),
                ArtifactCacheEntry {
                    hash: key.clone(),
                    size_bytes,
                    created_at: now,
                    last_accessed_at: now,
                    access_count: 0,
                    artifact_path: final_dir,
                    metadata,
                },
            );
        }
        self.evict_to_cap();
        self.persist_index();
        CACHE_BYTES.set(self.total_bytes() as f64);
        info!(hash = %key, size_bytes, "Artifact stored");
        Ok(StoreReceipt {
            hash: key,
            size_bytes,
        })
    }

    /// Remove everything.
    ///
    /// # Errors
    ///
    /// `Io` when the artifact tree cannot be removed.
    pub fn clear(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        {
            let mut index = self.index.lock();
            index.entries.clear();
        }
        let artifacts = self.config.cache_dir.join("artifacts");
        if artifacts.is_dir() {
            std::fs::remove_dir_all(&artifacts)?;
            std::fs::create_dir_all(&artifacts)?;
        }
        self.persist_index();
        CACHE_BYTES.set(0.0);
        Ok(())
    }

    /// Remove entries older than `max_age_days`.
    pub fn sweep_expired(&self) {
        if !self.config.enabled {
            return;
        }
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.config.max_age_days));
        let expired: Vec<ArtifactCacheEntry> = {
            let mut index = self.index.lock();
            let keys: Vec<String> = index
                .entries
                .iter()
                .filter(|(_, e)| e.created_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| index.entries.remove(k))
                .collect()
        };
        for entry in &expired {
            let _ = std::fs::remove_dir_all(&entry.artifact_path);
            EVICTIONS.inc();
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Swept expired artifacts");
            self.persist_index();
            CACHE_BYTES.set(self.total_bytes() as f64);
        }
    }

    /// Health snapshot.
    #[must_use]
    pub fn health(&self) -> CacheHealth {
        let total_bytes = self.total_bytes();
        let index = self.index.lock();
        CacheHealth {
            enabled: self.config.enabled,
            entry_count: index.entries.len(),
            total_bytes,
            max_bytes: self.config.max_size_bytes,
            utilization: if self.config.max_size_bytes == 0 {
                0.0
            } else {
                total_bytes as f64 / self.config.max_size_bytes as f64
            },
        }
    }

    fn total_bytes(&self) -> u64 {
        self.index
            .lock()
            .entries
            .values()
            .map(|e| e.size_bytes)
            .sum()
    }

    fn evict_to_cap(&self) {
        loop {
            let victim = {
                let index = self.index.lock();
                let total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
                if total <= self.config.max_size_bytes || index.entries.is_empty() {
                    return;
                }
                let victim = match self.config.eviction_policy {
                    EvictionPolicy::Lru => index
                        .entries
                        .values()
                        .min_by_key(|e| e.last_accessed_at),
                    EvictionPolicy::Lfu => index
                        .entries
                        .values()
                        .min_by_key(|e| (e.access_count, e.last_accessed_at)),
                    EvictionPolicy::Fifo => index.entries.values().min_by_key(|e| e.created_at),
                };
                victim.map(|e| e.hash.clone())
            };
            let Some(hash) = victim else { return };
            let removed = self.index.lock().entries.remove(&hash);
            if let Some(entry) = removed {
                let _ = std::fs::remove_dir_all(&entry.artifact_path);
                EVICTIONS.inc();
                debug!(hash = %hash, policy = ?self.config.eviction_policy, "Artifact evicted");
            }
        }
    }

    fn persist_index(&self) {
        let serialized = {
            let index = self.index.lock();
            serde_json::to_vec_pretty(&*index)
        };
        let Ok(bytes) = serialized else { return };
        let path = self.config.cache_dir.join("index.json");
        let tmp = self.config.cache_dir.join(".index.json.tmp");
        if std::fs::write(&tmp, bytes).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> Result<u64> {
    std::fs::create_dir_all(to)?;
    let mut total = 0u64;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            total += std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(total)
}
