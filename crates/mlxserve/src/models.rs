// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Model identity, validation, and loaded-handle lifecycle.
//!
//! The manager enforces at-most-one handle per model id and LRU-evicts
//! beyond `max_loaded_models`. Identity validation is security-critical:
//! ids and explicit local paths are checked before anything reaches the
//! Worker Runtime, including URL-encoded traversal spellings.

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::limiter::ModelTier;
use crate::metrics_constants::{
    METRIC_MODELS_LOADED, METRIC_MODEL_INVALIDATIONS_TOTAL, METRIC_MODEL_UNLOADS_TOTAL,
};
use lru::LruCache;
use parking_lot::Mutex;
use prometheus::{Counter, Gauge};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{info, warn};

/// Conservative cap on model id length.
const MAX_MODEL_ID_LEN: usize = 256;

static MODELS_LOADED: LazyLock<Gauge> = LazyLock::new(|| {
    crate::metrics_utils::gauge(METRIC_MODELS_LOADED, "Models currently loaded")
});

static UNLOADS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(METRIC_MODEL_UNLOADS_TOTAL, "Total model unloads")
});

static INVALIDATIONS: LazyLock<Counter> = LazyLock::new(|| {
    crate::metrics_utils::counter(
        METRIC_MODEL_INVALIDATIONS_TOTAL,
        "Handles invalidated by worker restarts",
    )
});

/// Where the model artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// Already on local disk
    Local,
    /// Fetched from a model hub
    RemoteHub,
    /// Caller-provided custom source
    Custom,
}

/// Input/output modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// Text in, text out
    Text,
    /// Image + text in, text out
    Vision,
}

/// Weight quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    /// Full precision
    None,
    /// 8-bit
    Int8,
    /// 4-bit
    Int4,
}

impl std::fmt::Display for Quantization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quantization::None => write!(f, "none"),
            Quantization::Int8 => write!(f, "int8"),
            Quantization::Int4 => write!(f, "int4"),
        }
    }
}

/// Immutable model identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable id; `[A-Za-z0-9._/-]+`, no traversal
    pub id: String,
    /// Artifact source
    pub source: ModelSource,
    /// Modality
    pub modality: Modality,
    /// Free-form family tag ("llama", "qwen", ...)
    pub family: String,
    /// Optional revision pin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Optional quantization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<Quantization>,
    /// Optional explicit local artifact directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl ModelDescriptor {
    /// A local text model with defaults for everything else.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: ModelSource::Local,
            modality: Modality::Text,
            family: String::new(),
            revision: None,
            quantization: None,
            local_path: None,
        }
    }

    /// Set the family tag.
    #[must_use]
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    /// Set the modality.
    #[must_use]
    pub fn with_modality(mut self, modality: Modality) -> Self {
        self.modality = modality;
        self
    }

    /// Set the revision.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Set the quantization.
    #[must_use]
    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = Some(quantization);
        self
    }

    /// Set an explicit local path.
    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }
}

/// Tokenizer description reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizerInfo {
    /// Tokenizer family ("bpe", "sentencepiece", ...)
    #[serde(rename = "type")]
    pub tokenizer_type: String,
    /// Vocabulary size
    pub vocab_size: u32,
}

/// Worker-reported model metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Parameter count in billions
    pub parameter_count: f64,
    /// Weight dtype ("float16", "int4", ...)
    pub dtype: String,
    /// Architecture tag ("llama", "mistral", ...)
    pub architecture: String,
}

/// Handle lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    /// Load dispatched, worker not yet confirmed
    Loading,
    /// Usable
    Ready,
    /// Load failed; handle retained for inspection until unload
    Failed,
    /// Unload dispatched
    Unloading,
}

/// Runtime state of a loaded model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Identity
    pub descriptor: ModelDescriptor,
    /// Lifecycle state
    pub state: ModelState,
    /// Context window in tokens
    pub context_length: u32,
    /// Tokenizer description
    pub tokenizer: TokenizerInfo,
    /// Worker-reported metadata
    pub metadata: ModelMetadata,
    /// Whether this handle is a draft model for speculative decoding
    pub is_draft: bool,
}

impl ModelHandle {
    /// Tier bucket from the reported parameter count.
    #[must_use]
    pub fn tier(&self) -> ModelTier {
        ModelTier::from_parameter_count(self.metadata.parameter_count)
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Validate a model id.
///
/// # Errors
///
/// `InvalidParams` with a message naming the violation; traversal
/// attempts (raw or URL-encoded) are called out as "path traversal".
pub fn validate_model_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidParams("model id must not be empty".to_string()));
    }
    if id.len() > MAX_MODEL_ID_LEN {
        return Err(Error::InvalidParams(format!(
            "model id exceeds {MAX_MODEL_ID_LEN} characters"
        )));
    }

    let lowered = id.to_ascii_lowercase();
    // URL-encoded traversal spellings: %2e (.), %2f (/), %5c (\).
    if lowered.contains("%2e") || lowered.contains("%2f") || lowered.contains("%5c") {
        return Err(Error::InvalidParams(
            "model id contains URL-encoded path traversal sequence".to_string(),
        ));
    }

    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'/' | b'-'))
    {
        return Err(Error::InvalidParams(
            "model id contains characters outside [A-Za-z0-9._/-]".to_string(),
        ));
    }

    if id.starts_with('/') {
        return Err(Error::InvalidParams(
            "model id must not be an absolute path".to_string(),
        ));
    }

    if id.split('/').any(|segment| segment == "..") {
        return Err(Error::InvalidParams(
            "model id contains path traversal sequence".to_string(),
        ));
    }

    Ok(())
}

/// Validate an explicit local model path against the trusted roots.
///
/// With trusted directories configured, the canonicalized path must live
/// under one of them. With none configured, the path must at least exist
/// and be a directory.
///
/// # Errors
///
/// `InvalidParams` naming the violation.
pub fn validate_local_path(path: &Path, trusted: &[PathBuf]) -> Result<PathBuf> {
    let resolved = std::fs::canonicalize(path).map_err(|e| {
        Error::InvalidParams(format!(
            "local path {} cannot be resolved: {e}",
            path.display()
        ))
    })?;

    if trusted.is_empty() {
        if !resolved.is_dir() {
            return Err(Error::InvalidParams(format!(
                "local path {} is not a model directory",
                resolved.display()
            )));
        }
        return Ok(resolved);
    }

    for root in trusted {
        let Ok(root) = std::fs::canonicalize(root) else {
            continue;
        };
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }
    Err(Error::InvalidParams(format!(
        "local path {} escapes the trusted model directories (path traversal)",
        resolved.display()
    )))
}

// ============================================================================
// Manager
// ============================================================================

/// Tracks loaded handles, owner of the at-most-one-per-id invariant.
pub struct ModelManager {
    config: ModelConfig,
    handles: Mutex<LruCache<String, ModelHandle>>,
}

impl ModelManager {
    /// Build from config.
    #[must_use]
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Begin loading: registers a `Loading` handle and, when the loaded
    /// set is full, returns the LRU ready model that must be unloaded
    /// first.
    ///
    /// # Errors
    ///
    /// `InvalidParams` when a handle for `id` already exists.
    pub fn begin_load(&self, descriptor: ModelDescriptor, is_draft: bool) -> Result<Option<String>> {
        let mut handles = self.handles.lock();
        if handles.contains(&descriptor.id) {
            return Err(Error::InvalidParams(format!(
                "model {} already has a handle",
                descriptor.id
            )));
        }

        let mut evict = None;
        if handles.len() >= self.config.max_loaded_models {
            // Oldest ready, non-draft handle is the eviction victim.
            let victim = handles
                .iter()
                .rev()
                .find(|(_, h)| h.state == ModelState::Ready && !h.is_draft)
                .map(|(id, _)| id.clone());
            match victim {
                Some(id) => evict = Some(id),
                None => {
                    return Err(Error::Overloaded(format!(
                        "{} models loaded and none evictable",
                        handles.len()
                    )));
                }
            }
        }

        let id = descriptor.id.clone();
        handles.push(
            id,
            ModelHandle {
                descriptor,
                state: ModelState::Loading,
                context_length: self.config.default_context_length,
                tokenizer: TokenizerInfo::default(),
                metadata: ModelMetadata::default(),
                is_draft,
            },
        );
        MODELS_LOADED.set(handles.len() as f64);
        Ok(evict)
    }

    /// Mark a loading handle ready with worker-reported facts.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` when no handle exists for `id`.
    pub fn mark_ready(
        &self,
        id: &str,
        context_length: Option<u32>,
        tokenizer: TokenizerInfo,
        metadata: ModelMetadata,
    ) -> Result<ModelHandle> {
        let mut handles = self.handles.lock();
        let handle = handles
            .get_mut(id)
            .ok_or_else(|| Error::ModelNotLoaded(id.to_string()))?;
        handle.state = ModelState::Ready;
        if let Some(context_length) = context_length {
            handle.context_length = context_length;
        }
        handle.tokenizer = tokenizer;
        handle.metadata = metadata;
        info!(
            model = id,
            params_b = handle.metadata.parameter_count,
            "Model ready"
        );
        Ok(handle.clone())
    }

    /// Drop the handle after a failed load.
    pub fn mark_failed(&self, id: &str) {
        let mut handles = self.handles.lock();
        if handles.pop(id).is_some() {
            warn!(model = id, "Model load failed; handle removed");
        }
        MODELS_LOADED.set(handles.len() as f64);
    }

    /// Remove a handle (unload).
    pub fn remove(&self, id: &str) -> Option<ModelHandle> {
        let mut handles = self.handles.lock();
        let removed = handles.pop(id);
        if removed.is_some() {
            UNLOADS.inc();
        }
        MODELS_LOADED.set(handles.len() as f64);
        removed
    }

    /// Look up a handle, refreshing its recency.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ModelHandle> {
        self.handles.lock().get(id).cloned()
    }

    /// A ready handle for `id`.
    ///
    /// # Errors
    ///
    /// `ModelNotLoaded` when missing or not in `Ready` state.
    pub fn ready(&self, id: &str) -> Result<ModelHandle> {
        match self.get(id) {
            Some(handle) if handle.state == ModelState::Ready => Ok(handle),
            Some(handle) => Err(Error::ModelNotLoaded(format!(
                "{id} is {:?}",
                handle.state
            ))),
            None => Err(Error::ModelNotLoaded(id.to_string())),
        }
    }

    /// All handles, most recently used first.
    #[must_use]
    pub fn list(&self) -> Vec<ModelHandle> {
        self.handles.lock().iter().map(|(_, h)| h.clone()).collect()
    }

    /// Loaded handle count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether no handles are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Drop every handle (worker restarted; all state on the worker is
    /// gone). Returns the ids that were invalidated.
    pub fn invalidate_all(&self) -> Vec<String> {
        let mut handles = self.handles.lock();
        let ids: Vec<String> = handles.iter().map(|(id, _)| id.clone()).collect();
        handles.clear();
        MODELS_LOADED.set(0.0);
        INVALIDATIONS.inc_by(ids.len() as f64);
        if !ids.is_empty() {
            warn!(count = ids.len(), "All model handles invalidated");
        }
        ids
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> ModelManager {
        ModelManager::new(ModelConfig {
            max_loaded_models: max,
            ..ModelConfig::default()
        })
    }

    fn mark_ready_with_params(manager: &ModelManager, id: &str, params_b: f64) {
        manager
            .mark_ready(
                id,
                Some(8_192),
                TokenizerInfo {
                    tokenizer_type: "bpe".to_string(),
                    vocab_size: 32_000,
                },
                ModelMetadata {
                    parameter_count: params_b,
                    dtype: "float16".to_string(),
                    architecture: "llama".to_string(),
                },
            )
            .unwrap();
    }

    // ============================================
    // Id validation
    // ============================================

    #[test]
    fn test_valid_ids() {
        for id in [
            "llama-7b",
            "mlx-community/Qwen2.5-7B-Instruct-4bit",
            "org/model.v2",
            "a",
        ] {
            validate_model_id(id).unwrap();
        }
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(validate_model_id("").is_err());
    }

    #[test]
    fn test_oversized_id_rejected() {
        let id = "a".repeat(MAX_MODEL_ID_LEN + 1);
        assert!(validate_model_id(&id).is_err());
    }

    #[test]
    fn test_traversal_rejected_with_message() {
        let err = validate_model_id("../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("path traversal"));
    }

    #[test]
    fn test_embedded_traversal_rejected() {
        assert!(validate_model_id("models/../secrets").is_err());
    }

    #[test]
    fn test_url_encoded_traversal_rejected() {
        for id in ["%2e%2e%2fetc", "a%2E%2e/b", "x%5cwindows"] {
            let err = validate_model_id(id).unwrap_err();
            assert!(
                err.to_string().contains("path traversal"),
                "{id}: {err}"
            );
        }
    }

    #[test]
    fn test_absolute_path_rejected() {
        assert!(validate_model_id("/etc/passwd").is_err());
    }

    #[test]
    fn test_illegal_characters_rejected() {
        for id in ["model name", "model!", "model\\path", "mo:del"] {
            assert!(validate_model_id(id).is_err(), "{id} should be rejected");
        }
    }

    // ============================================
    // Local path validation
    // ============================================

    #[test]
    fn test_local_path_inside_trusted_dir() {
        let root = tempfile::tempdir().unwrap();
        let model_dir = root.path().join("llama-7b");
        std::fs::create_dir(&model_dir).unwrap();
        let resolved =
            validate_local_path(&model_dir, &[root.path().to_path_buf()]).unwrap();
        assert!(resolved.starts_with(std::fs::canonicalize(root.path()).unwrap()));
    }

    #[test]
    fn test_local_path_escaping_trusted_dir() {
        let trusted = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let err = validate_local_path(outside.path(), &[trusted.path().to_path_buf()])
            .unwrap_err();
        assert!(err.to_string().contains("path traversal"));
    }

    #[test]
    fn test_local_path_traversal_resolved_before_check() {
        let trusted = tempfile::tempdir().unwrap();
        let sneaky = trusted.path().join("inner").join("..").join("..");
        // Resolves above the trusted root.
        let result = validate_local_path(&sneaky, &[trusted.path().to_path_buf()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_local_path_without_trusted_dirs_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        validate_local_path(dir.path(), &[]).unwrap();
        assert!(validate_local_path(Path::new("/nonexistent/model"), &[]).is_err());
    }

    // ============================================
    // Manager lifecycle
    // ============================================

    #[test]
    fn test_load_lifecycle() {
        let manager = manager(4);
        let evict = manager
            .begin_load(ModelDescriptor::new("llama-7b"), false)
            .unwrap();
        assert!(evict.is_none());
        assert_eq!(manager.get("llama-7b").unwrap().state, ModelState::Loading);

        mark_ready_with_params(&manager, "llama-7b", 7.0);
        let handle = manager.ready("llama-7b").unwrap();
        assert_eq!(handle.state, ModelState::Ready);
        assert_eq!(handle.tier(), ModelTier::Md7To13B);
        assert_eq!(handle.context_length, 8_192);
    }

    #[test]
    fn test_at_most_one_handle_per_id() {
        let manager = manager(4);
        manager
            .begin_load(ModelDescriptor::new("llama-7b"), false)
            .unwrap();
        let err = manager
            .begin_load(ModelDescriptor::new("llama-7b"), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParams(_)));
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let manager = manager(2);
        for id in ["first", "second"] {
            manager
                .begin_load(ModelDescriptor::new(id), false)
                .unwrap();
            mark_ready_with_params(&manager, id, 1.0);
        }

        // Touch "first" so "second" becomes the LRU victim.
        let _ = manager.get("first");
        let evict = manager
            .begin_load(ModelDescriptor::new("third"), false)
            .unwrap();
        assert_eq!(evict.as_deref(), Some("second"));
    }

    #[test]
    fn test_failed_load_removes_handle() {
        let manager = manager(4);
        manager
            .begin_load(ModelDescriptor::new("bad"), false)
            .unwrap();
        manager.mark_failed("bad");
        assert!(manager.get("bad").is_none());

        // A fresh load of the same id succeeds.
        manager
            .begin_load(ModelDescriptor::new("bad"), false)
            .unwrap();
    }

    #[test]
    fn test_unload_then_reload() {
        let manager = manager(4);
        manager
            .begin_load(ModelDescriptor::new("llama-7b"), false)
            .unwrap();
        mark_ready_with_params(&manager, "llama-7b", 7.0);
        assert!(manager.remove("llama-7b").is_some());
        assert!(manager.is_empty());

        manager
            .begin_load(ModelDescriptor::new("llama-7b"), false)
            .unwrap();
        mark_ready_with_params(&manager, "llama-7b", 7.0);
        assert_eq!(manager.ready("llama-7b").unwrap().state, ModelState::Ready);
    }

    #[test]
    fn test_invalidate_all() {
        let manager = manager(4);
        for id in ["a", "b"] {
            manager
                .begin_load(ModelDescriptor::new(id), false)
                .unwrap();
            mark_ready_with_params(&manager, id, 1.0);
        }
        let mut invalidated = manager.invalidate_all();
        invalidated.sort();
        assert_eq!(invalidated, vec!["a".to_string(), "b".to_string()]);
        assert!(manager.is_empty());
        assert!(manager.ready("a").is_err());
    }

    #[test]
    fn test_ready_rejects_loading_state() {
        let manager = manager(4);
        manager
            .begin_load(ModelDescriptor::new("slow"), false)
            .unwrap();
        let err = manager.ready("slow").unwrap_err();
        assert!(matches!(err, Error::ModelNotLoaded(_)));
    }
}
