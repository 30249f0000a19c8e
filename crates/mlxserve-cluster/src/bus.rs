// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pub/sub message bus.
//!
//! The cluster speaks through a [`MessageBus`] trait so deployments can
//! choose the embedded in-process bus (controller and workers in one
//! process, and tests) or an external broker behind the same seam.
//! Subjects are exact-match strings; see
//! [`crate::protocol::subjects`] for the naming scheme.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-subscription channel capacity.
const SUBSCRIPTION_BUFFER: usize = 1024;

/// One message on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Subject the message was published to
    pub subject: String,
    /// Serialized payload
    pub payload: Vec<u8>,
}

/// The bus seam.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload to a subject. Publishing to a subject with no
    /// subscribers is not an error.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a subject. Messages published after this call are
    /// delivered in publish order.
    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>>;
}

/// Bus deployment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusMode {
    /// In-process bus
    Embedded,
    /// External broker (reserved; carried in config, not built here)
    External,
}

/// Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Deployment mode
    pub mode: BusMode,
    /// Broker URL for external mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    /// Broker auth token for external mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: BusMode::Embedded,
            server_url: None,
            auth_token: None,
        }
    }
}

/// Build a bus from config.
///
/// # Errors
///
/// `Unsupported` for external mode: the seam is the trait; wiring a
/// broker client is a deployment concern, not a library default.
pub fn build_bus(config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
    match config.mode {
        BusMode::Embedded => Ok(Arc::new(EmbeddedBus::new())),
        BusMode::External => Err(Error::Unsupported(
            "external bus mode requires a broker-backed MessageBus implementation".to_string(),
        )),
    }
}

/// In-process bus: exact-subject fan-out over bounded channels.
#[derive(Default)]
pub struct EmbeddedBus {
    subscribers: DashMap<String, Vec<mpsc::Sender<BusMessage>>>,
}

impl EmbeddedBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber count for a subject (tests, introspection).
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .get(subject)
            .map_or(0, |senders| senders.len())
    }
}

#[async_trait]
impl MessageBus for EmbeddedBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let Some(mut senders) = self.subscribers.get_mut(subject) else {
            debug!(subject, "Publish with no subscribers");
            return Ok(());
        };
        // A full or closed subscriber is dropped rather than stalling
        // the publisher; bus consumers own their buffer sizing.
        senders.retain(|sender| {
            sender
                .try_send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<mpsc::Receiver<BusMessage>> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .entry(subject.to_string())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}
