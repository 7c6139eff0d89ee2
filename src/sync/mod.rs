//! Cross-instance invalidation sync.
//!
//! Instances sharing a channel see each other's invalidate and clear
//! commands. Each message carries the sender's instance id; receivers drop
//! their own messages and replay the rest locally without re-broadcasting.

use std::fmt;
use std::sync::{Arc, LazyLock, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::cache::KeyHash;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Live named channels in this process. Entries die with their last holder.
static NAMED_CHANNELS: LazyLock<DashMap<String, Weak<BroadcastSyncChannel>>> =
    LazyLock::new(DashMap::new);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub id: Uuid,
    pub source_id: Uuid,
    pub kind: SyncKind,
}

impl SyncMessage {
    pub fn new(source_id: Uuid, kind: SyncKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SyncKind {
    Invalidate { key: KeyHash },
    InvalidateByPrefix { prefix: String },
    InvalidateTags { tags: Vec<String> },
    Clear,
    #[serde(rename = "cache:version")]
    Version { version: String },
}

impl SyncKind {
    pub fn label(&self) -> &'static str {
        match self {
            SyncKind::Invalidate { .. } => "invalidate",
            SyncKind::InvalidateByPrefix { .. } => "invalidateByPrefix",
            SyncKind::InvalidateTags { .. } => "invalidateTags",
            SyncKind::Clear => "clear",
            SyncKind::Version { .. } => "cache:version",
        }
    }
}

/// Best-effort same-origin message channel.
pub trait SyncChannel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    /// Deliver to every current subscriber, the sender's own included.
    fn post(&self, message: SyncMessage);
    fn subscribe(&self) -> broadcast::Receiver<SyncMessage>;
}

/// In-process channel over `tokio::sync::broadcast`. Clones share the
/// underlying channel.
#[derive(Debug, Clone)]
pub struct BroadcastSyncChannel {
    name: String,
    tx: broadcast::Sender<SyncMessage>,
}

impl BroadcastSyncChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
        }
    }

    /// Join the process-wide channel called `name`, creating it if no live
    /// instance holds it. Every caller passing the same name gets the same
    /// channel.
    pub fn named(name: &str) -> Arc<Self> {
        let mut slot = NAMED_CHANNELS.entry(name.to_string()).or_default();
        if let Some(channel) = slot.upgrade() {
            return channel;
        }
        let channel = Arc::new(Self::new(name));
        *slot = Arc::downgrade(&channel);
        debug!(channel = %name, "Opened named sync channel");
        channel
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SyncChannel for BroadcastSyncChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: SyncMessage) {
        let kind = message.kind.label();
        // Sending only fails when nobody listens.
        if self.tx.send(message).is_err() {
            debug!(channel = %self.name, kind, "sync message had no subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}
