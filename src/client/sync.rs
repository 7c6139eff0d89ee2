//! Replays invalidations announced by peer instances on the sync channel.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{Origin, QueryClient, SOURCE, spawn_background};
use crate::cache::lock::mutex_lock;
use crate::sync::{SyncKind, SyncMessage};

impl QueryClient {
    /// Subscribe now, so nothing posted after `build` returns is missed, and
    /// apply peer messages on a background task until the client is dropped.
    pub(super) fn spawn_sync_listener(&self) {
        let Some(channel) = self.inner.sync.clone() else {
            return;
        };
        let mut receiver = channel.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let own_id = self.inner.instance_id;
        let channel_name = channel.name().to_string();

        let task = async move {
            loop {
                let message = match receiver.recv().await {
                    Ok(message) => message,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "Sync listener lagged; messages dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if message.source_id == own_id {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                QueryClient { inner }.apply_remote(message);
            }
            debug!(channel = %channel_name, "Sync listener stopped");
        };
        if let Some(handle) = spawn_background("sync", task) {
            mutex_lock(&self.inner.tasks, SOURCE, "spawn_sync_listener").push(handle);
        }
    }

    fn apply_remote(&self, message: SyncMessage) {
        info!(
            message_id = %message.id,
            source_id = %message.source_id,
            kind = message.kind.label(),
            "Applying sync message"
        );
        match message.kind {
            SyncKind::Invalidate { key } => self.invalidate_hash(&key, Origin::Remote),
            SyncKind::InvalidateByPrefix { prefix } => {
                self.invalidate_prefix_with_origin(&prefix, Origin::Remote);
            }
            SyncKind::InvalidateTags { tags } => {
                self.invalidate_tags_with_origin(tags, Origin::Remote);
            }
            SyncKind::Clear => self.clear_with_origin(Origin::Remote),
            SyncKind::Version { version } => {
                let clear = self
                    .lock("sync.version")
                    .version_guard
                    .as_ref()
                    .is_some_and(|guard| guard.clear_on_mismatch && guard.version != version);
                if clear {
                    info!(version = %version, "Peer runs a different cache version; clearing");
                    self.clear_with_origin(Origin::Remote);
                }
            }
        }
    }
}
