//! Bridge between the client and its persistence backend: debounced flushes,
//! restore, snapshot export/import and the cache version guard.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::{ClientState, QueryClient, spawn_background};
use crate::cache::{KeyHash, PersistedEntry};
use crate::error::PersistenceError;
use crate::persist::{CacheSnapshot, decode_entries, encode_entries, version_key};
use crate::sync::SyncKind;

/// Version recorded by [`QueryClient::guard_version`]; peers announcing a
/// different version clear this cache when `clear_on_mismatch` is set.
#[derive(Debug, Clone)]
pub(super) struct VersionGuard {
    pub(super) version: String,
    pub(super) clear_on_mismatch: bool,
}

/// Outcome of [`QueryClient::guard_version`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck {
    /// Version stored by the previous run, if any.
    pub previous: Option<String>,
    pub mismatched: bool,
}

impl QueryClient {
    /// Replace any pending flush with one that fires after the debounce.
    pub(super) fn schedule_flush(&self, state: &mut ClientState) {
        let Some(backend) = self.inner.persistence.clone() else {
            return;
        };
        if let Some(pending) = state.flush_task.take() {
            pending.abort();
        }

        let debounce = Duration::from_millis(state.config.persistence.flush_debounce_ms);
        let storage_key = state.config.persistence.storage_key.clone();
        let weak = Arc::downgrade(&self.inner);
        let task = async move {
            tokio::time::sleep(debounce).await;
            let payload = {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let client = QueryClient { inner };
                let entries = client.dehydrate();
                encode_entries(&entries)
            };
            match payload {
                Ok(bytes) => write_payload(backend.as_ref(), &storage_key, bytes).await,
                Err(error) => {
                    warn!(storage_key = %storage_key, error = %error, "Failed to encode cache for persistence")
                }
            }
        };
        state.flush_task = spawn_background("flush", task);
    }

    /// Write the table to the backend now, cancelling any pending debounced
    /// flush. A no-op without a backend.
    #[instrument(skip(self))]
    pub async fn flush_now(&self) -> Result<(), PersistenceError> {
        let Some(backend) = self.inner.persistence.clone() else {
            return Ok(());
        };
        let (storage_key, entries) = {
            let mut state = self.lock("flush_now");
            if let Some(pending) = state.flush_task.take() {
                pending.abort();
            }
            (
                state.config.persistence.storage_key.clone(),
                state.store.dehydrate(),
            )
        };
        let bytes = encode_entries(&entries)?;
        let size = bytes.len();
        backend.set(&storage_key, bytes).await?;
        debug!(storage_key = %storage_key, entries = entries.len(), bytes = size, "Cache flushed");
        Ok(())
    }

    /// Load the persisted table, replacing the in-memory one. Returns whether
    /// anything was found.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> Result<bool, PersistenceError> {
        let Some(backend) = self.inner.persistence.clone() else {
            return Ok(false);
        };
        let storage_key = self.config().persistence.storage_key;
        let Some(bytes) = backend.get(&storage_key).await? else {
            debug!(storage_key = %storage_key, "Nothing persisted to restore");
            return Ok(false);
        };
        let entries = decode_entries(&bytes).inspect_err(|error| {
            warn!(storage_key = %storage_key, error = %error, "Persisted cache is unreadable; ignoring it");
        })?;
        self.hydrate(entries);
        Ok(true)
    }

    /// Serializable copy of the entry table.
    pub fn dehydrate(&self) -> BTreeMap<KeyHash, PersistedEntry> {
        self.lock("dehydrate").store.dehydrate()
    }

    /// Replace the entry table. Running fetches are left alone; the selector
    /// memo is dropped.
    pub fn hydrate(&self, entries: BTreeMap<KeyHash, PersistedEntry>) {
        let count = entries.len();
        {
            let mut state = self.lock("hydrate");
            state.store.hydrate(entries);
            self.inner.selectors.clear();
            state.evict_lru();
            self.settle(&mut state);
        }
        info!(entries = count, "Cache hydrated");
    }

    pub fn export_snapshot(&self) -> CacheSnapshot {
        CacheSnapshot::new(self.now(), self.dehydrate())
    }

    pub fn import_snapshot(&self, snapshot: CacheSnapshot) {
        debug!(
            version = snapshot.version,
            created_at = snapshot.created_at,
            "Importing cache snapshot"
        );
        self.hydrate(snapshot.entries);
    }

    /// Compare `version` with the one stored by the previous run. On a
    /// mismatch the cache is cleared when `clear_on_mismatch` is set, and the
    /// new version is recorded. Peers are told the version either way.
    #[instrument(skip(self))]
    pub async fn guard_version(
        &self,
        version: &str,
        clear_on_mismatch: bool,
    ) -> Result<VersionCheck, PersistenceError> {
        let storage_key = self.config().persistence.storage_key;
        let key = version_key(&storage_key);
        let backend = self.inner.persistence.clone();

        let previous = match &backend {
            Some(backend) => backend
                .get(&key)
                .await?
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            None => None,
        };
        let mismatched = previous.as_deref() != Some(version);

        self.lock("guard_version").version_guard = Some(VersionGuard {
            version: version.to_string(),
            clear_on_mismatch,
        });

        if mismatched {
            info!(
                previous = previous.as_deref().unwrap_or("none"),
                version,
                clear_on_mismatch,
                "Cache version changed"
            );
            if clear_on_mismatch {
                self.clear();
            }
            if let Some(backend) = &backend {
                backend
                    .set(&key, Bytes::from(version.to_string()))
                    .await?;
            }
        }

        self.broadcast(SyncKind::Version {
            version: version.to_string(),
        });
        Ok(VersionCheck {
            previous,
            mismatched,
        })
    }
}

async fn write_payload(
    backend: &dyn crate::persist::PersistenceBackend,
    storage_key: &str,
    bytes: Bytes,
) {
    let size = bytes.len();
    match backend.set(storage_key, bytes).await {
        Ok(()) => debug!(storage_key = %storage_key, bytes = size, "Cache flushed"),
        Err(error) => warn!(storage_key = %storage_key, error = %error, "Cache flush failed"),
    }
}
