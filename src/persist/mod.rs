//! Persistence bridge.
//!
//! The engine writes the entry table (minus fetchers, errors and meta) to a
//! pluggable byte store under `storage_key`, and restores it on startup.
//! Failures here are reported to the caller of the backend only; the engine
//! itself logs them and keeps the in-memory table authoritative.

mod backend;
mod snapshot;

pub use backend::{FileBackend, MemoryBackend, PersistenceBackend};
pub use snapshot::{CacheSnapshot, SNAPSHOT_VERSION, decode_entries, encode_entries};

use std::sync::Arc;

use crate::config::{PersistenceConfig, PersistenceMode};

/// Backend implied by the configured mode, if any.
pub(crate) fn backend_for(config: &PersistenceConfig) -> Option<Arc<dyn PersistenceBackend>> {
    match config.mode {
        PersistenceMode::None => None,
        PersistenceMode::Session => Some(Arc::new(MemoryBackend::new())),
        PersistenceMode::Durable => config
            .path
            .as_ref()
            .map(|path| Arc::new(FileBackend::new(path)) as Arc<dyn PersistenceBackend>),
    }
}

/// Backend key under which the cache version string is stored.
pub fn version_key(storage_key: &str) -> String {
    format!("{storage_key}::version")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn mode_selects_backend() {
        let mut config = PersistenceConfig::default();
        assert!(backend_for(&config).is_none());

        config.mode = PersistenceMode::Session;
        assert!(backend_for(&config).is_some());

        config.mode = PersistenceMode::Durable;
        assert!(backend_for(&config).is_none());
        config.path = Some(PathBuf::from("/tmp/yokai-cache"));
        assert!(backend_for(&config).is_some());
    }

    #[test]
    fn version_key_is_namespaced() {
        assert_eq!(version_key("__query_cache__"), "__query_cache__::version");
    }
}
