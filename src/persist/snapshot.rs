use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::{KeyHash, PersistedEntry};
use crate::error::PersistenceError;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Portable export of the entry table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub version: u32,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub entries: BTreeMap<KeyHash, PersistedEntry>,
}

impl CacheSnapshot {
    pub fn new(created_at: u64, entries: BTreeMap<KeyHash, PersistedEntry>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at,
            entries,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, PersistenceError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistenceError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Encode the table in the persisted payload format.
pub fn encode_entries(entries: &BTreeMap<KeyHash, PersistedEntry>) -> Result<Bytes, PersistenceError> {
    Ok(Bytes::from(serde_json::to_vec(entries)?))
}

pub fn decode_entries(bytes: &[u8]) -> Result<BTreeMap<KeyHash, PersistedEntry>, PersistenceError> {
    Ok(serde_json::from_slice(bytes)?)
}
