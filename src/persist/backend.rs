use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;

use crate::error::PersistenceError;

/// Byte store used for cache persistence.
#[async_trait]
pub trait PersistenceBackend: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, PersistenceError>;
    async fn set(&self, key: &str, value: Bytes) -> Result<(), PersistenceError>;
}

/// Process-lifetime store; the session-scoped mode.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: DashMap<String, Bytes>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
        Ok(self.values.get(key).map(|value| value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), PersistenceError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

/// One file per key under a directory; the durable mode.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl PersistenceBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &value).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_round_trips() {
        let backend = MemoryBackend::new();
        assert!(backend.get("k").await.unwrap().is_none());
        backend.set("k", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().unwrap(), Bytes::from_static(b"{}"));
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn file_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("nested"));
        assert!(backend.get("__query_cache__").await.unwrap().is_none());

        backend
            .set("__query_cache__", Bytes::from_static(b"[1]"))
            .await
            .unwrap();
        backend
            .set("__query_cache__", Bytes::from_static(b"[2]"))
            .await
            .unwrap();

        assert_eq!(
            backend.get("__query_cache__").await.unwrap().unwrap(),
            Bytes::from_static(b"[2]")
        );
    }

    #[test]
    fn file_names_are_sanitized() {
        let backend = FileBackend::new("/tmp/cache");
        assert_eq!(
            backend.path_for("__query_cache__::version"),
            PathBuf::from("/tmp/cache/__query_cache____version.json")
        );
    }
}
