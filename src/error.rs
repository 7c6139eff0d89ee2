//! Error taxonomy for the query engine.
//!
//! `QueryError` travels through shared in-flight futures, so it is `Clone`;
//! caller-supplied failures are kept behind an `Arc`.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error accepted from fetchers and mutation functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A query key contained a reference cycle and cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circular value in query key at `{path}`")]
pub struct CircularKeyError {
    pub path: String,
}

/// Errors surfaced by fetches, mutations and key normalization.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    CircularKey(#[from] CircularKeyError),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("fetch failed: {0}")]
    Fetch(Arc<dyn StdError + Send + Sync>),
    #[error("mutation failed: {0}")]
    Mutation(Arc<dyn StdError + Send + Sync>),
    #[error("background task failed: {0}")]
    Task(String),
}

impl QueryError {
    /// Wrap a caller error raised while fetching.
    pub fn fetch(error: impl Into<BoxError>) -> Self {
        Self::Fetch(Arc::from(error.into()))
    }

    /// Wrap a caller error raised by a mutation function.
    pub fn mutation(error: impl Into<BoxError>) -> Self {
        Self::Mutation(Arc::from(error.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Failures of the durable/session persistence layer.
///
/// These never escape cache operations; the engine logs them and keeps the
/// in-memory table authoritative.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode cache payload: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("persistence backend error: {message}")]
    Backend { message: String },
}

impl PersistenceError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// The global tracing subscriber could not be installed.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}
