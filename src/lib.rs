//! Yokai Query
//!
//! A client-side cache for asynchronous data:
//!
//! - **Queries**: single-flight fetching, stale-while-revalidate, polling,
//!   retries and cancellation ([`QueryClient::fetch_query`])
//! - **Infinite queries**: bidirectional page lists
//!   ([`QueryClient::fetch_infinite_query`])
//! - **Mutations**: optimistic updates with exact rollback and invalidation
//!   cascades ([`QueryClient::mutate`])
//! - **Persistence**: debounced snapshots to a [`persist::PersistenceBackend`]
//! - **Sync**: invalidations replayed across instances over a
//!   [`sync::SyncChannel`]
//!
//! ```no_run
//! use yokai_query::{FetchOptions, QueryClient, QueryData, QueryError, query_key};
//!
//! # async fn demo() -> Result<(), QueryError> {
//! let client = QueryClient::new();
//! let todos = client
//!     .fetch_query(
//!         &query_key!["todos", 1],
//!         FetchOptions::new(|_token| async { Ok(QueryData::from("buy milk")) })
//!             .stale_time_ms(30_000),
//!     )
//!     .await?;
//! # let _ = todos;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod persist;
pub mod sync;
pub mod telemetry;

pub use cache::{
    Clock, InfiniteData, ManualClock, Metrics, PageDirection, QueryData, QueryKey, QueryState,
    QueryStatus, RetryPolicy, Selector, SystemClock,
};
pub use client::{
    CachePatch, FetchOptions, InfiniteOptions, MutateOptions, MutationRecord, MutationStatus,
    OptimisticUpdate, QueryClient, QueryClientBuilder, SetDataOptions, StoreSnapshot,
};
pub use config::ClientConfig;
pub use error::{PersistenceError, QueryError};
