//! Cache primitives.
//!
//! - **Keys**: normalize [`QueryKey`]s into stable [`KeyHash`]es
//! - **Data**: the [`QueryData`] value tree and structural sharing
//! - **Store**: the [`EntryStore`] table with batching, eviction and the tag
//!   index
//! - **Retry**: [`run_with_retry`] under a [`RetryPolicy`]
//!
//! Everything here is synchronous except the retry driver; orchestration of
//! fetches and mutations lives in [`crate::client`].

mod clock;
mod data;
mod entry;
mod keys;
pub(crate) mod lock;
mod metrics;
mod planner;
mod registry;
mod retry;
mod selector;
mod sharing;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use data::QueryData;
pub use entry::{
    DEFAULT_CACHE_TIME_MS, DEFAULT_STALE_TIME_MS, Entry, InfiniteData, PageDirection,
    PersistedEntry, QueryState, QueryStatus,
};
pub use keys::{KeyHash, KeyPart, QueryKey, SharedPart, hash_key, key_to_string, stable_stringify};
pub(crate) use metrics::{METRIC_ENTRIES, METRIC_FETCH_MS};
pub use metrics::{Counter, Metrics};
pub use planner::InvalidationPlan;
pub use registry::TagIndex;
pub use retry::{DEFAULT_RETRY_DELAY, RetryDelay, RetryPolicy, RetrySettings, run_with_retry};
pub use selector::{Selector, SelectorMemo};
pub use sharing::replace_equal_deep;
pub use store::EntryStore;
