//! Cache entry records and their serializable forms.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::data::QueryData;
use super::retry::RetrySettings;
use crate::error::QueryError;

pub const DEFAULT_STALE_TIME_MS: u64 = 30_000;
pub const DEFAULT_CACHE_TIME_MS: u64 = 300_000;

/// Stored record for one key hash.
#[derive(Debug, Clone)]
pub struct Entry {
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    /// Caller-supplied annotation; never persisted.
    pub meta: Option<QueryData>,
    pub key_string: String,
    /// Epoch ms of the last successful write. `Some(0)` marks an invalidated
    /// entry; `None` an entry that never loaded.
    pub fetched_at: Option<u64>,
    pub accessed_at: Option<u64>,
    pub stale_time: u64,
    pub cache_time: u64,
    pub refetch_interval_ms: Option<u64>,
    pub tags: BTreeSet<String>,
    pub retry: Option<RetrySettings>,
    pub last_abort_at: Option<u64>,
    /// Insertion order, used to break LRU ties.
    pub(crate) seq: u64,
}

impl Entry {
    pub(crate) fn new(key_string: String, seq: u64) -> Self {
        Self {
            data: None,
            error: None,
            meta: None,
            key_string,
            fetched_at: None,
            accessed_at: None,
            stale_time: DEFAULT_STALE_TIME_MS,
            cache_time: DEFAULT_CACHE_TIME_MS,
            refetch_interval_ms: None,
            tags: BTreeSet::new(),
            retry: None,
            last_abort_at: None,
            seq,
        }
    }

    /// Age since the last successful fetch exceeds `stale_time`. Invalidated
    /// and never-loaded entries are always stale.
    pub fn is_stale(&self, now: u64) -> bool {
        match self.fetched_at {
            Some(fetched_at) if fetched_at > 0 => {
                now.saturating_sub(fetched_at) > self.stale_time
            }
            _ => true,
        }
    }

    /// Data present and within `stale_time`.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.data.is_some() && !self.is_stale(now)
    }

    /// Older than `cache_time`. Entries that never loaded or were invalidated
    /// are not expired by age.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.fetched_at {
            Some(fetched_at) if fetched_at > 0 => {
                now.saturating_sub(fetched_at) > self.cache_time
            }
            _ => false,
        }
    }

    /// Timestamp used for least-recently-used ordering.
    pub(crate) fn last_touched(&self) -> u64 {
        self.accessed_at.or(self.fetched_at).unwrap_or(0)
    }

    pub fn state(&self, now: u64, is_fetching: bool) -> QueryState {
        let status = match (&self.error, &self.data) {
            (Some(error), _) if error.is_cancelled() => QueryStatus::Aborted,
            (Some(_), _) => QueryStatus::Error,
            (None, Some(_)) => QueryStatus::Success,
            (None, None) => QueryStatus::Idle,
        };
        QueryState {
            status,
            data: self.data.clone(),
            error: self.error.clone(),
            fetched_at: self.fetched_at,
            accessed_at: self.accessed_at,
            last_abort_at: self.last_abort_at,
            is_stale: self.is_stale(now),
            is_fetching,
        }
    }

    pub(crate) fn to_persisted(&self) -> PersistedEntry {
        PersistedEntry {
            data: self.data.clone(),
            key_string: Some(self.key_string.clone()),
            fetched_at: self.fetched_at,
            accessed_at: self.accessed_at,
            stale_time: Some(self.stale_time),
            cache_time: Some(self.cache_time),
            refetch_interval_ms: self.refetch_interval_ms,
            tags: self.tags.iter().cloned().collect(),
            retry: self.retry,
            last_abort_at: self.last_abort_at,
        }
    }

    pub(crate) fn from_persisted(hash: &str, persisted: PersistedEntry, seq: u64) -> Self {
        Self {
            data: persisted.data,
            error: None,
            meta: None,
            key_string: persisted.key_string.unwrap_or_else(|| hash.to_string()),
            fetched_at: persisted.fetched_at,
            accessed_at: persisted.accessed_at,
            stale_time: persisted.stale_time.unwrap_or(DEFAULT_STALE_TIME_MS),
            cache_time: persisted.cache_time.unwrap_or(DEFAULT_CACHE_TIME_MS),
            refetch_interval_ms: persisted.refetch_interval_ms,
            tags: persisted.tags.into_iter().collect(),
            retry: persisted.retry,
            last_abort_at: persisted.last_abort_at,
            seq,
        }
    }
}

/// Entry without live state (fetcher, error object, meta), as written to
/// persistence backends and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<u64>,
    pub stale_time: Option<u64>,
    pub cache_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refetch_interval_ms: Option<u64>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_abort_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Idle,
    Success,
    Error,
    Aborted,
}

/// Read snapshot of one entry.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<QueryData>,
    pub error: Option<QueryError>,
    pub fetched_at: Option<u64>,
    pub accessed_at: Option<u64>,
    pub last_abort_at: Option<u64>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

/// Which end of an infinite query a page fetch extends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    /// Replace all pages with the fetched one.
    #[default]
    Init,
    Forward,
    Backward,
}

/// Parallel page and page-param lists of an infinite query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InfiniteData {
    pub pages: Vec<QueryData>,
    pub page_params: Vec<QueryData>,
}

impl InfiniteData {
    /// Read the `{pages, pageParams}` object form. Anything else reads as
    /// empty.
    pub fn from_data(data: Option<&QueryData>) -> Self {
        let list = |name: &str| {
            data.and_then(|data| data.get(name))
                .and_then(QueryData::as_array)
                .map(<[QueryData]>::to_vec)
                .unwrap_or_default()
        };
        Self {
            pages: list("pages"),
            page_params: list("pageParams"),
        }
    }

    pub fn into_data(self) -> QueryData {
        QueryData::object([
            ("pages", QueryData::array(self.pages)),
            ("pageParams", QueryData::array(self.page_params)),
        ])
    }

    /// Merge a freshly fetched page according to `direction`.
    pub fn apply(&mut self, direction: PageDirection, page: QueryData, param: QueryData) {
        match direction {
            PageDirection::Init => {
                self.pages = vec![page];
                self.page_params = vec![param];
            }
            PageDirection::Forward => {
                self.pages.push(page);
                self.page_params.push(param);
            }
            PageDirection::Backward => {
                self.pages.insert(0, page);
                self.page_params.insert(0, param);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_new_entries() {
        let entry = Entry::new("todos".into(), 0);
        assert_eq!(entry.stale_time, DEFAULT_STALE_TIME_MS);
        assert_eq!(entry.cache_time, DEFAULT_CACHE_TIME_MS);
        assert!(entry.is_stale(0));
        assert_eq!(entry.state(0, false).status, QueryStatus::Idle);
    }

    #[test]
    fn staleness_is_strictly_greater_than_stale_time() {
        let mut entry = Entry::new("todos".into(), 0);
        entry.data = Some(QueryData::from(1));
        entry.fetched_at = Some(1_000);
        entry.stale_time = 1_000;
        assert!(entry.is_fresh(2_000));
        assert!(entry.is_stale(2_001));
    }

    #[test]
    fn invalidated_entries_never_expire_by_age() {
        let mut entry = Entry::new("todos".into(), 0);
        entry.fetched_at = Some(0);
        assert!(!entry.is_expired(u64::MAX));
        entry.fetched_at = Some(10);
        entry.cache_time = 5;
        assert!(entry.is_expired(16));
    }

    #[test]
    fn aborted_status_wins_over_data() {
        let mut entry = Entry::new("todos".into(), 0);
        entry.data = Some(QueryData::from(1));
        entry.error = Some(QueryError::Cancelled);
        assert_eq!(entry.state(0, false).status, QueryStatus::Aborted);
    }

    #[test]
    fn persisted_form_drops_error_and_restores_defaults() {
        let mut entry = Entry::new("todos".into(), 3);
        entry.error = Some(QueryError::fetch("boom"));
        entry.tags.insert("list".into());
        let json = serde_json::to_value(entry.to_persisted()).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["keyString"], "todos");

        let restored = Entry::from_persisted("todos", PersistedEntry::default(), 0);
        assert_eq!(restored.key_string, "todos");
        assert_eq!(restored.stale_time, DEFAULT_STALE_TIME_MS);
    }

    #[test]
    fn pages_merge_by_direction() {
        let mut pages = InfiniteData::default();
        pages.apply(PageDirection::Init, "p0".into(), 0.into());
        pages.apply(PageDirection::Forward, "p1".into(), 1.into());
        pages.apply(PageDirection::Backward, "p-1".into(), (-1).into());
        let round_trip = InfiniteData::from_data(Some(&pages.clone().into_data()));
        assert_eq!(round_trip, pages);
        assert_eq!(
            pages.page_params,
            vec![QueryData::from(-1), QueryData::from(0), QueryData::from(1)]
        );
    }
}
