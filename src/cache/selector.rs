//! Memoized selectors.
//!
//! Memo entries are keyed by the identity of the selector and of the input
//! value, not by structural equality. Eviction is by insertion order.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::data::QueryData;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::selector";

/// A projection over cached data. Identity is the `Arc` allocation.
pub type Selector = Arc<dyn Fn(&QueryData) -> QueryData + Send + Sync>;

struct MemoEntry {
    // Held so the identities in the memo key cannot be reused while cached.
    _selector: Selector,
    _input: QueryData,
    output: QueryData,
}

pub struct SelectorMemo {
    entries: Mutex<Option<LruCache<(usize, usize), MemoEntry>>>,
}

impl SelectorMemo {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(NonZeroUsize::new(max_entries).map(LruCache::new)),
        }
    }

    /// Run `selector` over `input`, reusing the previous output when the same
    /// selector already ran over the same input allocation.
    pub fn select(&self, selector: &Selector, input: &QueryData) -> QueryData {
        let Some(input_id) = identity(input) else {
            return selector(input);
        };
        let key = (Arc::as_ptr(selector) as *const () as usize, input_id);

        {
            let guard = mutex_lock(&self.entries, SOURCE, "select.lookup");
            if let Some(hit) = guard.as_ref().and_then(|cache| cache.peek(&key)) {
                return hit.output.clone();
            }
        }

        let output = selector(input);
        if let Some(cache) = mutex_lock(&self.entries, SOURCE, "select.store").as_mut() {
            // `push` evicts the oldest insertion; lookups use `peek` so hits
            // never reorder.
            cache.push(
                key,
                MemoEntry {
                    _selector: selector.clone(),
                    _input: input.clone(),
                    output: output.clone(),
                },
            );
        }
        output
    }

    pub fn clear(&self) {
        if let Some(cache) = mutex_lock(&self.entries, SOURCE, "clear").as_mut() {
            cache.clear();
        }
    }

    pub fn resize(&self, max_entries: usize) {
        let mut guard = mutex_lock(&self.entries, SOURCE, "resize");
        match (guard.as_mut(), NonZeroUsize::new(max_entries)) {
            (Some(cache), Some(cap)) => cache.resize(cap),
            (None, Some(cap)) => *guard = Some(LruCache::new(cap)),
            (_, None) => *guard = None,
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len")
            .as_ref()
            .map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Containers are memoized by allocation; scalars are cheap to recompute.
fn identity(data: &QueryData) -> Option<usize> {
    match data {
        QueryData::Array(items) => Some(Arc::as_ptr(items) as *const () as usize),
        QueryData::Object(fields) => Some(Arc::as_ptr(fields) as *const () as usize),
        _ => None,
    }
}
