//! Authoritative entry table.
//!
//! Writes outside a batch commit immediately and count as one transition
//! each. Inside a batch they land in a draft copy of the table that is
//! committed as a single transition when the outermost batch ends.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::data::QueryData;
use super::entry::{Entry, PersistedEntry};
use super::keys::{KeyHash, QueryKey};
use super::registry::TagIndex;
use super::sharing::replace_equal_deep;

#[derive(Debug)]
pub struct EntryStore {
    committed: HashMap<KeyHash, Entry>,
    draft: Option<HashMap<KeyHash, Entry>>,
    batch_depth: usize,
    /// A flush was requested inside the current batch.
    flush_in_batch: bool,
    /// A flush is owed to the persistence layer.
    flush_due: bool,
    revision: u64,
    keys: HashMap<KeyHash, QueryKey>,
    tags: TagIndex,
    next_seq: u64,
    structural_sharing: bool,
}

impl EntryStore {
    pub fn new(structural_sharing: bool) -> Self {
        Self {
            committed: HashMap::new(),
            draft: None,
            batch_depth: 0,
            flush_in_batch: false,
            flush_due: false,
            revision: 0,
            keys: HashMap::new(),
            tags: TagIndex::new(),
            next_seq: 0,
            structural_sharing,
        }
    }

    pub fn set_structural_sharing(&mut self, enabled: bool) {
        self.structural_sharing = enabled;
    }

    fn table(&self) -> &HashMap<KeyHash, Entry> {
        self.draft.as_ref().unwrap_or(&self.committed)
    }

    fn table_mut(&mut self) -> &mut HashMap<KeyHash, Entry> {
        if self.batch_depth > 0 {
            let committed = &self.committed;
            self.draft.get_or_insert_with(|| committed.clone())
        } else {
            &mut self.committed
        }
    }

    fn wrote(&mut self) {
        if self.batch_depth == 0 {
            self.revision += 1;
        }
    }

    /// Number of committed transitions so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, hash: &str) -> Option<&Entry> {
        self.table().get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.table().contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn hashes(&self) -> Vec<KeyHash> {
        let mut hashes: Vec<_> = self.table().keys().cloned().collect();
        hashes.sort();
        hashes
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyHash, &Entry)> {
        self.table().iter()
    }

    /// Apply `f` to the entry for `hash`, creating it with defaults first if
    /// needed.
    pub fn upsert<R>(
        &mut self,
        hash: &str,
        key_string: impl FnOnce() -> String,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        let seq = self.next_seq;
        let table = self.table_mut();
        let created = !table.contains_key(hash);
        let entry = table
            .entry(hash.to_string())
            .or_insert_with(|| Entry::new(key_string(), seq));
        let result = f(entry);
        if created {
            self.next_seq += 1;
        }
        self.wrote();
        result
    }

    /// Apply `f` only if the entry exists.
    pub fn update<R>(&mut self, hash: &str, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        if !self.contains(hash) {
            return None;
        }
        let result = self.table_mut().get_mut(hash).map(f);
        self.wrote();
        result
    }

    /// Write new data, sharing unchanged subtrees with the previous value
    /// when structural sharing is enabled.
    pub fn set_data(
        &mut self,
        hash: &str,
        key_string: impl FnOnce() -> String,
        data: QueryData,
        f: impl FnOnce(&mut Entry),
    ) -> QueryData {
        let sharing = self.structural_sharing;
        self.upsert(hash, key_string, |entry| {
            let next = match (&entry.data, sharing) {
                (Some(prev), true) => replace_equal_deep(prev, data),
                _ => data,
            };
            entry.data = Some(next.clone());
            f(entry);
            next
        })
    }

    /// Put back an exact earlier value, bypassing structural sharing.
    pub fn restore_data(
        &mut self,
        hash: &str,
        key_string: impl FnOnce() -> String,
        data: Option<QueryData>,
        now: u64,
    ) {
        self.upsert(hash, key_string, |entry| {
            entry.data = data;
            entry.accessed_at = Some(now);
        });
    }

    pub fn touch(&mut self, hash: &str, now: u64) {
        self.update(hash, |entry| entry.accessed_at = Some(now));
    }

    /// Mark maximally stale and clear the error. Data is kept.
    pub fn invalidate(&mut self, hash: &str) -> bool {
        self.update(hash, |entry| {
            entry.fetched_at = Some(0);
            entry.error = None;
        })
        .is_some()
    }

    /// Drop the entry together with its tag and key bookkeeping.
    pub fn remove(&mut self, hash: &str) -> Option<Entry> {
        self.tags.unregister(&hash.to_string());
        self.keys.remove(hash);
        if !self.contains(hash) {
            return None;
        }
        let removed = self.table_mut().remove(hash);
        self.wrote();
        removed
    }

    /// Entries older than their cache time.
    pub fn expired(&self, now: u64) -> Vec<KeyHash> {
        let mut hashes: Vec<_> = self
            .table()
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(hash, _)| hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    /// Least recently touched entries beyond `max_entries`, oldest first.
    pub fn lru_overflow(&self, max_entries: usize) -> Vec<KeyHash> {
        let table = self.table();
        if table.len() <= max_entries {
            return Vec::new();
        }
        let mut ranked: Vec<_> = table
            .iter()
            .map(|(hash, entry)| (entry.last_touched(), entry.seq, hash))
            .collect();
        ranked.sort();
        ranked
            .into_iter()
            .take(table.len() - max_entries)
            .map(|(_, _, hash)| hash.clone())
            .collect()
    }

    /// Entries whose display string starts with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<KeyHash> {
        let mut hashes: Vec<_> = self
            .table()
            .iter()
            .filter(|(_, entry)| entry.key_string.starts_with(prefix))
            .map(|(hash, _)| hash.clone())
            .collect();
        hashes.sort();
        hashes
    }

    pub fn keys_for_tags<'a, I>(&self, tags: I) -> BTreeSet<KeyHash>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.tags.keys_for_tags(tags)
    }

    /// Replace the key's tag set. `None` leaves the index untouched.
    pub fn sync_tags(&mut self, hash: &str, tags: Option<&BTreeSet<String>>) {
        let Some(tags) = tags else {
            return;
        };
        let hash = hash.to_string();
        self.tags.unregister(&hash);
        self.tags.register(&hash, tags.iter().cloned());
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.tags
    }

    /// Keep the caller's original key so background work can reuse it.
    pub fn remember_key(&mut self, hash: &str, key: &QueryKey) {
        self.keys.insert(hash.to_string(), key.clone());
    }

    /// Original key for a hash; falls back to the hash as a string key, which
    /// hashes back to itself.
    pub fn resolve_key(&self, hash: &str) -> QueryKey {
        self.keys
            .get(hash)
            .cloned()
            .unwrap_or_else(|| QueryKey::Str(hash.to_string()))
    }

    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
    }

    /// Leave one batch level. Returns `true` when this ended the outermost
    /// batch and a draft was committed.
    pub fn end_batch(&mut self) -> bool {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        if self.batch_depth > 0 {
            return false;
        }
        if std::mem::take(&mut self.flush_in_batch) {
            self.flush_due = true;
        }
        match self.draft.take() {
            Some(draft) => {
                self.committed = draft;
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    /// Ask for a persistence flush. Inside a batch this is deferred until the
    /// outermost batch ends so the whole batch yields one flush.
    pub fn request_flush(&mut self) {
        if self.batch_depth > 0 {
            self.flush_in_batch = true;
        } else {
            self.flush_due = true;
        }
    }

    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.flush_due)
    }

    /// Serializable view of every entry.
    pub fn dehydrate(&self) -> BTreeMap<KeyHash, PersistedEntry> {
        self.table()
            .iter()
            .map(|(hash, entry)| (hash.clone(), entry.to_persisted()))
            .collect()
    }

    /// Replace the table with persisted entries and rebuild the tag index.
    pub fn hydrate(&mut self, entries: BTreeMap<KeyHash, PersistedEntry>) {
        self.tags.clear();
        self.keys.clear();
        let mut table = HashMap::with_capacity(entries.len());
        for (hash, persisted) in entries {
            let entry = Entry::from_persisted(&hash, persisted, self.next_seq);
            self.next_seq += 1;
            self.tags.register(&hash, entry.tags.iter().cloned());
            table.insert(hash, entry);
        }
        *self.table_mut() = table;
        self.wrote();
    }

    /// Drop every entry and index.
    pub fn clear(&mut self) {
        self.tags.clear();
        self.keys.clear();
        self.table_mut().clear();
        self.wrote();
    }
}
