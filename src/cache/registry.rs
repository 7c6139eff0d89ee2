//! Bidirectional tag index.
//!
//! Tracks tag → key hashes and key hash → tags so that bulk invalidation by
//! tag is a lookup, and removing an entry prunes its tags.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::keys::KeyHash;

#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    tag_to_keys: HashMap<String, HashSet<KeyHash>>,
    key_to_tags: HashMap<KeyHash, HashSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tags` to the key's tag set. Existing tags stay.
    pub fn register<I>(&mut self, key: &KeyHash, tags: I)
    where
        I: IntoIterator<Item = String>,
    {
        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
            self.key_to_tags.entry(key.clone()).or_default().insert(tag);
        }
    }

    /// All key hashes carrying any of `tags`, in sorted order.
    pub fn keys_for_tags<'a, I>(&self, tags: I) -> BTreeSet<KeyHash>
    where
        I: IntoIterator<Item = &'a str>,
    {
        tags.into_iter()
            .filter_map(|tag| self.tag_to_keys.get(tag))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn tags_for_key(&self, key: &KeyHash) -> HashSet<String> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    /// Drop a key from every tag bucket, pruning buckets left empty.
    pub fn unregister(&mut self, key: &KeyHash) {
        let Some(tags) = self.key_to_tags.remove(key) else {
            return;
        };
        for tag in tags {
            if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_to_keys.remove(&tag);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }

    pub fn tag_count(&self) -> usize {
        self.tag_to_keys.len()
    }

    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}
