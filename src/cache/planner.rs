//! Invalidation plans.
//!
//! Merges the key, prefix and tag targets of a cascade into one
//! de-duplicated set of key hashes before anything is applied.

use std::collections::BTreeSet;
use std::fmt;

use super::keys::KeyHash;
use super::store::EntryStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Key hashes named directly.
    pub keys: BTreeSet<KeyHash>,
    /// Display-string prefixes.
    pub prefixes: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ keys: {}, prefixes: {}, tags: {} }}",
            self.keys.len(),
            self.prefixes.len(),
            self.tags.len(),
        )
    }
}

impl InvalidationPlan {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.prefixes.is_empty() && self.tags.is_empty()
    }

    /// Resolve every target against the store into one ordered set.
    pub fn resolve(&self, store: &EntryStore) -> BTreeSet<KeyHash> {
        let mut targets = self.keys.clone();
        for prefix in &self.prefixes {
            targets.extend(store.keys_with_prefix(prefix));
        }
        targets.extend(store.keys_for_tags(self.tags.iter().map(String::as_str)));
        targets
    }
}
