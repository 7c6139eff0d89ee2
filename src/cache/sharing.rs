//! Structural sharing between successive values of one entry.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::data::QueryData;

/// Merge `next` against `prev`, reusing every subtree of `prev` that is deeply
/// equal to its counterpart in `next`.
///
/// When the two trees are deeply equal the result is `prev` itself (same
/// container identity). Otherwise a fresh container is built whose unchanged
/// children are still shared with `prev`.
pub fn replace_equal_deep(prev: &QueryData, next: QueryData) -> QueryData {
    match (prev, next) {
        (QueryData::Array(old), QueryData::Array(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let new = Arc::unwrap_or_clone(new);
            let same_len = old.len() == new.len();
            let mut unchanged = same_len;
            let merged: Vec<QueryData> = new
                .into_iter()
                .enumerate()
                .map(|(idx, item)| match old.get(idx) {
                    Some(before) => {
                        let shared = replace_equal_deep(before, item);
                        unchanged &= shared.ptr_eq(before);
                        shared
                    }
                    None => item,
                })
                .collect();
            if unchanged {
                prev.clone()
            } else {
                QueryData::Array(Arc::new(merged))
            }
        }
        (QueryData::Object(old), QueryData::Object(new)) => {
            if Arc::ptr_eq(old, &new) {
                return prev.clone();
            }
            let new = Arc::unwrap_or_clone(new);
            let mut unchanged = old.len() == new.len();
            let merged: BTreeMap<String, QueryData> = new
                .into_iter()
                .map(|(name, value)| match old.get(&name) {
                    Some(before) => {
                        let shared = replace_equal_deep(before, value);
                        unchanged &= shared.ptr_eq(before);
                        (name, shared)
                    }
                    None => {
                        unchanged = false;
                        (name, value)
                    }
                })
                .collect();
            if unchanged {
                prev.clone()
            } else {
                QueryData::Object(Arc::new(merged))
            }
        }
        (_, next) if *prev == next => prev.clone(),
        (_, next) => next,
    }
}
