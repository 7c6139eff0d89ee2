//! Engine counters.
//!
//! Each client keeps its own [`Metrics`] for snapshots; every bump is also
//! forwarded to the global `metrics` recorder.

use metrics::counter;
use serde::Serialize;

pub(crate) const METRIC_FETCH_MS: &str = "yokai_query_fetch_ms";
pub(crate) const METRIC_ENTRIES: &str = "yokai_query_entries";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub background_fetches: u64,
    pub dedupes: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub gc_evictions: u64,
    pub lru_evictions: u64,
    pub prefetched: u64,
    pub mutations: u64,
    pub optimistic_applied: u64,
    pub optimistic_rolled_back: u64,
    pub aborts: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Hits,
    Misses,
    Fetches,
    BackgroundFetches,
    Dedupes,
    Errors,
    Invalidations,
    GcEvictions,
    LruEvictions,
    Prefetched,
    Mutations,
    OptimisticApplied,
    OptimisticRolledBack,
    Aborts,
    Retries,
}

impl Counter {
    pub const ALL: [Counter; 15] = [
        Counter::Hits,
        Counter::Misses,
        Counter::Fetches,
        Counter::BackgroundFetches,
        Counter::Dedupes,
        Counter::Errors,
        Counter::Invalidations,
        Counter::GcEvictions,
        Counter::LruEvictions,
        Counter::Prefetched,
        Counter::Mutations,
        Counter::OptimisticApplied,
        Counter::OptimisticRolledBack,
        Counter::Aborts,
        Counter::Retries,
    ];

    pub fn metric_name(self) -> &'static str {
        match self {
            Counter::Hits => "yokai_query_hits_total",
            Counter::Misses => "yokai_query_misses_total",
            Counter::Fetches => "yokai_query_fetches_total",
            Counter::BackgroundFetches => "yokai_query_background_fetches_total",
            Counter::Dedupes => "yokai_query_dedupes_total",
            Counter::Errors => "yokai_query_errors_total",
            Counter::Invalidations => "yokai_query_invalidations_total",
            Counter::GcEvictions => "yokai_query_gc_evictions_total",
            Counter::LruEvictions => "yokai_query_lru_evictions_total",
            Counter::Prefetched => "yokai_query_prefetched_total",
            Counter::Mutations => "yokai_query_mutations_total",
            Counter::OptimisticApplied => "yokai_query_optimistic_applied_total",
            Counter::OptimisticRolledBack => "yokai_query_optimistic_rolled_back_total",
            Counter::Aborts => "yokai_query_aborts_total",
            Counter::Retries => "yokai_query_retries_total",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Counter::Hits => "Queries answered from cache without waiting on a fetch.",
            Counter::Misses => "Queries that had to start a foreground fetch.",
            Counter::Fetches => "Fetcher runs started.",
            Counter::BackgroundFetches => "Stale-while-revalidate refreshes started.",
            Counter::Dedupes => "Queries joined to an already running fetch.",
            Counter::Errors => "Fetches that failed after all retries.",
            Counter::Invalidations => "Invalidate, prefix and tag invalidation calls.",
            Counter::GcEvictions => "Entries removed after exceeding their cache time.",
            Counter::LruEvictions => "Entries removed to stay within max entries.",
            Counter::Prefetched => "Prefetch requests.",
            Counter::Mutations => "Mutations started.",
            Counter::OptimisticApplied => "Mutations that applied optimistic updates.",
            Counter::OptimisticRolledBack => "Optimistic updates rolled back after failure.",
            Counter::Aborts => "Fetches that ended by cancellation.",
            Counter::Retries => "Retry attempts after a failure.",
        }
    }
}

impl Metrics {
    pub fn bump(&mut self, counter: Counter, by: u64) {
        if by == 0 {
            return;
        }
        *self.slot(counter) += by;
        counter!(counter.metric_name()).increment(by);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        let mut copy = *self;
        *copy.slot(counter)
    }

    fn slot(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::Hits => &mut self.hits,
            Counter::Misses => &mut self.misses,
            Counter::Fetches => &mut self.fetches,
            Counter::BackgroundFetches => &mut self.background_fetches,
            Counter::Dedupes => &mut self.dedupes,
            Counter::Errors => &mut self.errors,
            Counter::Invalidations => &mut self.invalidations,
            Counter::GcEvictions => &mut self.gc_evictions,
            Counter::LruEvictions => &mut self.lru_evictions,
            Counter::Prefetched => &mut self.prefetched,
            Counter::Mutations => &mut self.mutations,
            Counter::OptimisticApplied => &mut self.optimistic_applied,
            Counter::OptimisticRolledBack => &mut self.optimistic_rolled_back,
            Counter::Aborts => &mut self.aborts,
            Counter::Retries => &mut self.retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_updates_matching_slot() {
        let mut metrics = Metrics::default();
        metrics.bump(Counter::Hits, 2);
        metrics.bump(Counter::LruEvictions, 1);
        metrics.bump(Counter::Retries, 0);
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.get(Counter::LruEvictions), 1);
        assert_eq!(metrics.retries, 0);
    }

    #[test]
    fn metric_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.metric_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }
}
