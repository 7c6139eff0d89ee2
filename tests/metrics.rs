use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serial_test::serial;
use yokai_query::{
    ClientConfig, FetchOptions, ManualClock, MutateOptions, OptimisticUpdate, QueryClient,
    QueryData, QueryError, query_key,
};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        snapshotter
    })
}

fn counters() -> HashMap<String, u64> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter_map(|(key, _, _, value)| match value {
            DebugValue::Counter(count) => Some((key.key().name().to_string(), count)),
            _ => None,
        })
        .collect()
}

fn names() -> Vec<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect()
}

fn client() -> QueryClient {
    let mut config = ClientConfig::default();
    config.gc_interval_ms = 0;
    QueryClient::builder()
        .config(config)
        .clock(Arc::new(ManualClock::new(1_000)))
        .build()
}

#[tokio::test]
#[serial]
async fn fetch_paths_emit_expected_metric_keys() {
    snapshotter();
    let client = client();
    let key = query_key!["metrics", "fetch"];

    client
        .fetch_query(&key, FetchOptions::new(|_| async { Ok(QueryData::from(1)) }))
        .await
        .unwrap();
    client
        .fetch_query(&key, FetchOptions::new(|_| async { Ok(QueryData::from(1)) }))
        .await
        .unwrap();
    client.invalidate(&key).unwrap();

    let names = names();
    for expected in [
        "yokai_query_fetches_total",
        "yokai_query_misses_total",
        "yokai_query_hits_total",
        "yokai_query_invalidations_total",
        "yokai_query_fetch_ms",
        "yokai_query_entries",
    ] {
        assert!(names.iter().any(|name| name == expected), "missing metric {expected}");
    }
}

#[tokio::test]
#[serial]
async fn mutation_counters_match_client_metrics() {
    snapshotter();
    let before = counters();
    let client = client();
    let key = query_key!["metrics", "mutation"];

    let _ = client
        .mutate(
            MutateOptions::new(|_, _| async { Err(QueryError::mutation("nope")) })
                .optimistic(OptimisticUpdate::new(key, |_| QueryData::from(1))),
        )
        .await;

    let after = counters();
    let delta = |name: &str| {
        after.get(name).copied().unwrap_or(0) - before.get(name).copied().unwrap_or(0)
    };
    let local = client.metrics();
    assert_eq!(delta("yokai_query_mutations_total"), local.mutations);
    assert_eq!(delta("yokai_query_optimistic_applied_total"), local.optimistic_applied);
    assert_eq!(
        delta("yokai_query_optimistic_rolled_back_total"),
        local.optimistic_rolled_back
    );
    assert_eq!(local.optimistic_rolled_back, 1);
}
