use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use yokai_query::cache::{Counter, KeyPart, SharedPart};
use yokai_query::{
    ClientConfig, FetchOptions, ManualClock, QueryClient, QueryData, QueryError, QueryKey,
    QueryStatus, SetDataOptions, query_key,
};

fn client(config: ClientConfig, clock: &Arc<ManualClock>) -> QueryClient {
    QueryClient::builder()
        .config(config)
        .clock(clock.clone())
        .build()
}

fn quiet_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.gc_interval_ms = 0;
    config
}

fn counted(calls: &Arc<AtomicUsize>, value: serde_json::Value) -> FetchOptions {
    let calls = calls.clone();
    FetchOptions::new(move |_| {
        let calls = calls.clone();
        let value = value.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryData::from_json(value))
        }
    })
}

#[tokio::test]
async fn many_callers_share_one_network_call() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["todos", json!({"status": "open"})];

    let fetches = (0..5).map(|_| client.fetch_query(&key, counted(&calls, json!([1, 2, 3]))));
    let results = futures::future::join_all(fetches).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert!(result.as_ref().unwrap().ptr_eq(first));
    }
    let metrics = client.metrics();
    assert_eq!(metrics.fetches, 1);
    assert_eq!(metrics.dedupes, 4);
}

#[tokio::test]
async fn object_field_order_does_not_split_the_cache() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    let a = query_key!["search", json!({"q": "rust", "page": 1})];
    let b = query_key!["search", json!({"page": 1, "q": "rust"})];
    client.fetch_query(&a, counted(&calls, json!("hit"))).await.unwrap();
    client.fetch_query(&b, counted(&calls, json!("hit"))).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.metrics().hits, 1);
}

#[tokio::test]
async fn circular_keys_are_rejected_before_fetching() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    let shared = SharedPart::new(KeyPart::Null);
    shared.set(KeyPart::List(vec![KeyPart::Shared(shared.clone())]));
    let key = QueryKey::Seq(vec![KeyPart::from("loop"), KeyPart::Shared(shared.clone())]);

    let error = client
        .fetch_query(&key, counted(&calls, json!(null)))
        .await
        .unwrap_err();
    assert!(matches!(error, QueryError::CircularKey(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Break the cycle so the parts can be freed.
    shared.set(KeyPart::Null);
}

#[tokio::test]
async fn refetch_keeps_unchanged_subtrees() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let key = query_key!["board"];
    let calls = Arc::new(AtomicUsize::new(0));

    let before = client
        .fetch_query(
            &key,
            counted(&calls, json!({"columns": [{"id": 1}, {"id": 2}], "title": "v1"})),
        )
        .await
        .unwrap();
    clock.advance(60_000);
    let after = client
        .fetch_query(
            &key,
            counted(&calls, json!({"columns": [{"id": 1}, {"id": 2}], "title": "v2"})),
        )
        .await
        .unwrap();

    assert!(!after.ptr_eq(&before));
    let columns = |data: &QueryData| data.get("columns").cloned().unwrap();
    assert!(columns(&after).ptr_eq(&columns(&before)));
    assert_eq!(after.get("title").and_then(QueryData::as_str), Some("v2"));
}

#[tokio::test]
async fn least_recently_used_entry_is_evicted() {
    let clock = Arc::new(ManualClock::new(10_000));
    let mut config = quiet_config();
    config.max_entries = 2;
    let client = client(config, &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    client.fetch_query(&query_key!["a"], counted(&calls, json!(1))).await.unwrap();
    clock.advance(10);
    client.fetch_query(&query_key!["b"], counted(&calls, json!(2))).await.unwrap();
    clock.advance(10);
    // Fresh hit refreshes the access time of "a".
    client.fetch_query(&query_key!["a"], counted(&calls, json!(1))).await.unwrap();
    clock.advance(10);
    client.fetch_query(&query_key!["c"], counted(&calls, json!(3))).await.unwrap();

    assert!(client.get_query_data(&query_key!["a"]).unwrap().is_some());
    assert!(client.get_query_data(&query_key!["b"]).unwrap().is_none());
    assert!(client.get_query_data(&query_key!["c"]).unwrap().is_some());
    assert_eq!(client.metrics().get(Counter::LruEvictions), 1);
}

#[tokio::test]
async fn garbage_collection_respects_cache_time() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));

    client
        .fetch_query(&query_key!["short"], counted(&calls, json!(1)).cache_time_ms(1_000))
        .await
        .unwrap();
    client
        .fetch_query(&query_key!["long"], counted(&calls, json!(2)).cache_time_ms(60_000))
        .await
        .unwrap();

    clock.advance(5_000);
    assert_eq!(client.gc(), 1);
    assert!(client.get_query_data(&query_key!["short"]).unwrap().is_none());
    assert!(client.get_query_data(&query_key!["long"]).unwrap().is_some());
}

#[tokio::test]
async fn invalidated_entry_refetches_on_next_read() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["settings"];

    client.fetch_query(&key, counted(&calls, json!({"theme": "dark"}))).await.unwrap();
    client.invalidate(&key).unwrap();

    let state = client.get_query_state(&key).unwrap().unwrap();
    assert!(state.is_stale);
    assert_eq!(state.status, QueryStatus::Success);
    assert!(state.data.is_some());

    client.fetch_query(&key, counted(&calls, json!({"theme": "light"}))).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn batch_commits_one_transition() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let start = client.snapshot().revision;

    client.batch(|| {
        for id in 0..3 {
            client
                .set_query_data(&query_key!["user", id], QueryData::from(id), SetDataOptions::default())
                .unwrap();
        }
    });

    let snapshot = client.snapshot();
    assert_eq!(snapshot.revision, start + 1);
    assert_eq!(snapshot.query_keys.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn polling_refetches_once_data_goes_stale() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["ticker"];

    client
        .fetch_query(
            &key,
            counted(&calls, json!(1))
                .stale_time_ms(1_000)
                .refetch_interval_ms(100),
        )
        .await
        .unwrap();

    // Fresh data is served from cache on each tick.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(5_000);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    client.clear();
    clock.advance(5_000);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn tagged_fetches_can_be_cancelled() {
    let clock = Arc::new(ManualClock::new(10_000));
    let client = client(quiet_config(), &clock);
    let key = query_key!["slow"];

    let fetch = client.fetch_query(
        &key,
        FetchOptions::new(|token: tokio_util::sync::CancellationToken| async move {
            token.cancelled().await;
            Ok(QueryData::Null)
        })
        .tags(["reports"]),
    );
    let cancel = async {
        tokio::task::yield_now().await;
        client.cancel_by_tags(["reports"])
    };
    let (result, cancelled) = tokio::join!(fetch, cancel);

    assert_eq!(cancelled, 1);
    assert!(result.unwrap_err().is_cancelled());
    let state = client.get_query_state(&key).unwrap().unwrap();
    assert_eq!(state.status, QueryStatus::Aborted);
    assert_eq!(client.metrics().aborts, 1);
}
