use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::json;
use yokai_query::{
    CachePatch, ClientConfig, FetchOptions, ManualClock, MutateOptions, MutationStatus,
    OptimisticUpdate, QueryClient, QueryData, QueryError, SetDataOptions, query_key,
};

fn client() -> QueryClient {
    let mut config = ClientConfig::default();
    config.gc_interval_ms = 0;
    QueryClient::builder()
        .config(config)
        .clock(Arc::new(ManualClock::new(50_000)))
        .build()
}

fn append(title: &'static str) -> impl Fn(Option<&QueryData>) -> QueryData + Send + Sync {
    move |previous| {
        let mut todos: Vec<QueryData> = previous
            .and_then(QueryData::as_array)
            .map(<[QueryData]>::to_vec)
            .unwrap_or_default();
        todos.push(QueryData::from_json(json!({"title": title})));
        QueryData::array(todos)
    }
}

#[tokio::test]
async fn rollback_restores_every_optimistic_key() {
    let client = client();
    let list = query_key!["todos"];
    let count = query_key!["todos", "count"];
    client
        .set_query_data(&list, QueryData::from_json(json!([{"title": "a"}])), SetDataOptions::default())
        .unwrap();
    let list_before = client.get_query_data(&list).unwrap().unwrap();

    let seen_during = Arc::new(AtomicUsize::new(0));
    let observer = client.clone();
    let seen = seen_during.clone();
    let list_key = list.clone();
    let error = client
        .mutate(
            MutateOptions::new(move |_, _| {
                let len = observer
                    .get_query_data(&list_key)
                    .ok()
                    .flatten()
                    .and_then(|data| data.as_array().map(<[QueryData]>::len))
                    .unwrap_or(0);
                seen.store(len, Ordering::SeqCst);
                async { Err(QueryError::mutation("server said no")) }
            })
            .optimistic(OptimisticUpdate::new(list.clone(), append("b")))
            .optimistic(OptimisticUpdate::new(count.clone(), |_| QueryData::from(2))),
        )
        .await
        .unwrap_err();

    assert_eq!(error.to_string(), "mutation failed: server said no");
    assert_eq!(seen_during.load(Ordering::SeqCst), 2);
    assert!(client.get_query_data(&list).unwrap().unwrap().ptr_eq(&list_before));
    assert!(client.get_query_data(&count).unwrap().is_none());
}

#[tokio::test]
async fn success_cascades_through_keys_prefixes_and_tags() {
    let client = client();
    let fetches = Arc::new(AtomicUsize::new(0));
    let counting = |value: i64| {
        let fetches = fetches.clone();
        FetchOptions::new(move |_| {
            let fetches = fetches.clone();
            async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(QueryData::from(value))
            }
        })
    };

    let detail = query_key!["todo", 1];
    let list = query_key!["todos", "open"];
    let badge = query_key!["badge"];
    let untouched = query_key!["profile"];
    client.fetch_query(&detail, counting(1)).await.unwrap();
    client.fetch_query(&list, counting(2)).await.unwrap();
    client.fetch_query(&badge, counting(3).tags(["todo-counts"])).await.unwrap();
    client.fetch_query(&untouched, counting(4)).await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 4);

    client
        .mutate(
            MutateOptions::new(|_, _| async { Ok(QueryData::from_json(json!({"id": 1, "done": true}))) })
                .mutation_key(query_key!["todo", "complete"])
                .variables(1)
                .update_cache(CachePatch::new(detail.clone(), |_, result| result.clone()))
                .invalidate_keys([list.clone()])
                .invalidate_prefixes(["todos"])
                .invalidate_tags(["todo-counts"]),
        )
        .await
        .unwrap();

    let patched = client.get_query_data(&detail).unwrap().unwrap();
    assert_eq!(patched.get("done").and_then(QueryData::as_bool), Some(true));
    assert!(client.get_query_state(&list).unwrap().unwrap().is_stale);
    assert!(client.get_query_state(&badge).unwrap().unwrap().is_stale);
    assert!(!client.get_query_state(&untouched).unwrap().unwrap().is_stale);
    assert!(!client.get_query_state(&detail).unwrap().unwrap().is_stale);

    // Key, prefix and tag groups each count once.
    assert_eq!(client.metrics().invalidations, 3);

    client.fetch_query(&list, counting(20)).await.unwrap();
    client.fetch_query(&untouched, counting(40)).await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn mutation_record_tracks_lifecycle() {
    let client = client();
    let key = query_key!["avatar", "upload"];
    let succeeded = Arc::new(AtomicUsize::new(0));
    let hits = succeeded.clone();

    let result = client
        .mutate(
            MutateOptions::new(|variables: QueryData, _| async move { Ok(variables) })
                .mutation_key(key.clone())
                .variables("photo.png")
                .on_success(move |data, variables| {
                    assert_eq!(data, variables);
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .await
        .unwrap();
    assert_eq!(result.as_str(), Some("photo.png"));
    assert_eq!(succeeded.load(Ordering::SeqCst), 1);

    let record = client.get_mutation(&key).unwrap().unwrap();
    assert_eq!(record.status, MutationStatus::Success);
    assert_eq!(record.updated_at, 50_000);
    assert!(client.snapshot().mutation_keys.contains(&key.hash().unwrap()));
    assert_eq!(client.metrics().mutations, 1);
}

#[tokio::test]
async fn cancelled_mutation_rolls_back() {
    let client = client();
    let key = query_key!["draft"];
    client
        .set_query_data(&key, QueryData::from("saved"), SetDataOptions::default())
        .unwrap();
    let mutation_key = query_key!["draft", "save"];

    let mutate = client.mutate(
        MutateOptions::new(|_, token: tokio_util::sync::CancellationToken| async move {
            token.cancelled().await;
            Ok(QueryData::Null)
        })
        .mutation_key(mutation_key.clone())
        .optimistic(OptimisticUpdate::new(key.clone(), |_| QueryData::from("typing"))),
    );
    let cancel = async {
        tokio::task::yield_now().await;
        assert_eq!(
            client.get_query_data(&key).unwrap().unwrap().as_str(),
            Some("typing")
        );
        client.cancel_mutation(&mutation_key).unwrap()
    };
    let (result, cancelled) = tokio::join!(mutate, cancel);

    assert!(cancelled);
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(client.get_query_data(&key).unwrap().unwrap().as_str(), Some("saved"));
    assert_eq!(client.metrics().optimistic_rolled_back, 1);
}

#[tokio::test]
async fn clear_cancels_running_mutations_without_rollback_writes() {
    let client = client();
    let key = query_key!["draft"];
    client
        .set_query_data(&key, QueryData::from("saved"), SetDataOptions::default())
        .unwrap();

    let mutate = client.mutate(
        MutateOptions::new(|_, token: tokio_util::sync::CancellationToken| async move {
            token.cancelled().await;
            Ok(QueryData::Null)
        })
        .optimistic(OptimisticUpdate::new(key.clone(), |_| QueryData::from("typing")))
        .update_cache(CachePatch::new(query_key!["draft", "saved"], |_, result| result.clone())),
    );
    let clear = async {
        tokio::task::yield_now().await;
        client.clear();
    };
    let (result, ()) = tokio::join!(mutate, clear);

    assert!(result.unwrap_err().is_cancelled());
    assert!(client.get_query_data(&key).unwrap().is_none());
    assert!(client.snapshot().query_keys.is_empty());
    assert!(client.snapshot().mutation_keys.is_empty());
    assert_eq!(client.metrics().optimistic_rolled_back, 0);
}
