use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use yokai_query::config::PersistenceMode;
use yokai_query::persist::{FileBackend, PersistenceBackend};
use yokai_query::{ClientConfig, ManualClock, QueryClient, QueryData, SetDataOptions, query_key};

fn durable_client(dir: &TempDir) -> QueryClient {
    let mut config = ClientConfig::default();
    config.gc_interval_ms = 0;
    config.persistence.mode = PersistenceMode::Durable;
    config.persistence.path = Some(dir.path().to_path_buf());
    QueryClient::builder()
        .config(config)
        .clock(Arc::new(ManualClock::new(1_000)))
        .build()
}

#[tokio::test]
async fn durable_cache_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    let key = query_key!["settings", 7];

    {
        let client = durable_client(&dir);
        client
            .set_query_data(
                &key,
                QueryData::from_json(json!({"theme": "dark", "fontSize": 14})),
                SetDataOptions::default().tags(["settings"]).stale_time_ms(60_000),
            )
            .unwrap();
        client.flush_now().await.unwrap();
    }

    let client = durable_client(&dir);
    assert!(client.get_query_data(&key).unwrap().is_none());
    assert!(client.restore().await.unwrap());

    let state = client.get_query_state(&key).unwrap().unwrap();
    let data = state.data.unwrap();
    assert_eq!(data.get("theme").and_then(QueryData::as_str), Some("dark"));
    assert_eq!(state.fetched_at, Some(1_000));
    assert!(!state.is_stale);
    assert_eq!(client.invalidate_tags(["settings"]), 1);
}

#[tokio::test]
async fn payload_omits_errors_and_keeps_the_table_shape() {
    let dir = TempDir::new().unwrap();
    let client = durable_client(&dir);
    client
        .set_query_data(&query_key!["a"], QueryData::from(1), SetDataOptions::default())
        .unwrap();
    client.flush_now().await.unwrap();

    let backend = FileBackend::new(dir.path());
    let bytes = backend.get("__query_cache__").await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let entry = &value[query_key!["a"].hash().unwrap()];
    assert_eq!(entry["data"], json!(1));
    assert_eq!(entry["fetchedAt"], json!(1_000));
    assert!(entry.get("error").is_none());
}

#[tokio::test]
async fn dehydrate_then_hydrate_rebuilds_indexes() {
    let source = QueryClient::new();
    source
        .set_query_data(
            &query_key!["post", 1],
            QueryData::from("hello"),
            SetDataOptions::default().tags(["posts"]),
        )
        .unwrap();
    let entries = source.dehydrate();

    let target = QueryClient::new();
    target.hydrate(entries.clone());
    assert_eq!(target.dehydrate(), entries);
    assert_eq!(target.invalidate_tags(["posts"]), 1);
    assert_eq!(target.invalidate_by_prefix("post"), 1);
}
