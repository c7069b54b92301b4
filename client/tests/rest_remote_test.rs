//! REST remote store against an in-process PostgREST-style mock.

mod common;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use common::row;
use quill_engine::{CacheSnapshot, Row, VersionedRecord};
use quill_sync::{
    ChannelFilter, MemoryPersistence, RemoteError, RemoteStore, RestRemoteStore,
    StaticConnectivity, SyncRuntime,
};
use serde_json::json;

type Params = HashMap<String, String>;

#[derive(Clone, Default)]
struct MockState {
    rows: Arc<Mutex<HashMap<(String, String), Row>>>,
    failing: Arc<AtomicBool>,
    api_keys: Arc<Mutex<Vec<String>>>,
}

impl MockState {
    fn seed(&self, table: &str, row: Row) {
        let id = row["id"].as_str().unwrap().to_string();
        self.rows.lock().unwrap().insert((table.to_string(), id), row);
    }

    fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.rows
            .lock()
            .unwrap()
            .get(&(table.to_string(), id.to_string()))
            .cloned()
    }

    fn check(&self, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
        if let Some(key) = headers.get("apikey").and_then(|v| v.to_str().ok()) {
            self.api_keys.lock().unwrap().push(key.to_string());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err((StatusCode::INTERNAL_SERVER_ERROR, "database on fire".into()));
        }
        Ok(())
    }
}

/// `eq.` filters from the query string, minus the PostgREST controls.
fn filters(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "order" | "limit" | "select"))
        .filter_map(|(key, value)| {
            value
                .strip_prefix("eq.")
                .map(|v| (key.clone(), v.to_string()))
        })
        .collect()
}

fn matches(row: &Row, filters: &[(String, String)]) -> bool {
    filters.iter().all(|(column, value)| match row.get(column) {
        Some(serde_json::Value::String(s)) => s == value,
        Some(other) => other.to_string() == *value,
        None => false,
    })
}

async fn select_rows(
    State(state): State<MockState>,
    Path(table): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Json<Vec<Row>>, (StatusCode, String)> {
    state.check(&headers)?;
    let filters = filters(&params);
    let mut rows: Vec<Row> = state
        .rows
        .lock()
        .unwrap()
        .iter()
        .filter(|((t, _), row)| *t == table && matches(row, &filters))
        .map(|(_, row)| row.clone())
        .collect();
    rows.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    if let Some(limit) = params.get("limit").and_then(|l| l.parse().ok()) {
        rows.truncate(limit);
    }
    Ok(Json(rows))
}

async fn upsert_rows(
    State(state): State<MockState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Json(rows): Json<Vec<Row>>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.check(&headers)?;
    let merge = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("resolution=merge-duplicates"));
    for row in rows {
        if !merge && state.get(&table, row["id"].as_str().unwrap_or_default()).is_some() {
            return Err((StatusCode::CONFLICT, "duplicate key".into()));
        }
        state.seed(&table, row);
    }
    Ok(StatusCode::CREATED)
}

async fn patch_rows(
    State(state): State<MockState>,
    Path(table): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    Json(fields): Json<Row>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.check(&headers)?;
    let filters = filters(&params);
    for ((t, _), row) in state.rows.lock().unwrap().iter_mut() {
        if *t == table && matches(row, &filters) {
            row.extend(fields.clone());
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_rows(
    State(state): State<MockState>,
    Path(table): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<StatusCode, (StatusCode, String)> {
    state.check(&headers)?;
    let filters = filters(&params);
    state
        .rows
        .lock()
        .unwrap()
        .retain(|(t, _), row| !(*t == table && matches(row, &filters)));
    Ok(StatusCode::NO_CONTENT)
}

async fn serve() -> (MockState, SocketAddr) {
    let state = MockState::default();
    let app = Router::new()
        .route(
            "/{table}",
            get(select_rows)
                .post(upsert_rows)
                .patch(patch_rows)
                .delete(delete_rows),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

fn store_for(addr: SocketAddr) -> RestRemoteStore {
    RestRemoteStore::new(format!("http://{addr}/"), Some("anon-key".into()))
}

#[cfg(test)]
mod rest_store {
    use super::*;

    #[tokio::test]
    async fn test_fetch_normalizes_timestamps() {
        let (state, addr) = serve().await;
        state.seed(
            "segments",
            row(json!({"id": "seg-1", "content": "Dusk.", "updated_at": "2024-01-01T00:00:01.500Z"})),
        );
        let store = store_for(addr);

        let fetched = store.fetch("segments", "seg-1").await.unwrap().unwrap();
        assert_eq!(fetched["updated_at"], json!(1_704_067_201_500u64));
        assert_eq!(fetched["content"], json!("Dusk."));

        assert!(store.fetch("segments", "missing").await.unwrap().is_none());
        assert!(state.api_keys.lock().unwrap().iter().all(|k| k == "anon-key"));
    }

    #[tokio::test]
    async fn test_insert_is_an_upsert() {
        let (state, addr) = serve().await;
        let store = store_for(addr);

        store
            .insert("segments", &row(json!({"id": "seg-1", "title": "A", "updated_at": 1})))
            .await
            .unwrap();
        store
            .insert("segments", &row(json!({"id": "seg-1", "title": "B", "updated_at": 2})))
            .await
            .unwrap();

        assert_eq!(state.get("segments", "seg-1").unwrap()["title"], json!("B"));
    }

    #[tokio::test]
    async fn test_update_and_delete_target_one_row() {
        let (state, addr) = serve().await;
        state.seed("segments", row(json!({"id": "seg-1", "title": "A", "content": "x"})));
        state.seed("segments", row(json!({"id": "seg-2", "title": "A"})));
        let store = store_for(addr);

        store
            .update("segments", "seg-1", &row(json!({"title": "B", "updated_at": 5})))
            .await
            .unwrap();
        let updated = state.get("segments", "seg-1").unwrap();
        assert_eq!(updated["title"], json!("B"));
        assert_eq!(updated["content"], json!("x"));
        assert_eq!(state.get("segments", "seg-2").unwrap()["title"], json!("A"));

        store.delete("segments", "seg-1").await.unwrap();
        store.delete("segments", "seg-1").await.unwrap();
        assert!(state.get("segments", "seg-1").is_none());
        assert!(state.get("segments", "seg-2").is_some());
    }

    #[tokio::test]
    async fn test_select_applies_filter() {
        let (state, addr) = serve().await;
        state.seed("segments", row(json!({"id": "b", "story_id": "s1"})));
        state.seed("segments", row(json!({"id": "a", "story_id": "s1"})));
        state.seed("segments", row(json!({"id": "c", "story_id": "s2"})));
        let store = store_for(addr);

        let rows = store
            .select("segments", Some(&ChannelFilter::eq("story_id", "s1")))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(store.select("segments", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_server_error_surfaces_status() {
        let (state, addr) = serve().await;
        state.failing.store(true, Ordering::SeqCst);
        let store = store_for(addr);

        let err = store.fetch("segments", "seg-1").await.unwrap_err();
        match err {
            RemoteError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "database on fire");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_server_is_an_http_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = store_for(addr).fetch("segments", "seg-1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Http(_)));
    }
}

#[cfg(test)]
mod end_to_end {
    use super::*;

    #[tokio::test]
    async fn test_runtime_syncs_through_rest() {
        let (state, addr) = serve().await;
        let runtime = SyncRuntime::start(
            common::fast_config(),
            Arc::new(store_for(addr)),
            Arc::new(MemoryPersistence::new()),
            Arc::new(StaticConnectivity::new(true)),
        )
        .await
        .unwrap();

        runtime
            .engine()
            .write("segments", "seg-1", row(json!({"content": "The bell tolls."})))
            .await
            .unwrap();
        runtime
            .engine()
            .write("segments", "seg-1", row(json!({"title": "Bells"})))
            .await
            .unwrap();

        let result = runtime.engine().sync_all().await;
        assert!(result.is_success(), "{:?}", result.errors);
        assert_eq!(result.synced_count, 2);

        let remote = state.get("segments", "seg-1").unwrap();
        assert_eq!(remote["content"], json!("The bell tolls."));
        assert_eq!(remote["title"], json!("Bells"));
        assert!(runtime.engine().get("segments", "seg-1").unwrap().is_synced);

        runtime.engine().delete("segments", "seg-1").await.unwrap();
        let result = runtime.engine().sync_all().await;
        assert!(result.is_success());
        assert!(state.get("segments", "seg-1").is_none());
        assert!(runtime.engine().get("segments", "seg-1").is_none());

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_rfc3339_server_row_wins_conflict() {
        let (state, addr) = serve().await;
        state.seed(
            "segments",
            row(json!({
                "id": "seg-1",
                "content": "Server copy.",
                "updated_at": "2030-01-01T00:00:00Z"
            })),
        );

        let mut snapshot = CacheSnapshot::new();
        snapshot.put_record(VersionedRecord::new_local(
            "seg-1",
            "segments",
            row(json!({"content": "Local copy."})),
            1_000,
        ));
        let runtime = SyncRuntime::start(
            common::fast_config(),
            Arc::new(store_for(addr)),
            Arc::new(MemoryPersistence::with_snapshot(snapshot)),
            Arc::new(StaticConnectivity::new(true)),
        )
        .await
        .unwrap();

        let result = runtime.engine().sync_all().await;
        assert!(result.is_success(), "{:?}", result.errors);
        assert_eq!(result.conflict_count, 1);

        let local = runtime.engine().get("segments", "seg-1").unwrap();
        assert_eq!(local.field("content"), Some(&json!("Server copy.")));
        assert_eq!(local.updated_at, 1_893_456_000_000);
        assert!(local.is_synced);
        assert_eq!(
            state.get("segments", "seg-1").unwrap()["content"],
            json!("Server copy.")
        );
        runtime.shutdown().await;
    }
}
