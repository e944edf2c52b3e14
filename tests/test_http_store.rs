//! HttpStore client against a real local store server.

use std::sync::Arc;
use std::time::Duration;

use replayflow::activities::{ActivityRegistry, activity_fn};
use replayflow::api::{AppState, router};
use replayflow::engine::types::*;
use replayflow::engine::{Executor, ExecutorConfig};
use replayflow::storage::http_store::{HttpStore, HttpStoreConfig};
use replayflow::storage::json_store::JsonFileStore;
use replayflow::storage::{StoreError, WorkflowStore};
use replayflow::workflows::{WorkflowRegistry, workflow_fn};
use serde_json::{Value, json};

/// Start a server on an ephemeral port and return its base URL.
async fn spawn_server(auth_key: Option<&str>) -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState {
        store: Arc::new(JsonFileStore::new(dir.path())),
        collection: "workflows".to_string(),
        auth_key: auth_key.map(str::to_string),
    });
    let app = router(state, 1024 * 1024);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), dir)
}

fn running_state(id: &str) -> WorkflowState {
    let mut state = WorkflowState::new(id, "run-1", "etl", json!({"n": 1}));
    state.append(HistoryEvent::new(EventType::WorkflowStarted));
    state.status = WorkflowStatus::Running;
    state
}

#[tokio::test]
async fn http_store_round_trip() {
    let (base_url, _dir) = spawn_server(None).await;
    let store = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();

    let state = running_state("wf-http");
    store.save(&state).await.unwrap();

    let loaded = store.load("wf-http").await.unwrap().unwrap();
    assert_eq!(loaded, state);
}

#[tokio::test]
async fn http_store_load_unknown_is_none() {
    let (base_url, _dir) = spawn_server(None).await;
    let store = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();

    assert!(store.load("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn http_store_delete_is_idempotent() {
    let (base_url, _dir) = spawn_server(None).await;
    let store = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();

    store.save(&running_state("wf-del")).await.unwrap();
    store.delete("wf-del").await.unwrap();
    store.delete("wf-del").await.unwrap();
    assert!(store.load("wf-del").await.unwrap().is_none());
}

#[tokio::test]
async fn http_store_list_reflects_own_writes() {
    let (base_url, _dir) = spawn_server(None).await;
    let store = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();

    store.save(&running_state("wf-a")).await.unwrap();
    let mut done = running_state("wf-b");
    done.status = WorkflowStatus::Completed;
    store.save(&done).await.unwrap();

    let running = store
        .list(&WorkflowFilter::with_status(WorkflowStatus::Running))
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].workflow_id, "wf-a");

    // another client only sees what it has loaded itself
    let other = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();
    assert!(other.list(&WorkflowFilter::default()).await.unwrap().is_empty());
    other.load("wf-b").await.unwrap();
    assert_eq!(other.list(&WorkflowFilter::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn http_store_server_rejects_terminal_revert() {
    let (base_url, _dir) = spawn_server(None).await;
    let writer = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();

    let mut state = running_state("wf-final");
    state.status = WorkflowStatus::Completed;
    writer.save(&state).await.unwrap();

    // fresh client: no cached copy, so the server has to enforce it
    let fresh = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();
    let mut reverted = state.clone();
    reverted.status = WorkflowStatus::Running;
    let err = fresh.save(&reverted).await.unwrap_err();
    assert!(matches!(err, StoreError::Remote { status: 409, .. }));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn http_store_bearer_auth() {
    let (base_url, _dir) = spawn_server(Some("sekrit")).await;

    let anonymous = HttpStore::new(HttpStoreConfig::new(&base_url)).unwrap();
    let err = anonymous.save(&running_state("wf-auth")).await.unwrap_err();
    assert!(matches!(err, StoreError::Remote { status: 401, .. }));

    let authed =
        HttpStore::new(HttpStoreConfig::new(&base_url).with_auth_key("sekrit")).unwrap();
    authed.save(&running_state("wf-auth")).await.unwrap();
    assert!(authed.load("wf-auth").await.unwrap().is_some());
}

#[tokio::test]
async fn http_store_custom_collection_and_base_path() {
    let (base_url, _dir) = spawn_server(None).await;

    let wrong = HttpStore::new(HttpStoreConfig::new(&base_url).with_collection("runs")).unwrap();
    let err = wrong.save(&running_state("wf-col")).await.unwrap_err();
    assert!(matches!(err, StoreError::Remote { status: 404, .. }));

    // trailing slash on the base URL does not produce an empty segment
    let slashed = HttpStore::new(HttpStoreConfig::new(format!("{}/", base_url))).unwrap();
    slashed.save(&running_state("wf-col")).await.unwrap();
}

#[tokio::test]
async fn http_store_rejects_bad_config() {
    assert!(matches!(
        HttpStore::new(HttpStoreConfig::new("not a url")),
        Err(StoreError::Config(_))
    ));
    assert!(matches!(
        HttpStore::new(HttpStoreConfig::new("http://localhost:1").with_collection("")),
        Err(StoreError::Config(_))
    ));
}

#[tokio::test]
async fn http_store_connection_error_is_transient() {
    // bind then drop to get a port nothing listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = HttpStore::new(HttpStoreConfig::new(format!("http://{}", addr))).unwrap();
    let err = store.load("wf-x").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn executor_runs_over_http_store() {
    let (base_url, dir) = spawn_server(Some("sekrit")).await;
    let store =
        Arc::new(HttpStore::new(HttpStoreConfig::new(&base_url).with_auth_key("sekrit")).unwrap());

    let activities = ActivityRegistry::new()
        .with(activity_fn("fetch", |_, _| async { Ok(json!("A")) }))
        .with(activity_fn("transform", |_, input| async move {
            Ok(json!(format!("{}!", input.as_str().unwrap_or_default())))
        }));
    let workflows = WorkflowRegistry::new().with(workflow_fn("etl", |ctx, _| async move {
        let fetched = ctx.execute_activity("fetch", Value::Null).await?;
        ctx.execute_activity("transform", fetched).await
    }));
    let exec = Executor::builder(store)
        .workflows(Arc::new(workflows))
        .activities(Arc::new(activities))
        .config(ExecutorConfig {
            max_concurrent_activities: 2,
            store_retry: RetryPolicy::no_retry(),
            default_timeout: None,
            poll_interval: Duration::from_millis(10),
        })
        .build();

    let handle = exec.start("etl", WorkflowOptions::new("wf-1")).await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!("A!"));

    // the server's own directory holds the full history
    let served = JsonFileStore::new(dir.path())
        .load("wf-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served.status, WorkflowStatus::Completed);
    let types: Vec<EventType> = served.history.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::WorkflowStarted,
            EventType::ActivityStarted,
            EventType::ActivityCompleted,
            EventType::ActivityStarted,
            EventType::ActivityCompleted,
            EventType::WorkflowCompleted,
        ]
    );
    let ids: Vec<u64> = served.history.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
}
