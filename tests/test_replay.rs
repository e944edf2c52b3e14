//! Deterministic replay: crash recovery, re-dispatch, divergence detection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use replayflow::activities::{ActivityRegistry, activity_fn};
use replayflow::engine::replay::{ActivityReplay, ReplayEngine, TimerReplay};
use replayflow::engine::types::*;
use replayflow::engine::{Executor, ExecutorConfig, WorkflowError};
use replayflow::storage::memory_store::MemoryStore;
use replayflow::storage::{StoreError, WorkflowStore};
use replayflow::workflows::{WorkflowRegistry, workflow_fn};
use serde_json::{Value, json};

/// Accepts `allowed` saves, then fails every later one like a dead disk.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    allowed: usize,
    saves: AtomicUsize,
}

#[async_trait]
impl WorkflowStore for FlakyStore {
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(StoreError::Io(std::io::Error::other("disk gone")));
        }
        self.inner.save(state).await
    }

    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        self.inner.load(workflow_id).await
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError> {
        self.inner.list(filter).await
    }

    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError> {
        self.inner.delete(workflow_id).await
    }
}

fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        max_concurrent_activities: 4,
        store_retry: RetryPolicy::no_retry(),
        default_timeout: None,
        poll_interval: Duration::from_millis(10),
    }
}

fn build(
    store: Arc<dyn WorkflowStore>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
) -> Executor {
    Executor::builder(store)
        .workflows(Arc::new(workflows))
        .activities(Arc::new(activities))
        .config(test_config())
        .build()
}

fn counting(name: &str, counter: Arc<AtomicU32>, result: Value) -> Arc<dyn replayflow::Activity> {
    activity_fn(name, move |_, _| {
        let counter = counter.clone();
        let result = result.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(result)
        }
    })
}

/// Stored run of `workflow_type` with `WorkflowStarted` followed by `events`.
fn stored_run(id: &str, workflow_type: &str, events: Vec<HistoryEvent>) -> WorkflowState {
    let mut state = WorkflowState::new(id, "run-1", workflow_type, Value::Null);
    state.append(HistoryEvent::new(EventType::WorkflowStarted));
    for event in events {
        state.append(event);
    }
    state.status = WorkflowStatus::Running;
    state
}

fn count_events(state: &WorkflowState, event_type: EventType) -> usize {
    state
        .history
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

#[tokio::test]
async fn replay_completed_activity_runs_once_across_crash() {
    let charges = Arc::new(AtomicU32::new(0));
    let receipts = Arc::new(AtomicU32::new(0));
    let activities = || {
        ActivityRegistry::new()
            .with(counting("charge_card", charges.clone(), json!("ch_1")))
            .with(counting("send_receipt", receipts.clone(), json!("sent")))
    };
    let checkout = || {
        WorkflowRegistry::new().with(workflow_fn("checkout", |ctx, _| async move {
            let charge = ctx.execute_activity("charge_card", json!({"amount": 42})).await?;
            ctx.execute_activity("send_receipt", charge).await
        }))
    };

    // WorkflowStarted, ActivityStarted and ActivityCompleted of the charge
    // persist; the process dies before send_receipt is recorded.
    let durable = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore {
        inner: durable.clone(),
        allowed: 3,
        saves: AtomicUsize::new(0),
    });
    let first = build(flaky, checkout(), activities());
    let handle = first
        .start("checkout", WorkflowOptions::new("wf-charge"))
        .await
        .unwrap();
    let err = handle.result().await.unwrap_err();
    assert!(matches!(err, WorkflowError::Store { .. }));
    assert_eq!(charges.load(Ordering::SeqCst), 1);
    assert_eq!(receipts.load(Ordering::SeqCst), 0);

    let crashed = durable.load("wf-charge").await.unwrap().unwrap();
    assert_eq!(crashed.status, WorkflowStatus::Running);
    assert_eq!(count_events(&crashed, EventType::ActivityCompleted), 1);

    let second = build(durable.clone(), checkout(), activities());
    let resumed = second.resume("wf-charge").await.unwrap();
    assert_eq!(resumed.run_id(), crashed.run_id);
    assert_eq!(resumed.result().await.unwrap(), json!("sent"));

    assert_eq!(charges.load(Ordering::SeqCst), 1);
    assert_eq!(receipts.load(Ordering::SeqCst), 1);

    let done = durable.load("wf-charge").await.unwrap().unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(count_events(&done, EventType::ActivityStarted), 2);
    let ids: Vec<u64> = done.history.iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn replay_in_flight_activity_is_redispatched_without_new_start() {
    let calls = Arc::new(AtomicU32::new(0));
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-inflight",
            "fetcher",
            vec![
                HistoryEvent::new(EventType::ActivityStarted)
                    .activity("fetch", 0)
                    .with_payload(json!("x")),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("fetcher", |ctx, _| async move {
            ctx.execute_activity("fetch", json!("x")).await
        })),
        ActivityRegistry::new().with(counting("fetch", calls.clone(), json!("fetched"))),
    );

    let handle = exec.resume("wf-inflight").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!("fetched"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = store.load("wf-inflight").await.unwrap().unwrap();
    assert_eq!(count_events(&state, EventType::ActivityStarted), 1);
    let completed = state
        .history
        .iter()
        .find(|e| e.event_type == EventType::ActivityCompleted)
        .unwrap();
    assert_eq!(completed.sequence, Some(0));
    assert_eq!(completed.result, Some(json!("fetched")));
}

#[tokio::test]
async fn replay_recorded_outcome_needs_no_registered_activity() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-legacy",
            "legacy_flow",
            vec![
                HistoryEvent::new(EventType::ActivityStarted).activity("legacy", 0),
                HistoryEvent::new(EventType::ActivityCompleted)
                    .activity("legacy", 0)
                    .with_result(json!("old")),
            ],
        ))
        .await
        .unwrap();

    // the activity was retired after this run recorded its result
    let exec = build(
        store,
        WorkflowRegistry::new().with(workflow_fn("legacy_flow", |ctx, _| async move {
            ctx.execute_activity("legacy", Value::Null).await
        })),
        ActivityRegistry::new(),
    );

    let result = exec.resume("wf-legacy").await.unwrap().result().await;
    assert_eq!(result.unwrap(), json!("old"));
}

#[tokio::test]
async fn unknown_activity_still_takes_a_sequence() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-skip",
            "tolerant",
            vec![
                HistoryEvent::new(EventType::ActivityStarted).activity("fetch", 1),
                HistoryEvent::new(EventType::ActivityCompleted)
                    .activity("fetch", 1)
                    .with_result(json!("A")),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store,
        WorkflowRegistry::new().with(workflow_fn("tolerant", |ctx, _| async move {
            match ctx.execute_activity("optional", Value::Null).await {
                Err(WorkflowError::UnknownActivity(name)) => assert_eq!(name, "optional"),
                other => panic!("expected unknown activity, got {:?}", other),
            }
            ctx.execute_activity("fetch", Value::Null).await
        })),
        ActivityRegistry::new(),
    );

    let result = exec.resume("wf-skip").await.unwrap().result().await;
    assert_eq!(result.unwrap(), json!("A"));
}

#[tokio::test]
async fn replay_name_mismatch_fails_even_if_swallowed() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-diverged",
            "drifting",
            vec![
                HistoryEvent::new(EventType::ActivityStarted).activity("fetch", 0),
                HistoryEvent::new(EventType::ActivityCompleted)
                    .activity("fetch", 0)
                    .with_result(json!("A")),
            ],
        ))
        .await
        .unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("drifting", |ctx, _| async move {
            // code changed between deployments and ignores the error
            let _ = ctx.execute_activity("upload", Value::Null).await;
            Ok(json!("pretend success"))
        })),
        ActivityRegistry::new().with(counting("upload", calls.clone(), Value::Null)),
    );

    let err = exec
        .resume("wf-diverged")
        .await
        .unwrap()
        .result()
        .await
        .unwrap_err();
    assert!(err.is_non_determinism());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let state = store.load("wf-diverged").await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.error.unwrap().kind, FailureKind::NonDeterminism);
}

#[tokio::test]
async fn replay_input_mismatch_is_non_deterministic() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-input",
            "inputs",
            vec![
                HistoryEvent::new(EventType::ActivityStarted)
                    .activity("fetch", 0)
                    .with_payload(json!({"page": 1})),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store,
        WorkflowRegistry::new().with(workflow_fn("inputs", |ctx, _| async move {
            ctx.execute_activity("fetch", json!({"page": 2})).await
        })),
        ActivityRegistry::new().with(activity_fn("fetch", |_, _| async { Ok(Value::Null) })),
    );

    let err = exec.resume("wf-input").await.unwrap().result().await.unwrap_err();
    assert!(err.is_non_determinism());
}

#[tokio::test]
async fn replay_unconsumed_history_is_non_deterministic() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-short",
            "shortened",
            vec![
                HistoryEvent::new(EventType::ActivityStarted).activity("fetch", 0),
                HistoryEvent::new(EventType::ActivityCompleted)
                    .activity("fetch", 0)
                    .with_result(json!("A")),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store,
        WorkflowRegistry::new().with(workflow_fn("shortened", |_, _| async {
            Ok(json!("skipped everything"))
        })),
        ActivityRegistry::new(),
    );

    let err = exec.resume("wf-short").await.unwrap().result().await.unwrap_err();
    assert!(err.is_non_determinism());
    assert!(err.to_string().contains("fetch"));
}

#[tokio::test]
async fn concurrent_activities_get_unique_ids() {
    let store = Arc::new(MemoryStore::new());
    let activities = ActivityRegistry::new()
        .with(activity_fn("slow", |_, _| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(json!("slow"))
        }))
        .with(activity_fn("quick", |_, _| async { Ok(json!("quick")) }));
    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("fan_out", |ctx, _| async move {
            let (slow, quick) = tokio::join!(
                ctx.execute_activity("slow", Value::Null),
                ctx.execute_activity("quick", Value::Null),
            );
            Ok(json!([slow?, quick?]))
        })),
        activities,
    );

    let handle = exec
        .start("fan_out", WorkflowOptions::new("wf-fan"))
        .await
        .unwrap();
    assert_eq!(handle.result().await.unwrap(), json!(["slow", "quick"]));

    let state = store.load("wf-fan").await.unwrap().unwrap();
    let ids: Vec<u64> = state.history.iter().map(|e| e.id).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    let started: Vec<(Option<&str>, Option<u64>)> = state
        .history
        .iter()
        .filter(|e| e.event_type == EventType::ActivityStarted)
        .map(|e| (e.activity_name.as_deref(), e.sequence))
        .collect();
    assert_eq!(started, vec![(Some("slow"), Some(0)), (Some("quick"), Some(1))]);
}

#[tokio::test]
async fn replay_fired_timer_resolves_immediately() {
    let store = Arc::new(MemoryStore::new());
    let fire_at = Utc::now() - chrono::Duration::seconds(5);
    store
        .save(&stored_run(
            "wf-timer",
            "sleeper",
            vec![
                HistoryEvent::new(EventType::TimerStarted)
                    .timer(0)
                    .with_payload(json!({"duration_ms": 3_600_000}))
                    .with_fire_at(fire_at),
                HistoryEvent::new(EventType::TimerFired)
                    .timer(0)
                    .with_fire_at(fire_at),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("sleeper", |ctx, _| async move {
            ctx.sleep(Duration::from_secs(3600)).await?;
            Ok(json!("woke"))
        })),
        ActivityRegistry::new(),
    );

    let handle = exec.resume("wf-timer").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
        .await
        .expect("replayed timer should not wait");
    assert_eq!(result.unwrap(), json!("woke"));

    let state = store.load("wf-timer").await.unwrap().unwrap();
    assert_eq!(count_events(&state, EventType::TimerStarted), 1);
    assert_eq!(count_events(&state, EventType::TimerFired), 1);
}

#[tokio::test]
async fn replay_pending_timer_waits_for_recorded_deadline() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-pending-timer",
            "sleeper",
            vec![
                HistoryEvent::new(EventType::TimerStarted)
                    .timer(0)
                    .with_payload(json!({"duration_ms": 60_000}))
                    .with_fire_at(Utc::now() + chrono::Duration::milliseconds(100)),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("sleeper", |ctx, _| async move {
            ctx.sleep(Duration::from_secs(60)).await?;
            Ok(json!("woke"))
        })),
        ActivityRegistry::new(),
    );

    let handle = exec.resume("wf-pending-timer").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle.result())
        .await
        .expect("timer should fire at its recorded deadline, not a fresh minute");
    assert_eq!(result.unwrap(), json!("woke"));

    let state = store.load("wf-pending-timer").await.unwrap().unwrap();
    assert_eq!(count_events(&state, EventType::TimerStarted), 1);
    assert_eq!(count_events(&state, EventType::TimerFired), 1);
}

#[tokio::test]
async fn replay_timer_duration_mismatch_is_non_deterministic() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-timer-drift",
            "sleeper",
            vec![
                HistoryEvent::new(EventType::TimerStarted)
                    .timer(0)
                    .with_payload(json!({"duration_ms": 1_000}))
                    .with_fire_at(Utc::now()),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store,
        WorkflowRegistry::new().with(workflow_fn("sleeper", |ctx, _| async move {
            ctx.sleep(Duration::from_secs(5)).await?;
            Ok(Value::Null)
        })),
        ActivityRegistry::new(),
    );

    let err = exec
        .resume("wf-timer-drift")
        .await
        .unwrap()
        .result()
        .await
        .unwrap_err();
    assert!(err.is_non_determinism());
}

#[tokio::test]
async fn replay_recorded_signal_is_delivered_again() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run(
            "wf-signal-replay",
            "approval",
            vec![
                HistoryEvent::new(EventType::SignalReceived)
                    .signal("approve")
                    .with_payload(json!({"by": "ops"})),
            ],
        ))
        .await
        .unwrap();

    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("approval", |ctx, _| async move {
            ctx.wait_signal("approve").await
        })),
        ActivityRegistry::new(),
    );

    let handle = exec.resume("wf-signal-replay").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!({"by": "ops"}));

    let state = store.load("wf-signal-replay").await.unwrap().unwrap();
    assert_eq!(count_events(&state, EventType::SignalReceived), 1);
}

#[tokio::test]
async fn signal_to_stored_run_resumes_it() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&stored_run("wf-parked", "approval", vec![]))
        .await
        .unwrap();

    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("approval", |ctx, _| async move {
            let answer = ctx.wait_signal("approve").await?;
            Ok(json!({ "approved": answer }))
        })),
        ActivityRegistry::new(),
    );

    exec.signal("wf-parked", Signal::new("approve", json!(true)))
        .await
        .unwrap();

    let handle = exec.handle("wf-parked").await.unwrap();
    assert_eq!(handle.result().await.unwrap(), json!({ "approved": true }));
    assert_eq!(
        store.load("wf-parked").await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn resume_all_picks_up_registered_open_runs() {
    let store = Arc::new(MemoryStore::new());
    store
        .save(&WorkflowState::new("wf-pending", "run-p", "job", json!(1)))
        .await
        .unwrap();
    store
        .save(&stored_run("wf-running", "job", vec![]))
        .await
        .unwrap();
    store
        .save(&stored_run("wf-foreign", "not_registered", vec![]))
        .await
        .unwrap();
    let mut done = stored_run("wf-done", "job", vec![]);
    done.status = WorkflowStatus::Completed;
    store.save(&done).await.unwrap();

    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    let exec = build(
        store.clone(),
        WorkflowRegistry::new().with(workflow_fn("job", move |_, input| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })),
        ActivityRegistry::new(),
    );

    let handles = exec.resume_all().await.unwrap();
    let mut ids: Vec<&str> = handles.iter().map(|h| h.id()).collect();
    ids.sort();
    assert_eq!(ids, vec!["wf-pending", "wf-running"]);

    for handle in &handles {
        handle.result().await.unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    let pending = store.load("wf-pending").await.unwrap().unwrap();
    assert_eq!(pending.status, WorkflowStatus::Completed);
    assert_eq!(pending.history[0].event_type, EventType::WorkflowStarted);
    assert_eq!(pending.result, Some(json!(1)));
    assert_eq!(
        store.load("wf-foreign").await.unwrap().unwrap().status,
        WorkflowStatus::Running
    );
}

#[test]
fn replay_engine_resolves_by_sequence() {
    let mut state = WorkflowState::new("wf-engine", "run-1", "t", Value::Null);
    state.append(HistoryEvent::new(EventType::WorkflowStarted));
    state.append(HistoryEvent::new(EventType::ActivityStarted).activity("a", 0));
    state.append(HistoryEvent::new(EventType::ActivityStarted).activity("b", 1));
    // completions landed out of order
    state.append(
        HistoryEvent::new(EventType::ActivityFailed)
            .activity("b", 1)
            .with_error(Failure::new(FailureKind::NonRetryable, "nope")),
    );
    state.append(
        HistoryEvent::new(EventType::ActivityCompleted)
            .activity("a", 0)
            .with_result(json!(1)),
    );

    let mut engine = ReplayEngine::new(&state.history);
    assert!(engine.is_replaying());
    assert_eq!(engine.started_at(), state.history[0].timestamp);

    let first = engine.next_activity_seq();
    assert_eq!(
        engine.activity(first, "a", &Value::Null),
        ActivityReplay::Completed(json!(1))
    );
    let second = engine.next_activity_seq();
    match engine.activity(second, "b", &Value::Null) {
        ActivityReplay::Failed(failure) => assert_eq!(failure.kind, FailureKind::NonRetryable),
        other => panic!("expected recorded failure, got {:?}", other),
    }
    assert!(!engine.is_replaying());
    assert!(engine.unconsumed().is_none());

    let third = engine.next_activity_seq();
    assert_eq!(engine.activity(third, "c", &Value::Null), ActivityReplay::Live);
}

#[test]
fn replay_engine_flags_divergence() {
    let mut state = WorkflowState::new("wf-engine", "run-1", "t", Value::Null);
    state.append(HistoryEvent::new(EventType::ActivityStarted).activity("a", 0));
    state.append(
        HistoryEvent::new(EventType::TimerStarted)
            .timer(0)
            .with_payload(json!({"duration_ms": 500})),
    );

    let mut engine = ReplayEngine::new(&state.history);
    let seq = engine.next_activity_seq();
    assert!(matches!(
        engine.activity(seq, "other", &Value::Null),
        ActivityReplay::Mismatch(_)
    ));
    assert_eq!(engine.activity(seq, "a", &Value::Null), ActivityReplay::InFlight);

    let timer = engine.next_timer_seq();
    assert!(matches!(
        engine.timer(timer, Duration::from_millis(900)),
        TimerReplay::Mismatch(_)
    ));
    // no deadline recorded
    assert!(matches!(
        engine.timer(timer, Duration::from_millis(500)),
        TimerReplay::Pending(_)
    ));

    let fresh = ReplayEngine::new(&state.history);
    let detail = fresh.unconsumed().unwrap();
    assert!(detail.contains("activity #0 'a'"));
    assert!(detail.contains("timer #0"));
}
