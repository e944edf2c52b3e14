use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::{Value, json};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activities::ActivityRegistry;
use crate::engine::context::WorkflowContext;
use crate::engine::error::WorkflowError;
use crate::engine::handle::WorkflowHandle;
use crate::engine::panic_message;
use crate::engine::run::Run;
use crate::engine::types::*;
use crate::engine::worker::ActivityWorker;
use crate::storage::WorkflowStore;
use crate::workflows::{Workflow, WorkflowRegistry};

/// Environment variable overriding the activity pool size.
pub const MAX_CONCURRENT_ACTIVITIES_ENV: &str = "REPLAYFLOW_MAX_CONCURRENT_ACTIVITIES";

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_concurrent_activities: usize,
    /// Retry applied to transient store failures before a run fails.
    pub store_retry: RetryPolicy,
    /// Applied when `WorkflowOptions::timeout` is unset.
    pub default_timeout: Option<Duration>,
    /// How often handles to non-resident runs poll the store.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_activities: num_cpus::get(),
            store_retry: RetryPolicy::new(3, Duration::from_millis(50)),
            default_timeout: None,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let max_concurrent_activities = std::env::var(MAX_CONCURRENT_ACTIVITIES_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or_else(num_cpus::get);

        Self {
            max_concurrent_activities,
            ..Self::default()
        }
    }
}

/// Lifecycle callbacks. All methods default to no-ops.
pub trait WorkflowHooks: Send + Sync {
    fn on_workflow_start(&self, _workflow_id: &str, _input: &Value) {}
    fn on_workflow_complete(&self, _workflow_id: &str, _result: &Value) {}
    fn on_workflow_fail(&self, _workflow_id: &str, _error: &WorkflowError) {}
    fn on_workflow_cancel(&self, _workflow_id: &str) {}
}

pub struct NoopHooks;

impl WorkflowHooks for NoopHooks {}

pub struct ExecutorBuilder {
    store: Arc<dyn WorkflowStore>,
    workflows: Arc<WorkflowRegistry>,
    activities: Arc<ActivityRegistry>,
    config: ExecutorConfig,
    hooks: Arc<dyn WorkflowHooks>,
}

impl ExecutorBuilder {
    pub fn workflows(mut self, workflows: Arc<WorkflowRegistry>) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn activities(mut self, activities: Arc<ActivityRegistry>) -> Self {
        self.activities = activities;
        self
    }

    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn WorkflowHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Executor {
        let worker = Arc::new(ActivityWorker::new(
            self.activities,
            self.config.max_concurrent_activities,
        ));
        Executor {
            inner: Arc::new(ExecutorInner {
                store: self.store,
                workflows: self.workflows,
                worker,
                hooks: self.hooks,
                config: self.config,
                runs: Mutex::new(HashMap::new()),
                leases: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            }),
        }
    }
}

/// Starts, resumes and drives durable workflow runs.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

pub(crate) struct ExecutorInner {
    pub(crate) store: Arc<dyn WorkflowStore>,
    workflows: Arc<WorkflowRegistry>,
    worker: Arc<ActivityWorker>,
    hooks: Arc<dyn WorkflowHooks>,
    pub(crate) config: ExecutorConfig,
    /// Runs driven by this process, keyed by workflow id. Never held across store I/O.
    runs: Mutex<HashMap<String, Arc<Run>>>,
    leases: LeaseMap,
}

type LeaseMap = Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Exclusive claim on one workflow id while its stored state is read or
/// rewritten outside a resident run. Other ids are unaffected.
struct IdLease {
    leases: LeaseMap,
    workflow_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut leases = self.leases.lock();
        if leases
            .get(&self.workflow_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            leases.remove(&self.workflow_id);
        }
    }
}

impl Executor {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        workflows: Arc<WorkflowRegistry>,
        activities: Arc<ActivityRegistry>,
    ) -> Self {
        Self::builder(store)
            .workflows(workflows)
            .activities(activities)
            .build()
    }

    pub fn builder(store: Arc<dyn WorkflowStore>) -> ExecutorBuilder {
        ExecutorBuilder {
            store,
            workflows: Arc::new(WorkflowRegistry::new()),
            activities: Arc::new(ActivityRegistry::new()),
            config: ExecutorConfig::from_env(),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Start `workflow`, or resume it when `options.id` names a stored run.
    pub async fn execute(
        &self,
        workflow: Arc<dyn Workflow>,
        options: WorkflowOptions,
    ) -> Result<WorkflowHandle, WorkflowError> {
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(WorkflowError::InvalidInput(
                "workflow timeout must be greater than zero".to_string(),
            ));
        }
        let workflow_id = match options.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => format!("wf-{}", Uuid::new_v4()),
        };
        self.inner
            .launch(workflow, workflow_id, options.input, options.timeout)
            .await
    }

    /// Start a registered workflow by type name.
    pub async fn start(
        &self,
        workflow_type: &str,
        options: WorkflowOptions,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let workflow = self
            .inner
            .workflows
            .get(workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_type.to_string()))?;
        self.execute(workflow, options).await
    }

    /// Continue a stored run through the workflow registry.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowHandle, WorkflowError> {
        self.inner.resume(workflow_id).await
    }

    /// Resume every stored `pending` or `running` run whose type is registered.
    pub async fn resume_all(&self) -> Result<Vec<WorkflowHandle>, WorkflowError> {
        // Collect first: a resumed pending run turns running before the second listing.
        let mut open = Vec::new();
        for status in [WorkflowStatus::Pending, WorkflowStatus::Running] {
            let runs = self
                .inner
                .store
                .list(&WorkflowFilter::with_status(status))
                .await
                .map_err(|e| WorkflowError::store("*", e))?;
            open.extend(runs.into_iter().map(|state| state.workflow_id));
        }

        let mut handles = Vec::new();
        for workflow_id in open {
            match self.inner.resume(&workflow_id).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(workflow_id = %workflow_id, error = %e, "Skipping workflow on resume");
                }
            }
        }
        info!(count = handles.len(), "Resumed stored workflows");
        Ok(handles)
    }

    pub async fn signal(&self, workflow_id: &str, signal: Signal) -> Result<(), WorkflowError> {
        self.inner.signal(workflow_id, signal).await
    }

    pub async fn cancel(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        self.inner.cancel(workflow_id).await
    }

    /// Read-only view of a run: `status`, `result` or `history`.
    pub async fn query(&self, workflow_id: &str, query_type: &str) -> Result<Value, WorkflowError> {
        self.inner.query(workflow_id, query_type).await
    }

    pub async fn handle(&self, workflow_id: &str) -> Result<WorkflowHandle, WorkflowError> {
        self.inner.handle(workflow_id).await
    }
}

impl ExecutorInner {
    async fn lease(&self, workflow_id: &str) -> IdLease {
        let slot = Arc::clone(self.leases.lock().entry(workflow_id.to_string()).or_default());
        IdLease {
            leases: Arc::clone(&self.leases),
            workflow_id: workflow_id.to_string(),
            guard: Some(slot.lock_owned().await),
        }
    }

    async fn launch(
        self: &Arc<Self>,
        workflow: Arc<dyn Workflow>,
        workflow_id: String,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<WorkflowHandle, WorkflowError> {
        let lease = self.lease(&workflow_id).await;
        self.launch_leased(&lease, workflow, workflow_id, input, timeout)
            .await
    }

    /// Load or create the run and start driving it. The caller holds the id's lease.
    async fn launch_leased(
        self: &Arc<Self>,
        _lease: &IdLease,
        workflow: Arc<dyn Workflow>,
        workflow_id: String,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<WorkflowHandle, WorkflowError> {
        if let Some(run) = self.resident(&workflow_id).await {
            return Ok(WorkflowHandle::resident(Arc::clone(self), run));
        }

        let existing = self
            .store
            .load(&workflow_id)
            .await
            .map_err(|e| WorkflowError::store(&workflow_id, e))?;

        let (state, resumed) = match existing {
            Some(state) if state.status.is_terminal() => {
                return Ok(WorkflowHandle::stored(
                    Arc::clone(self),
                    &state.workflow_id,
                    &state.run_id,
                ));
            }
            Some(state) => {
                if state.workflow_type != workflow.workflow_type() {
                    return Err(WorkflowError::InvalidInput(format!(
                        "workflow '{}' has type '{}', not '{}'",
                        workflow_id,
                        state.workflow_type,
                        workflow.workflow_type()
                    )));
                }
                (state, true)
            }
            None => (
                WorkflowState::new(
                    &workflow_id,
                    &Uuid::new_v4().to_string(),
                    workflow.workflow_type(),
                    input,
                ),
                false,
            ),
        };

        let needs_start = !state.has_event(EventType::WorkflowStarted);
        let run = Run::new(state, Arc::clone(&self.store), self.config.store_retry.clone());
        if needs_start {
            run.commit(|state| {
                let input = state.input.clone();
                state.append(HistoryEvent::new(EventType::WorkflowStarted).with_payload(input));
                state.status = WorkflowStatus::Running;
            })
            .await?;
        }
        self.runs
            .lock()
            .await
            .insert(workflow_id.clone(), Arc::clone(&run));

        let snapshot = run.snapshot().await;
        if resumed {
            info!(
                workflow_id = %run.workflow_id,
                run_id = %run.run_id,
                workflow_type = %snapshot.workflow_type,
                events = snapshot.history.len(),
                "Resuming workflow"
            );
        } else {
            info!(
                workflow_id = %run.workflow_id,
                run_id = %run.run_id,
                workflow_type = %snapshot.workflow_type,
                "Starting workflow"
            );
            self.hooks.on_workflow_start(&run.workflow_id, &snapshot.input);
        }

        let ctx =
            WorkflowContext::new(Arc::clone(&run), Arc::clone(&self.worker), &snapshot.history);
        let timeout = timeout.or(self.config.default_timeout);
        let inner = Arc::clone(self);
        let driven = Arc::clone(&run);
        tokio::spawn(async move {
            inner.drive(driven, workflow, ctx, snapshot.input, timeout).await;
        });

        Ok(WorkflowHandle::resident(Arc::clone(self), run))
    }

    async fn drive(
        self: Arc<Self>,
        run: Arc<Run>,
        workflow: Arc<dyn Workflow>,
        ctx: WorkflowContext,
        input: Value,
        timeout: Option<Duration>,
    ) {
        let body = AssertUnwindSafe(workflow.run(ctx.clone(), input)).catch_unwind();
        let bounded = async {
            let caught = match timeout {
                Some(limit) => tokio::time::timeout(limit, body)
                    .await
                    .unwrap_or_else(|_| Ok(Err(WorkflowError::Timeout(limit)))),
                None => body.await,
            };
            caught.unwrap_or_else(|panic| Err(WorkflowError::Panic(panic_message(panic.as_ref()))))
        };

        let mut outcome = tokio::select! {
            outcome = bounded => outcome,
            _ = run.cancel_token().cancelled() => Err(WorkflowError::Cancelled),
        };

        if !matches!(outcome, Err(WorkflowError::Cancelled)) {
            if let Some(fatal) = ctx.take_fatal() {
                outcome = Err(fatal);
            } else if outcome.is_ok()
                && let Some(skipped) = ctx.unconsumed()
            {
                error!(workflow_id = %run.workflow_id, error = %skipped, "Non-deterministic replay");
                outcome = Err(skipped);
            }
        }

        let outcome = run.finish(outcome).await;
        // Stops activities still in flight; their outcomes are recorded for audit.
        run.cancel_token().cancel();

        {
            let mut runs = self.runs.lock().await;
            if runs
                .get(&run.workflow_id)
                .is_some_and(|resident| Arc::ptr_eq(resident, &run))
            {
                runs.remove(&run.workflow_id);
            }
        }

        match &outcome {
            Ok(result) => {
                info!(workflow_id = %run.workflow_id, run_id = %run.run_id, "Workflow completed");
                self.hooks.on_workflow_complete(&run.workflow_id, result);
            }
            Err(WorkflowError::Cancelled) => {
                info!(workflow_id = %run.workflow_id, run_id = %run.run_id, "Workflow cancelled");
                self.hooks.on_workflow_cancel(&run.workflow_id);
            }
            Err(e) => {
                warn!(workflow_id = %run.workflow_id, run_id = %run.run_id, error = %e, "Workflow failed");
                self.hooks.on_workflow_fail(&run.workflow_id, e);
            }
        }

        run.publish(outcome);
    }

    async fn resume(self: &Arc<Self>, workflow_id: &str) -> Result<WorkflowHandle, WorkflowError> {
        if let Some(run) = self.resident(workflow_id).await {
            return Ok(WorkflowHandle::resident(Arc::clone(self), run));
        }
        let state = self.load_required(workflow_id).await?;
        if state.status.is_terminal() {
            return Ok(WorkflowHandle::stored(
                Arc::clone(self),
                &state.workflow_id,
                &state.run_id,
            ));
        }
        let workflow = self
            .workflows
            .get(&state.workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(state.workflow_type.clone()))?;
        self.launch(workflow, state.workflow_id, state.input, None)
            .await
    }

    pub(crate) async fn resident(&self, workflow_id: &str) -> Option<Arc<Run>> {
        self.runs.lock().await.get(workflow_id).cloned()
    }

    pub(crate) async fn load_required(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        self.store
            .load(workflow_id)
            .await
            .map_err(|e| WorkflowError::store(workflow_id, e))?
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    /// Latest view of a run, preferring the resident copy.
    pub(crate) async fn current_state(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowState, WorkflowError> {
        match self.resident(workflow_id).await {
            Some(run) => {
                let mut state = run.snapshot().await;
                state.status = run.status();
                Ok(state)
            }
            None => self.load_required(workflow_id).await,
        }
    }

    pub(crate) async fn signal(
        self: &Arc<Self>,
        workflow_id: &str,
        signal: Signal,
    ) -> Result<(), WorkflowError> {
        if signal.name.trim().is_empty() {
            return Err(WorkflowError::InvalidInput(
                "signal name must not be empty".to_string(),
            ));
        }

        if let Some(run) = self.resident(workflow_id).await {
            return self.deliver(&run, &signal).await;
        }

        // Not resident: append to the stored history under the id's lease so a
        // concurrent launch cannot overwrite the event.
        let lease = self.lease(workflow_id).await;
        if let Some(run) = self.resident(workflow_id).await {
            drop(lease);
            return self.deliver(&run, &signal).await;
        }
        let mut state = self.load_required(workflow_id).await?;
        if state.status.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                workflow_id: workflow_id.to_string(),
                status: state.status,
            });
        }
        state.append(
            HistoryEvent::new(EventType::SignalReceived)
                .signal(&signal.name)
                .with_payload(signal.payload),
        );
        self.store
            .save(&state)
            .await
            .map_err(|e| WorkflowError::store(workflow_id, e))?;
        info!(workflow_id = %workflow_id, signal = %signal.name, "Signal recorded for stored workflow");

        match self.workflows.get(&state.workflow_type) {
            Some(workflow) => {
                self.launch_leased(&lease, workflow, state.workflow_id, state.input, None)
                    .await?;
            }
            None => {
                warn!(
                    workflow_id = %workflow_id,
                    workflow_type = %state.workflow_type,
                    "Workflow type not registered, signal left for a later resume"
                );
            }
        }
        Ok(())
    }

    pub(crate) async fn cancel(&self, workflow_id: &str) -> Result<(), WorkflowError> {
        if let Some(run) = self.resident(workflow_id).await {
            return Self::request_cancel(&run);
        }

        let lease = self.lease(workflow_id).await;
        if let Some(run) = self.resident(workflow_id).await {
            return Self::request_cancel(&run);
        }
        let mut state = self.load_required(workflow_id).await?;
        if state.status.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                workflow_id: workflow_id.to_string(),
                status: state.status,
            });
        }
        let failure = WorkflowError::Cancelled.to_failure();
        state.append(HistoryEvent::new(EventType::WorkflowCancelled).with_error(failure.clone()));
        state.status = WorkflowStatus::Cancelled;
        state.error = Some(failure);
        self.store
            .save(&state)
            .await
            .map_err(|e| WorkflowError::store(workflow_id, e))?;
        drop(lease);

        info!(workflow_id = %workflow_id, "Stored workflow cancelled");
        self.hooks.on_workflow_cancel(workflow_id);
        Ok(())
    }

    async fn deliver(&self, run: &Run, signal: &Signal) -> Result<(), WorkflowError> {
        run.record_signal(signal).await?;
        info!(workflow_id = %run.workflow_id, signal = %signal.name, "Signal delivered");
        Ok(())
    }

    fn request_cancel(run: &Run) -> Result<(), WorkflowError> {
        let status = run.status();
        if status.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                workflow_id: run.workflow_id.clone(),
                status,
            });
        }
        run.cancel_token().cancel();
        info!(workflow_id = %run.workflow_id, "Cancellation requested");
        Ok(())
    }

    async fn query(&self, workflow_id: &str, query_type: &str) -> Result<Value, WorkflowError> {
        let state = self.current_state(workflow_id).await?;
        match query_type {
            "status" => Ok(json!(state.status)),
            "result" => Ok(state.result.unwrap_or(Value::Null)),
            "history" => Ok(serde_json::to_value(&state.history)?),
            other => Err(WorkflowError::UnknownQuery(other.to_string())),
        }
    }

    async fn handle(self: &Arc<Self>, workflow_id: &str) -> Result<WorkflowHandle, WorkflowError> {
        if let Some(run) = self.resident(workflow_id).await {
            return Ok(WorkflowHandle::resident(Arc::clone(self), run));
        }
        let state = self.load_required(workflow_id).await?;
        Ok(WorkflowHandle::stored(
            Arc::clone(self),
            &state.workflow_id,
            &state.run_id,
        ))
    }
}
