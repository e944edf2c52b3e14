use std::sync::Arc;

use serde_json::Value;

use crate::engine::error::WorkflowError;
use crate::engine::executor::ExecutorInner;
use crate::engine::run::{Run, stored_outcome};
use crate::engine::types::{Signal, WorkflowStatus};

/// Reference to one workflow run.
///
/// A handle either tracks a run resident in this process or a stored run
/// that is read back from the store on demand.
#[derive(Clone)]
pub struct WorkflowHandle {
    workflow_id: String,
    run_id: String,
    executor: Arc<ExecutorInner>,
    run: Option<Arc<Run>>,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("resident", &self.run.is_some())
            .finish()
    }
}

impl WorkflowHandle {
    pub(crate) fn resident(executor: Arc<ExecutorInner>, run: Arc<Run>) -> Self {
        Self {
            workflow_id: run.workflow_id.clone(),
            run_id: run.run_id.clone(),
            executor,
            run: Some(run),
        }
    }

    pub(crate) fn stored(executor: Arc<ExecutorInner>, workflow_id: &str, run_id: &str) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            executor,
            run: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn status(&self) -> Result<WorkflowStatus, WorkflowError> {
        if let Some(run) = &self.run {
            return Ok(run.status());
        }
        Ok(self.executor.current_state(&self.workflow_id).await?.status)
    }

    /// Wait for the run to finish and return its result or terminal error.
    pub async fn result(&self) -> Result<Value, WorkflowError> {
        if let Some(run) = &self.run {
            return run.wait_outcome().await;
        }
        loop {
            if let Some(run) = self.executor.resident(&self.workflow_id).await {
                return run.wait_outcome().await;
            }
            let state = self.executor.load_required(&self.workflow_id).await?;
            if state.status.is_terminal() {
                return stored_outcome(&state);
            }
            tokio::time::sleep(self.executor.config.poll_interval).await;
        }
    }

    pub async fn signal(&self, name: &str, payload: Value) -> Result<(), WorkflowError> {
        self.executor
            .signal(&self.workflow_id, Signal::new(name, payload))
            .await
    }

    pub async fn cancel(&self) -> Result<(), WorkflowError> {
        self.executor.cancel(&self.workflow_id).await
    }
}
