use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::engine::context::WorkflowContext;
use crate::engine::error::WorkflowError;

/// Deterministic orchestration logic.
///
/// Implementations must request activities, timers and signals through the
/// [`WorkflowContext`] in the same order with the same arguments every time
/// they are run against the same history. Randomness, wall-clock reads and
/// unordered concurrency belong in activities, not here; the engine detects
/// divergence on replay and fails the run, it cannot prevent it.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Registered type name, persisted as `workflow_type`.
    fn workflow_type(&self) -> &str;

    async fn run(
        &self,
        ctx: WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError>;
}

/// Adapter turning an async closure into a [`Workflow`].
pub struct FnWorkflow<F> {
    workflow_type: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Workflow for FnWorkflow<F>
where
    F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, WorkflowError>> + Send,
{
    fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    async fn run(
        &self,
        ctx: WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, WorkflowError> {
        (self.f)(ctx, input).await
    }
}

pub fn workflow_fn<F, Fut>(workflow_type: &str, f: F) -> Arc<dyn Workflow>
where
    F: Fn(WorkflowContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, WorkflowError>> + Send + 'static,
{
    Arc::new(FnWorkflow {
        workflow_type: workflow_type.to_string(),
        f,
    })
}

/// Registry of workflow definitions, used to start runs by name and to
/// resume stored runs after a restart.
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows
            .insert(workflow.workflow_type().to_string(), workflow);
    }

    pub fn with(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.register(workflow);
        self
    }

    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(workflow_type).cloned()
    }
}
