use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::engine::error::ActivityError;

/// Execution details handed to an activity attempt.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub workflow_id: String,
    pub run_id: String,
    pub activity_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    cancel: CancellationToken,
}

impl ActivityContext {
    pub fn new(
        workflow_id: &str,
        run_id: &str,
        activity_name: &str,
        attempt: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            activity_name: activity_name.to_string(),
            attempt,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the owning run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// A named side-effecting step invoked by workflows.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Registered name (e.g., "charge_card").
    fn name(&self) -> &str;

    /// Execute one attempt with the given JSON input.
    async fn execute(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ActivityError>;
}

/// Adapter turning an async closure into an [`Activity`].
pub struct FnActivity<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, ActivityError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: ActivityContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ActivityError> {
        (self.f)(ctx, input).await
    }
}

pub fn activity_fn<F, Fut>(name: &str, f: F) -> Arc<dyn Activity>
where
    F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ActivityError>> + Send + 'static,
{
    Arc::new(FnActivity {
        name: name.to_string(),
        f,
    })
}

/// Registry of activities available to workflows, built by the application.
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            activities: HashMap::new(),
        }
    }

    /// Register an activity, replacing any previous one with the same name.
    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities.insert(activity.name().to_string(), activity);
    }

    pub fn with(mut self, activity: Arc<dyn Activity>) -> Self {
        self.register(activity);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }
}
