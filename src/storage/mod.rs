pub mod http_store;
pub mod json_store;
pub mod memory_store;

use async_trait::async_trait;
use thiserror::Error;

use crate::engine::types::{WorkflowFilter, WorkflowState, WorkflowStatus};

/// Errors raised by [`WorkflowStore`] backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow id must not be empty")]
    EmptyId,

    #[error("workflow '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize workflow state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("remote store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("remote store returned {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Io(_) | StoreError::Transport(_) => true,
            StoreError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Durable persistence boundary for workflow runs.
///
/// `save` overwrites the whole snapshot keyed by `workflow_id`; the executor
/// owns history construction and submits the full state every time.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Upsert a run. Rejects an empty id and any status regression.
    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError>;

    /// Load a run. Unknown ids yield `Ok(None)`.
    async fn load(&self, workflow_id: &str) -> Result<Option<WorkflowState>, StoreError>;

    /// List runs matching `filter`. Ordering is backend-specific.
    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowState>, StoreError>;

    /// Remove a run. Unknown ids are a no-op.
    async fn delete(&self, workflow_id: &str) -> Result<(), StoreError>;
}

/// Checks shared by every backend before a save is applied.
pub fn validate_save(
    existing: Option<&WorkflowState>,
    next: &WorkflowState,
) -> Result<(), StoreError> {
    if next.workflow_id.trim().is_empty() {
        return Err(StoreError::EmptyId);
    }
    if let Some(current) = existing
        && !current.status.can_transition_to(next.status)
    {
        return Err(StoreError::InvalidTransition {
            id: next.workflow_id.clone(),
            from: current.status,
            to: next.status,
        });
    }
    Ok(())
}
