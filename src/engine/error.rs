use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::engine::types::{Failure, FailureKind, WorkflowStatus};
use crate::storage::StoreError;

/// Error returned by an activity implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActivityError {
    /// Transient failure, retried per the activity's policy.
    #[error("{0}")]
    Retryable(String),
    /// Surfaces immediately without further attempts.
    #[error("{0}")]
    NonRetryable(String),
    #[error("activity timed out after {0:?}")]
    Timeout(Duration),
    #[error("activity cancelled")]
    Cancelled,
    #[error("activity panicked: {0}")]
    Panic(String),
}

impl ActivityError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        ActivityError::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        ActivityError::NonRetryable(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Retryable(_) | ActivityError::Timeout(_))
    }

    pub fn to_failure(&self) -> Failure {
        let kind = match self {
            ActivityError::Retryable(_) => FailureKind::Application,
            ActivityError::NonRetryable(_) => FailureKind::NonRetryable,
            ActivityError::Timeout(_) => FailureKind::Timeout,
            ActivityError::Cancelled => FailureKind::Cancelled,
            ActivityError::Panic(_) => FailureKind::Panic,
        };
        Failure::new(kind, self.to_string())
    }
}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        ActivityError::Retryable(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        ActivityError::NonRetryable(format!("invalid activity payload: {}", err))
    }
}

/// Error surfaced by the executor, the workflow context and handles.
///
/// `Clone` so a single outcome can be delivered to every handle of a run.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("unknown workflow type '{0}'")]
    UnknownWorkflow(String),

    #[error("unknown activity '{0}'")]
    UnknownActivity(String),

    #[error("unknown query type '{0}'")]
    UnknownQuery(String),

    #[error("workflow '{workflow_id}' is already {status}")]
    AlreadyTerminal {
        workflow_id: String,
        status: WorkflowStatus,
    },

    #[error("activity '{name}' failed: {failure}")]
    Activity { name: String, failure: Failure },

    #[error("non-deterministic replay of workflow '{workflow_id}': {detail}")]
    NonDeterminism { workflow_id: String, detail: String },

    #[error("workflow cancelled")]
    Cancelled,

    #[error("workflow timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow panicked: {0}")]
    Panic(String),

    #[error("store error for workflow '{workflow_id}': {source}")]
    Store {
        workflow_id: String,
        #[source]
        source: Arc<StoreError>,
    },

    #[error("payload encoding: {0}")]
    Payload(String),

    /// Failure raised by workflow code itself, or restored from a stored run.
    #[error("{}", .0.message)]
    Failed(Failure),
}

impl WorkflowError {
    pub fn application(msg: impl Into<String>) -> Self {
        WorkflowError::Failed(Failure::new(FailureKind::Application, msg))
    }

    pub(crate) fn store(workflow_id: &str, err: StoreError) -> Self {
        WorkflowError::Store {
            workflow_id: workflow_id.to_string(),
            source: Arc::new(err),
        }
    }

    pub fn is_non_determinism(&self) -> bool {
        matches!(self, WorkflowError::NonDeterminism { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled)
    }

    /// Failure detail persisted on the terminal event.
    pub fn to_failure(&self) -> Failure {
        match self {
            WorkflowError::Failed(f) => f.clone(),
            WorkflowError::Activity { failure, .. } => {
                Failure::new(failure.kind, self.to_string())
            }
            WorkflowError::NonDeterminism { .. } => {
                Failure::new(FailureKind::NonDeterminism, self.to_string())
            }
            WorkflowError::Cancelled => Failure::new(FailureKind::Cancelled, self.to_string()),
            WorkflowError::Timeout(_) => Failure::new(FailureKind::Timeout, self.to_string()),
            WorkflowError::Panic(_) => Failure::new(FailureKind::Panic, self.to_string()),
            WorkflowError::Store { .. } => Failure::new(FailureKind::Store, self.to_string()),
            _ => Failure::new(FailureKind::Application, self.to_string()),
        }
    }

    /// Rebuild the error a stored terminal run ended with.
    pub fn from_failure(workflow_id: &str, failure: Failure) -> Self {
        match failure.kind {
            FailureKind::Cancelled => WorkflowError::Cancelled,
            FailureKind::NonDeterminism => WorkflowError::NonDeterminism {
                workflow_id: workflow_id.to_string(),
                detail: failure.message,
            },
            _ => WorkflowError::Failed(failure),
        }
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        WorkflowError::application(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Payload(err.to_string())
    }
}
