pub mod activities;
pub mod api;
pub mod cli;
pub mod engine;
pub mod storage;
pub mod workflows;

pub use activities::{Activity, ActivityContext, ActivityRegistry, activity_fn};
pub use engine::types::{
    ActivityOptions, EventType, Failure, FailureKind, HistoryEvent, RetryPolicy, Signal,
    WorkflowFilter, WorkflowOptions, WorkflowState, WorkflowStatus,
};
pub use engine::{
    ActivityError, Executor, ExecutorConfig, WorkflowContext, WorkflowError, WorkflowHandle,
    WorkflowHooks,
};
pub use storage::{StoreError, WorkflowStore};
pub use workflows::{Workflow, WorkflowRegistry, workflow_fn};
