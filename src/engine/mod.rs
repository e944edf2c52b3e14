pub mod context;
pub mod error;
pub mod executor;
pub mod handle;
pub mod replay;
pub(crate) mod run;
pub mod types;
pub mod worker;

pub use context::WorkflowContext;
pub use error::{ActivityError, WorkflowError};
pub use executor::{Executor, ExecutorBuilder, ExecutorConfig, NoopHooks, WorkflowHooks};
pub use handle::WorkflowHandle;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
