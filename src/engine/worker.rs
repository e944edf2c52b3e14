use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::activities::{Activity, ActivityContext, ActivityRegistry};
use crate::engine::error::{ActivityError, WorkflowError};
use crate::engine::panic_message;
use crate::engine::run::Run;
use crate::engine::types::{ActivityOptions, EventType, HistoryEvent};

/// One activity invocation requested by a workflow.
#[derive(Debug, Clone)]
pub struct ActivityCall {
    pub workflow_id: String,
    pub run_id: String,
    pub name: String,
    pub input: Value,
    pub options: ActivityOptions,
}

#[derive(Debug, Clone)]
pub struct ActivityOutcome {
    pub result: Result<Value, ActivityError>,
    /// Attempts used, including the final one.
    pub attempts: u32,
}

/// Runs activity attempts on a bounded pool.
pub struct ActivityWorker {
    registry: Arc<ActivityRegistry>,
    permits: Arc<Semaphore>,
}

impl ActivityWorker {
    pub fn new(registry: Arc<ActivityRegistry>, max_concurrent: usize) -> Self {
        Self {
            registry,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    /// Attempts currently allowed to start.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `activity` until it succeeds, fails terminally, or the retry
    /// policy is exhausted.
    pub async fn execute(
        &self,
        activity: Arc<dyn Activity>,
        call: &ActivityCall,
        cancel: &CancellationToken,
    ) -> ActivityOutcome {
        let retry = &call.options.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(
                workflow_id = %call.workflow_id,
                activity = %call.name,
                attempt = attempt,
                "Executing activity attempt"
            );
            match self.attempt(&activity, call, attempt, cancel).await {
                Ok(result) => {
                    return ActivityOutcome {
                        result: Ok(result),
                        attempts: attempt,
                    };
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        workflow_id = %call.workflow_id,
                        activity = %call.name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Activity attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return ActivityOutcome {
                                result: Err(ActivityError::Cancelled),
                                attempts: attempt,
                            };
                        }
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        workflow_id = %call.workflow_id,
                        activity = %call.name,
                        attempts = attempt,
                        error = %e,
                        "Activity failed"
                    );
                    return ActivityOutcome {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        activity: &Arc<dyn Activity>,
        call: &ActivityCall,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<Value, ActivityError> {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(ActivityError::Cancelled),
            },
            _ = cancel.cancelled() => return Err(ActivityError::Cancelled),
        };

        let ctx = ActivityContext::new(
            &call.workflow_id,
            &call.run_id,
            &call.name,
            attempt,
            cancel.child_token(),
        );
        let body = async {
            match AssertUnwindSafe(activity.execute(ctx, call.input.clone()))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(ActivityError::Panic(panic_message(panic.as_ref()))),
            }
        };
        let bounded = async {
            match call.options.timeout {
                Some(limit) => tokio::time::timeout(limit, body)
                    .await
                    .unwrap_or_else(|_| Err(ActivityError::Timeout(limit))),
                None => body.await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = cancel.cancelled() => Err(ActivityError::Cancelled),
        }
    }

    /// Execute on a spawned task, record the outcome event on `run`, and
    /// reply with the result the workflow observes.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        run: Arc<Run>,
        activity: Arc<dyn Activity>,
        sequence: u64,
        call: ActivityCall,
    ) -> oneshot::Receiver<Result<Value, WorkflowError>> {
        let (tx, rx) = oneshot::channel();
        let worker = Arc::clone(self);
        let cancel = run.cancel_token().child_token();

        tokio::spawn(async move {
            let outcome = worker.execute(activity, &call, &cancel).await;
            let event = match &outcome.result {
                Ok(result) => HistoryEvent::new(EventType::ActivityCompleted)
                    .activity(&call.name, sequence)
                    .with_result(result.clone()),
                Err(e) => HistoryEvent::new(EventType::ActivityFailed)
                    .activity(&call.name, sequence)
                    .with_error(e.to_failure()),
            }
            .with_attempts(outcome.attempts);

            let reply = match (run.record(event).await, outcome.result) {
                (Err(e), _) => Err(e),
                (Ok(_), Ok(result)) => {
                    info!(
                        workflow_id = %call.workflow_id,
                        activity = %call.name,
                        sequence = sequence,
                        attempts = outcome.attempts,
                        "Activity completed"
                    );
                    Ok(result)
                }
                (Ok(_), Err(e)) => Err(WorkflowError::Activity {
                    name: call.name.clone(),
                    failure: e.to_failure(),
                }),
            };
            // The workflow may have stopped waiting; the event is recorded regardless.
            let _ = tx.send(reply);
        });

        rx
    }
}
