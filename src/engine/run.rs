use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::engine::error::WorkflowError;
use crate::engine::types::*;
use crate::storage::{StoreError, WorkflowStore};

type Outcome = Result<Value, WorkflowError>;

/// In-process state of one resident run.
///
/// `state` always equals the last snapshot the store accepted. Every durable
/// transition clones it, applies the change, saves, and only then commits, so
/// memory never runs ahead of the store. Saves for one run are serialized by
/// the same lock, which also makes event id assignment collision free.
pub(crate) struct Run {
    pub workflow_id: String,
    pub run_id: String,
    state: Mutex<WorkflowState>,
    store: Arc<dyn WorkflowStore>,
    store_retry: RetryPolicy,
    /// Set when a save could not be completed; nothing is persisted afterwards.
    halted: AtomicBool,
    status: watch::Sender<WorkflowStatus>,
    signals: watch::Sender<u64>,
    outcome: watch::Sender<Option<Outcome>>,
    cancel: CancellationToken,
}

impl Run {
    pub fn new(state: WorkflowState, store: Arc<dyn WorkflowStore>, store_retry: RetryPolicy) -> Arc<Self> {
        let (status, _) = watch::channel(state.status);
        let (signals, _) = watch::channel(0);
        let (outcome, _) = watch::channel(None);
        Arc::new(Self {
            workflow_id: state.workflow_id.clone(),
            run_id: state.run_id.clone(),
            state: Mutex::new(state),
            store,
            store_retry,
            halted: AtomicBool::new(false),
            status,
            signals,
            outcome,
            cancel: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.status.borrow()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn snapshot(&self) -> WorkflowState {
        self.state.lock().await.clone()
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match self.store.save(state).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.store_retry.max_attempts => {
                    let delay = self.store_retry.delay_after(attempt);
                    warn!(
                        workflow_id = %self.workflow_id,
                        attempt = attempt,
                        error = %e,
                        "Store save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn halt(&self, err: &StoreError) {
        error!(workflow_id = %self.workflow_id, error = %err, "Workflow state could not be persisted");
        self.halted.store(true, Ordering::SeqCst);
        self.status.send_replace(WorkflowStatus::Failed);
    }

    fn ensure_not_halted(&self) -> Result<(), WorkflowError> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(WorkflowError::store(
                &self.workflow_id,
                StoreError::Config("run halted after an earlier save failure".to_string()),
            ));
        }
        Ok(())
    }

    /// Apply `mutate` to a copy of the state, persist it, then commit.
    ///
    /// If `mutate` fails nothing is saved.
    pub async fn try_commit<F, R>(&self, mutate: F) -> Result<R, WorkflowError>
    where
        F: FnOnce(&mut WorkflowState) -> Result<R, WorkflowError>,
    {
        self.ensure_not_halted()?;
        let mut guard = self.state.lock().await;
        let mut next = guard.clone();
        let value = mutate(&mut next)?;
        if let Err(e) = self.save(&next).await {
            self.halt(&e);
            return Err(WorkflowError::store(&self.workflow_id, e));
        }
        *guard = next;
        self.status.send_replace(guard.status);
        Ok(value)
    }

    pub async fn commit<F, R>(&self, mutate: F) -> Result<R, WorkflowError>
    where
        F: FnOnce(&mut WorkflowState) -> R,
    {
        self.try_commit(|state| Ok(mutate(state))).await
    }

    /// Append one event. Allowed after the run became terminal (audit records).
    pub async fn record(&self, event: HistoryEvent) -> Result<u64, WorkflowError> {
        self.commit(|state| state.append(event)).await
    }

    pub async fn record_signal(&self, signal: &Signal) -> Result<(), WorkflowError> {
        let workflow_id = self.workflow_id.clone();
        self.try_commit(|state| {
            if state.status.is_terminal() {
                return Err(WorkflowError::AlreadyTerminal {
                    workflow_id,
                    status: state.status,
                });
            }
            state.append(
                HistoryEvent::new(EventType::SignalReceived)
                    .signal(&signal.name)
                    .with_payload(signal.payload.clone()),
            );
            Ok(())
        })
        .await?;
        self.signals.send_modify(|n| *n += 1);
        Ok(())
    }

    /// Payload of the `index`-th `SignalReceived` named `name`, in history order.
    pub async fn signal_payload(&self, name: &str, index: usize) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .history
            .iter()
            .filter(|e| {
                e.event_type == EventType::SignalReceived && e.signal_name.as_deref() == Some(name)
            })
            .nth(index)
            .map(|e| e.payload.clone().unwrap_or(Value::Null))
    }

    pub fn signal_watch(&self) -> watch::Receiver<u64> {
        self.signals.subscribe()
    }

    /// Record the terminal event for `outcome` and return the outcome callers observe.
    pub async fn finish(&self, outcome: Outcome) -> Outcome {
        if let Err(e) = self.ensure_not_halted() {
            return Err(match outcome {
                Err(original @ WorkflowError::Store { .. }) => original,
                _ => e,
            });
        }

        let mut guard = self.state.lock().await;
        if guard.status.is_terminal() {
            return stored_outcome(&guard);
        }

        let mut next = guard.clone();
        match &outcome {
            Ok(result) => {
                next.append(HistoryEvent::new(EventType::WorkflowCompleted).with_result(result.clone()));
                next.status = WorkflowStatus::Completed;
                next.result = Some(result.clone());
            }
            Err(e) => {
                let failure = e.to_failure();
                let (event_type, status) = if e.is_cancelled() {
                    (EventType::WorkflowCancelled, WorkflowStatus::Cancelled)
                } else {
                    (EventType::WorkflowFailed, WorkflowStatus::Failed)
                };
                next.append(HistoryEvent::new(event_type).with_error(failure.clone()));
                next.status = status;
                next.error = Some(failure);
            }
        }

        match self.save(&next).await {
            Ok(()) => {
                *guard = next;
                self.status.send_replace(guard.status);
                outcome
            }
            Err(e) => {
                self.halt(&e);
                Err(WorkflowError::store(&self.workflow_id, e))
            }
        }
    }

    pub fn publish(&self, outcome: Outcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub async fn wait_outcome(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(WorkflowError::Cancelled)),
            Err(_) => Err(WorkflowError::Cancelled),
        }
    }
}

/// Outcome a terminal state ended with.
pub(crate) fn stored_outcome(state: &WorkflowState) -> Outcome {
    match state.status {
        WorkflowStatus::Completed => Ok(state.result.clone().unwrap_or(Value::Null)),
        status => {
            let failure = state.error.clone().unwrap_or_else(|| {
                let kind = if status == WorkflowStatus::Cancelled {
                    FailureKind::Cancelled
                } else {
                    FailureKind::Application
                };
                Failure::new(kind, format!("workflow {}", status))
            });
            Err(WorkflowError::from_failure(&state.workflow_id, failure))
        }
    }
}
