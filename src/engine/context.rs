use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::engine::error::WorkflowError;
use crate::engine::replay::{ActivityReplay, ReplayEngine, TimerReplay, timer_payload};
use crate::engine::run::Run;
use crate::engine::types::*;
use crate::engine::worker::{ActivityCall, ActivityWorker};

/// Handle through which workflow code requests durable operations.
///
/// Cheap to clone; all clones drive the same run.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    run: Arc<Run>,
    worker: Arc<ActivityWorker>,
    replay: Mutex<ReplayEngine>,
    signal_cursors: Mutex<HashMap<String, usize>>,
    /// First fatal error seen; overrides whatever the function returns.
    fatal: Mutex<Option<WorkflowError>>,
}

impl WorkflowContext {
    pub(crate) fn new(run: Arc<Run>, worker: Arc<ActivityWorker>, history: &[HistoryEvent]) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run,
                worker,
                replay: Mutex::new(ReplayEngine::new(history)),
                signal_cursors: Mutex::new(HashMap::new()),
                fatal: Mutex::new(None),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.run.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run.run_id
    }

    /// True while recorded commands are still being replayed.
    pub fn is_replaying(&self) -> bool {
        self.inner.replay.lock().is_replaying()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.run.cancel_token().is_cancelled()
    }

    /// Replay-safe timestamp of the run's start.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.replay.lock().started_at()
    }

    pub async fn execute_activity(&self, name: &str, input: Value) -> Result<Value, WorkflowError> {
        self.execute_activity_with(name, input, ActivityOptions::default())
            .await
    }

    /// Execute an activity, or return its recorded outcome when replaying.
    pub async fn execute_activity_with(
        &self,
        name: &str,
        input: Value,
        options: ActivityOptions,
    ) -> Result<Value, WorkflowError> {
        self.ensure_live()?;
        let (sequence, lookup) = {
            let mut replay = self.inner.replay.lock();
            let sequence = replay.next_activity_seq();
            (sequence, replay.activity(sequence, name, &input))
        };

        let in_flight = match lookup {
            ActivityReplay::Completed(result) => {
                debug!(
                    workflow_id = %self.workflow_id(),
                    activity = %name,
                    sequence = sequence,
                    "Replayed activity result"
                );
                return Ok(result);
            }
            ActivityReplay::Failed(failure) => {
                debug!(
                    workflow_id = %self.workflow_id(),
                    activity = %name,
                    sequence = sequence,
                    "Replayed activity failure"
                );
                return Err(WorkflowError::Activity {
                    name: name.to_string(),
                    failure,
                });
            }
            ActivityReplay::Mismatch(detail) => return Err(self.non_determinism(detail)),
            ActivityReplay::InFlight => true,
            ActivityReplay::Live => false,
        };

        // Only live and interrupted requests need the implementation.
        let activity = self
            .inner
            .worker
            .registry()
            .get(name)
            .ok_or_else(|| WorkflowError::UnknownActivity(name.to_string()))?;

        if in_flight {
            info!(
                workflow_id = %self.workflow_id(),
                activity = %name,
                sequence = sequence,
                "Re-dispatching activity interrupted before its outcome was recorded"
            );
        } else {
            let started = HistoryEvent::new(EventType::ActivityStarted)
                .activity(name, sequence)
                .with_payload(input.clone());
            self.guard(self.inner.run.record(started).await)?;
        }

        let call = ActivityCall {
            workflow_id: self.workflow_id().to_string(),
            run_id: self.run_id().to_string(),
            name: name.to_string(),
            input,
            options,
        };
        let reply = self
            .inner
            .worker
            .dispatch(Arc::clone(&self.inner.run), activity, sequence, call);

        tokio::select! {
            outcome = reply => match outcome {
                Ok(result) => self.guard(result),
                Err(_) => Err(WorkflowError::Activity {
                    name: name.to_string(),
                    failure: Failure::new(FailureKind::Panic, "activity task ended without a result"),
                }),
            },
            _ = self.inner.run.cancel_token().cancelled() => Err(WorkflowError::Cancelled),
        }
    }

    /// Typed wrapper around [`execute_activity`](Self::execute_activity).
    pub async fn activity<I, O>(&self, name: &str, input: &I) -> Result<O, WorkflowError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let output = self.execute_activity(name, input).await?;
        Ok(serde_json::from_value(output)?)
    }

    /// Durable timer. Resolves immediately on replay if it already fired.
    pub async fn sleep(&self, duration: Duration) -> Result<(), WorkflowError> {
        self.ensure_live()?;
        let (sequence, lookup) = {
            let mut replay = self.inner.replay.lock();
            let sequence = replay.next_timer_seq();
            (sequence, replay.timer(sequence, duration))
        };

        let fire_at = match lookup {
            TimerReplay::Fired => return Ok(()),
            TimerReplay::Mismatch(detail) => return Err(self.non_determinism(detail)),
            TimerReplay::Pending(fire_at) => fire_at,
            TimerReplay::Live => {
                let fire_at = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let started = HistoryEvent::new(EventType::TimerStarted)
                    .timer(sequence)
                    .with_payload(timer_payload(duration))
                    .with_fire_at(fire_at);
                self.guard(self.inner.run.record(started).await)?;
                fire_at
            }
        };

        let remaining = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = self.inner.run.cancel_token().cancelled() => return Err(WorkflowError::Cancelled),
        }

        let fired = HistoryEvent::new(EventType::TimerFired)
            .timer(sequence)
            .with_fire_at(fire_at);
        self.guard(self.inner.run.record(fired).await)?;
        Ok(())
    }

    /// Wait for the next signal named `name` and return its payload.
    ///
    /// The k-th wait on a name returns the k-th signal of that name, whether
    /// it arrived before the wait began or is being replayed.
    pub async fn wait_signal(&self, name: &str) -> Result<Value, WorkflowError> {
        self.ensure_live()?;
        let index = self
            .inner
            .signal_cursors
            .lock()
            .get(name)
            .copied()
            .unwrap_or(0);
        let mut changes = self.inner.run.signal_watch();

        loop {
            if let Some(payload) = self.inner.run.signal_payload(name, index).await {
                *self
                    .inner
                    .signal_cursors
                    .lock()
                    .entry(name.to_string())
                    .or_insert(0) += 1;
                return Ok(payload);
            }
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(WorkflowError::Cancelled);
                    }
                }
                _ = self.inner.run.cancel_token().cancelled() => return Err(WorkflowError::Cancelled),
            }
        }
    }

    fn ensure_live(&self) -> Result<(), WorkflowError> {
        if let Some(fatal) = self.inner.fatal.lock().as_ref() {
            return Err(fatal.clone());
        }
        if self.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Store failures are fatal for the run even if the function handles them.
    fn guard<T>(&self, result: Result<T, WorkflowError>) -> Result<T, WorkflowError> {
        if let Err(e @ WorkflowError::Store { .. }) = &result {
            self.inner.fatal.lock().get_or_insert_with(|| e.clone());
        }
        result
    }

    fn non_determinism(&self, detail: String) -> WorkflowError {
        error!(workflow_id = %self.workflow_id(), detail = %detail, "Non-deterministic replay");
        let err = WorkflowError::NonDeterminism {
            workflow_id: self.workflow_id().to_string(),
            detail,
        };
        self.inner.fatal.lock().get_or_insert_with(|| err.clone());
        err
    }

    pub(crate) fn take_fatal(&self) -> Option<WorkflowError> {
        self.inner.fatal.lock().take()
    }

    /// Non-determinism error for recorded commands the function skipped.
    pub(crate) fn unconsumed(&self) -> Option<WorkflowError> {
        let detail = self.inner.replay.lock().unconsumed()?;
        Some(WorkflowError::NonDeterminism {
            workflow_id: self.workflow_id().to_string(),
            detail,
        })
    }
}
