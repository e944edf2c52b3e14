use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            WorkflowStatus::Pending => 0,
            WorkflowStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether a run in this status may be saved with `next`.
    ///
    /// Re-saving the same status is always allowed (history keeps growing).
    /// Otherwise status only moves forward and never leaves a terminal value.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("Invalid workflow status: {}", other)),
        }
    }
}

/// Kind of fact recorded in a run's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EventType {
    WorkflowStarted,
    ActivityStarted,
    ActivityCompleted,
    ActivityFailed,
    TimerStarted,
    TimerFired,
    SignalReceived,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Classification carried by every recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Ordinary error, retried until the policy was exhausted.
    Application,
    NonRetryable,
    Timeout,
    Cancelled,
    NonDeterminism,
    Panic,
    Store,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Application => "application",
            FailureKind::NonRetryable => "non_retryable",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::NonDeterminism => "non_determinism",
            FailureKind::Panic => "panic",
            FailureKind::Store => "store",
        };
        f.write_str(s)
    }
}

/// Serialized failure detail stored in history and on terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// One fact in a run's timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Assigned at append time; strictly increasing within a run.
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_name: Option<String>,
    /// Per-kind request sequence for activity and timer events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    /// Informational only. Replay never reads it.
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
}

impl HistoryEvent {
    /// Build an event with no id yet; [`WorkflowState::append`] assigns it.
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: 0,
            event_type,
            activity_name: None,
            sequence: None,
            signal_name: None,
            timestamp: Utc::now(),
            payload: None,
            result: None,
            error: None,
            attempts: None,
            fire_at: None,
        }
    }

    pub fn activity(mut self, name: &str, sequence: u64) -> Self {
        self.activity_name = Some(name.to_string());
        self.sequence = Some(sequence);
        self
    }

    pub fn timer(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn signal(mut self, name: &str) -> Self {
        self.signal_name = Some(name.to_string());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: Failure) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_fire_at(mut self, fire_at: DateTime<Utc>) -> Self {
        self.fire_at = Some(fire_at);
        self
    }
}

/// Durable snapshot of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    #[serde(default)]
    pub run_id: String,
    /// Registered workflow name, used to resume the run after a restart.
    #[serde(default)]
    pub workflow_type: String,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(workflow_id: &str, run_id: &str, workflow_type: &str, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::Pending,
            input,
            result: None,
            error: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn last_event_id(&self) -> u64 {
        self.history.last().map(|e| e.id).unwrap_or(0)
    }

    /// Append an event, assigning the next id. Returns the assigned id.
    pub fn append(&mut self, mut event: HistoryEvent) -> u64 {
        let id = self.last_event_id() + 1;
        event.id = id;
        self.history.push(event);
        self.updated_at = Utc::now();
        id
    }

    pub fn has_event(&self, event_type: EventType) -> bool {
        self.history.iter().any(|e| e.event_type == event_type)
    }
}

/// Query predicate for [`crate::storage::WorkflowStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowFilter {
    /// `None` matches any status.
    pub status: Option<WorkflowStatus>,
    /// 0 means unlimited.
    pub limit: usize,
}

impl WorkflowFilter {
    pub fn with_status(status: WorkflowStatus) -> Self {
        Self {
            status: Some(status),
            limit: 0,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, state: &WorkflowState) -> bool {
        self.status.is_none_or(|s| s == state.status)
    }

    /// Apply status filter and limit to an already-collected set of runs.
    pub fn apply(&self, states: impl IntoIterator<Item = WorkflowState>) -> Vec<WorkflowState> {
        let matching = states.into_iter().filter(|s| self.matches(s));
        if self.limit == 0 {
            matching.collect()
        } else {
            matching.take(self.limit).collect()
        }
    }
}

/// Retry configuration for an activity or for store saves.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self::default()
    }

    pub fn with_backoff(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_interval(mut self, max: Duration) -> Self {
        self.max_interval = Some(max);
        self
    }

    /// Delay before the attempt that follows `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.max(1.0).powi(exp);
        if !secs.is_finite() {
            return self.max_interval.unwrap_or(self.initial_interval);
        }
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_interval {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Per-call activity options.
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    pub retry: RetryPolicy,
    /// Per-attempt start-to-close timeout.
    pub timeout: Option<Duration>,
}

impl ActivityOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Options for starting or resuming a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowOptions {
    /// Caller-supplied id. Absent or empty generates `wf-<uuid>`.
    pub id: Option<String>,
    pub input: serde_json::Value,
    pub timeout: Option<Duration>,
}

impl WorkflowOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// External message delivered to a running workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub name: String,
    pub payload: serde_json::Value,
}

impl Signal {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}
