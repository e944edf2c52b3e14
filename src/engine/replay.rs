//! Replay engine: answers workflow requests from recorded history.
//!
//! History is indexed once by command kind. Each activity or timer request the
//! workflow function makes takes the next per-kind sequence number; the engine
//! looks that sequence up and resolves the request from the recorded events
//! instead of invoking the side effect. Matching by sequence rather than by
//! position tolerates completions of concurrently dispatched activities landing
//! in any relative order.
//!
//! Once a kind's recorded commands are exhausted, new requests of that kind
//! fall through to live execution.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::engine::types::{EventType, Failure, FailureKind, HistoryEvent};

#[derive(Debug, Clone)]
struct RecordedActivity {
    name: String,
    input: Value,
    outcome: Option<Result<Value, Failure>>,
}

#[derive(Debug, Clone)]
struct RecordedTimer {
    duration_ms: Option<u64>,
    fire_at: Option<DateTime<Utc>>,
    fired: bool,
}

/// How an activity request resolves against history.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityReplay {
    /// Not recorded: execute live and record `ActivityStarted`.
    Live,
    /// `ActivityStarted` recorded without an outcome: execute again, record only the outcome.
    InFlight,
    Completed(Value),
    Failed(Failure),
    /// History expects a different request at this sequence.
    Mismatch(String),
}

/// How a timer request resolves against history.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerReplay {
    Live,
    /// Started but not fired: wait until the recorded deadline.
    Pending(DateTime<Utc>),
    Fired,
    Mismatch(String),
}

pub struct ReplayEngine {
    activities: BTreeMap<u64, RecordedActivity>,
    timers: BTreeMap<u64, RecordedTimer>,
    next_activity_seq: u64,
    next_timer_seq: u64,
    started_at: DateTime<Utc>,
}

impl ReplayEngine {
    pub fn new(history: &[HistoryEvent]) -> Self {
        let mut activities: BTreeMap<u64, RecordedActivity> = BTreeMap::new();
        let mut timers: BTreeMap<u64, RecordedTimer> = BTreeMap::new();
        let mut started_at = None;

        for event in history {
            match event.event_type {
                EventType::WorkflowStarted => {
                    started_at.get_or_insert(event.timestamp);
                }
                EventType::ActivityStarted => {
                    if let Some(seq) = event.sequence {
                        activities.entry(seq).or_insert_with(|| RecordedActivity {
                            name: event.activity_name.clone().unwrap_or_default(),
                            input: event.payload.clone().unwrap_or(Value::Null),
                            outcome: None,
                        });
                    }
                }
                EventType::ActivityCompleted | EventType::ActivityFailed => {
                    let Some(seq) = event.sequence else { continue };
                    let Some(recorded) = activities.get_mut(&seq) else {
                        continue;
                    };
                    if recorded.outcome.is_some() {
                        continue;
                    }
                    recorded.outcome = Some(if event.event_type == EventType::ActivityCompleted {
                        Ok(event.result.clone().unwrap_or(Value::Null))
                    } else {
                        Err(event
                            .error
                            .clone()
                            .unwrap_or_else(|| Failure::new(FailureKind::Application, "unknown failure")))
                    });
                }
                EventType::TimerStarted => {
                    if let Some(seq) = event.sequence {
                        timers.entry(seq).or_insert_with(|| RecordedTimer {
                            duration_ms: event
                                .payload
                                .as_ref()
                                .and_then(|p| p.get("duration_ms"))
                                .and_then(|v| v.as_u64()),
                            fire_at: event.fire_at,
                            fired: false,
                        });
                    }
                }
                EventType::TimerFired => {
                    if let Some(timer) = event.sequence.and_then(|seq| timers.get_mut(&seq)) {
                        timer.fired = true;
                    }
                }
                _ => {}
            }
        }

        Self {
            activities,
            timers,
            next_activity_seq: 0,
            next_timer_seq: 0,
            started_at: started_at.unwrap_or_else(Utc::now),
        }
    }

    /// Timestamp of `WorkflowStarted`, stable across replays.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn next_activity_seq(&mut self) -> u64 {
        let seq = self.next_activity_seq;
        self.next_activity_seq += 1;
        seq
    }

    pub fn next_timer_seq(&mut self) -> u64 {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        seq
    }

    /// True while recorded commands remain ahead of the cursors.
    pub fn is_replaying(&self) -> bool {
        self.activities.range(self.next_activity_seq..).next().is_some()
            || self.timers.range(self.next_timer_seq..).next().is_some()
    }

    pub fn activity(&self, seq: u64, name: &str, input: &Value) -> ActivityReplay {
        let Some(recorded) = self.activities.get(&seq) else {
            return ActivityReplay::Live;
        };
        if recorded.name != name {
            return ActivityReplay::Mismatch(format!(
                "activity #{} was recorded as '{}' but the workflow requested '{}'",
                seq, recorded.name, name
            ));
        }
        if &recorded.input != input {
            return ActivityReplay::Mismatch(format!(
                "activity #{} '{}' was recorded with input {} but the workflow passed {}",
                seq, name, recorded.input, input
            ));
        }
        match &recorded.outcome {
            None => ActivityReplay::InFlight,
            Some(Ok(result)) => ActivityReplay::Completed(result.clone()),
            Some(Err(failure)) => ActivityReplay::Failed(failure.clone()),
        }
    }

    pub fn timer(&self, seq: u64, duration: Duration) -> TimerReplay {
        let Some(recorded) = self.timers.get(&seq) else {
            return TimerReplay::Live;
        };
        let requested = duration.as_millis() as u64;
        if let Some(recorded_ms) = recorded.duration_ms
            && recorded_ms != requested
        {
            return TimerReplay::Mismatch(format!(
                "timer #{} was recorded for {}ms but the workflow requested {}ms",
                seq, recorded_ms, requested
            ));
        }
        if recorded.fired {
            return TimerReplay::Fired;
        }
        // A start without a recorded deadline fires immediately.
        TimerReplay::Pending(recorded.fire_at.unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    /// Describe recorded commands the function never requested, if any.
    pub fn unconsumed(&self) -> Option<String> {
        let activities: Vec<String> = self
            .activities
            .range(self.next_activity_seq..)
            .map(|(seq, a)| format!("activity #{} '{}'", seq, a.name))
            .collect();
        let timers: Vec<String> = self
            .timers
            .range(self.next_timer_seq..)
            .map(|(seq, _)| format!("timer #{}", seq))
            .collect();
        let all: Vec<String> = activities.into_iter().chain(timers).collect();
        if all.is_empty() {
            None
        } else {
            Some(format!(
                "workflow returned with recorded commands never requested: {}",
                all.join(", ")
            ))
        }
    }
}

/// Payload recorded on `TimerStarted`.
pub(crate) fn timer_payload(duration: Duration) -> Value {
    json!({ "duration_ms": duration.as_millis() as u64 })
}
