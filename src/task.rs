//! Task definitions and wire encoding

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Queue used when a task does not name one
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget applied when a task does not set one
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Timeout applied at execution time when a task carries neither a
/// timeout nor a deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A unit of work: a type name selecting a handler plus an opaque payload.
///
/// Options attach via the builder methods and are resolved by the client
/// at enqueue time.
#[derive(Debug, Clone)]
pub struct Task {
    task_type: String,
    payload: Vec<u8>,
    opts: TaskOptions,
}

impl Task {
    /// Create a task of the given type with an opaque payload
    pub fn new<S: Into<String>>(task_type: S, payload: Vec<u8>) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            opts: TaskOptions::default(),
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn options(&self) -> &TaskOptions {
        &self.opts
    }

    /// Override the generated task id. Useful for client-side deduplication:
    /// enqueueing the same id twice fails with `TaskIdConflict`.
    pub fn task_id<S: Into<String>>(mut self, id: S) -> Self {
        self.opts.task_id = Some(id.into());
        self
    }

    /// Target a specific queue
    pub fn queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.opts.queue = Some(queue.into());
        self
    }

    /// Maximum number of retries before the task is archived
    pub fn max_retry(mut self, n: u32) -> Self {
        self.opts.max_retry = Some(n);
        self
    }

    /// Per-attempt execution timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.opts.timeout = Some(timeout);
        self
    }

    /// Absolute deadline after which the task is no longer worth running
    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.opts.deadline = Some(deadline);
        self
    }

    /// Do not run before the given time
    pub fn process_at(mut self, at: DateTime<Utc>) -> Self {
        self.opts.process_at = Some(at);
        self
    }

    /// Do not run before now + delay
    pub fn process_in(mut self, delay: Duration) -> Self {
        self.opts.process_at = Some(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        self
    }

    /// Reject enqueues of an equivalent task (same type, payload, and queue)
    /// for the given TTL while this one is in flight
    pub fn unique(mut self, ttl: Duration) -> Self {
        self.opts.unique_ttl = Some(ttl);
        self
    }

    /// Reject enqueues sharing this explicit key for the given TTL while
    /// this task is in flight
    pub fn unique_key<S: Into<String>>(mut self, key: S, ttl: Duration) -> Self {
        self.opts.unique_key = Some(key.into());
        self.opts.unique_ttl = Some(ttl);
        self
    }

    /// Aggregate with other tasks sharing the group before processing
    pub fn group<S: Into<String>>(mut self, group: S) -> Self {
        self.opts.group = Some(group.into());
        self
    }

    /// Keep the task around for this long after successful completion
    pub fn retention(mut self, retention: Duration) -> Self {
        self.opts.retention = Some(retention);
        self
    }
}

/// Enqueue-time options carried by a [`Task`]
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub task_id: Option<String>,
    pub queue: Option<String>,
    pub max_retry: Option<u32>,
    pub timeout: Option<Duration>,
    pub deadline: Option<DateTime<Utc>>,
    pub process_at: Option<DateTime<Utc>>,
    pub unique_ttl: Option<Duration>,
    pub unique_key: Option<String>,
    pub group: Option<String>,
    pub retention: Option<Duration>,
}

/// State of a task within its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Ready to be picked up by a processor
    Pending,
    /// Leased by a processor and running
    Active,
    /// Waiting for its process-at time
    Scheduled,
    /// Failed and waiting for its retry time
    Retry,
    /// Exhausted its retries or archived explicitly
    Archived,
    /// Finished and retained until its expiry
    Completed,
    /// Waiting in a group for aggregation
    Aggregating,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Scheduled => "scheduled",
            TaskState::Retry => "retry",
            TaskState::Archived => "archived",
            TaskState::Completed => "completed",
            TaskState::Aggregating => "aggregating",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "scheduled" => Ok(TaskState::Scheduled),
            "retry" => Ok(TaskState::Retry),
            "archived" => Ok(TaskState::Archived),
            "completed" => Ok(TaskState::Completed),
            "aggregating" => Ok(TaskState::Aggregating),
            other => Err(Error::invalid_argument(format!("unknown task state: {other}"))),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The task record stored in the `msg` field of the task hash.
///
/// Encoded as JSON bytes; serde serializes struct fields in declaration
/// order, so the encoding is deterministic and field-tagged. Durations are
/// seconds, timestamps unix seconds, zero meaning unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique task id (UUID unless the client overrode it)
    pub id: String,
    /// Handler selector
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Queue this task belongs to
    pub queue: String,
    /// Retry budget
    pub max_retry: u32,
    /// Retries consumed so far
    pub retried: u32,
    /// Per-attempt timeout in seconds, 0 = none
    pub timeout: i64,
    /// Absolute deadline in unix seconds, 0 = none
    pub deadline: i64,
    /// Uniqueness lock key, empty = none
    pub unique_key: String,
    /// Aggregation group, empty = none
    pub group_key: String,
    /// Retention after completion in seconds, 0 = delete on completion
    pub retention: i64,
    /// Completion time in unix seconds, set by the completed transition
    pub completed_at: i64,
    /// Message of the most recent failure
    pub last_err: String,
    /// Time of the most recent failure in unix seconds
    pub last_failed_at: i64,
}

impl TaskMessage {
    /// Encode to the stored wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the stored wire form
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Deadline for one execution attempt starting now:
    /// min over the non-zero members of {deadline, now + timeout}, falling
    /// back to [`DEFAULT_TIMEOUT`] when both are unset.
    pub fn attempt_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let from_timeout = if self.timeout > 0 {
            Some(now + chrono::Duration::seconds(self.timeout))
        } else {
            None
        };
        let absolute = if self.deadline > 0 {
            Utc.timestamp_opt(self.deadline, 0).single()
        } else {
            None
        };
        match (from_timeout, absolute) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                now + chrono::Duration::from_std(DEFAULT_TIMEOUT)
                    .unwrap_or_else(|_| chrono::Duration::zero())
            }
        }
    }
}

/// Snapshot of a task's durable state, for inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub last_err: String,
    pub last_failed_at: Option<DateTime<Utc>>,
    /// When the task will next be eligible to run, if knowable
    pub next_process_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Result bytes written by the handler, if any
    pub result: Option<Vec<u8>>,
}

impl TaskInfo {
    pub(crate) fn from_message(
        msg: TaskMessage,
        state: TaskState,
        next_process_at: Option<DateTime<Utc>>,
        result: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: msg.id,
            task_type: msg.task_type,
            payload: msg.payload,
            queue: msg.queue,
            state,
            max_retry: msg.max_retry,
            retried: msg.retried,
            last_err: msg.last_err,
            last_failed_at: if msg.last_failed_at > 0 {
                Utc.timestamp_opt(msg.last_failed_at, 0).single()
            } else {
                None
            },
            next_process_at,
            completed_at: if msg.completed_at > 0 {
                Utc.timestamp_opt(msg.completed_at, 0).single()
            } else {
                None
            },
            result,
        }
    }
}

/// Generate a fresh task id
pub(crate) fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> TaskMessage {
        TaskMessage {
            id: "3e8b7c1a-0000-4000-8000-9f4a1c2d3e4f".into(),
            task_type: "email:deliver".into(),
            payload: b"\x00\x01binary".to_vec(),
            queue: "default".into(),
            max_retry: 25,
            retried: 3,
            timeout: 1800,
            deadline: 1_900_000_000,
            unique_key: "dispatchq:{default}:unique:abc".into(),
            group_key: "notifications".into(),
            retention: 86_400,
            completed_at: 0,
            last_err: "smtp: connection refused".into(),
            last_failed_at: 1_899_000_000,
        }
    }

    #[test]
    fn encode_decode_round_trip_preserves_every_field() {
        let msg = message();
        let decoded = TaskMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn encoding_is_deterministic() {
        let msg = message();
        assert_eq!(msg.encode().unwrap(), msg.encode().unwrap());
    }

    #[test]
    fn attempt_deadline_prefers_the_earlier_bound() {
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        let mut msg = message();

        msg.timeout = 60;
        msg.deadline = 1_000_030;
        assert_eq!(msg.attempt_deadline(now).timestamp(), 1_000_030);

        msg.deadline = 1_000_120;
        assert_eq!(msg.attempt_deadline(now).timestamp(), 1_000_060);

        msg.timeout = 0;
        assert_eq!(msg.attempt_deadline(now).timestamp(), 1_000_120);

        msg.deadline = 0;
        assert_eq!(
            msg.attempt_deadline(now).timestamp(),
            now.timestamp() + DEFAULT_TIMEOUT.as_secs() as i64
        );
    }

    #[test]
    fn task_state_round_trips_through_strings() {
        for state in [
            TaskState::Pending,
            TaskState::Active,
            TaskState::Scheduled,
            TaskState::Retry,
            TaskState::Archived,
            TaskState::Completed,
            TaskState::Aggregating,
        ] {
            assert_eq!(TaskState::parse(state.as_str()).unwrap(), state);
        }
        assert!(TaskState::parse("running").is_err());
    }
}
