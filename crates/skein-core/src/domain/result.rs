//! ResultRecord: what the result store keeps per task id.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{TaskId, TaskStatus, TaskType};

/// Why a task ended in FAILURE.
///
/// Callers use the kind to tell a timeout apart from a logic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The handler kept failing until `max_retries` was used up.
    RetriesExhausted,

    /// The hard time limit killed the last attempt.
    TaskTimeout,

    /// No handler is registered for the task type.
    UnregisteredTask,
}

/// Error payload of a FAILURE record. Returned to callers verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,

    /// Retries consumed before giving up.
    #[serde(default)]
    pub retries: u32,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Result store entry.
///
/// Invariants (held by the transition methods):
/// - `result` is present iff `status == Success`
/// - `error` is present iff `status == Failure`
/// - `last_error` is only present while the task is being retried (RETRY,
///   and STARTED on a later attempt)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    task_id: TaskId,
    task_type: TaskType,
    status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,

    /// Error of the previous attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<TaskError>,

    #[serde(default)]
    retries: u32,

    /// Success callback enqueued by this task. Chains are walked through it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link_id: Option<TaskId>,

    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ResultRecord {
    /// A fresh PENDING record that expires `ttl` after `now`.
    pub fn new(task_id: TaskId, task_type: TaskType, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            task_id,
            task_type,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            last_error: None,
            retries: 0,
            link_id: None,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn started(self, retries: u32) -> Self {
        self.in_progress(TaskStatus::Started, retries)
    }

    /// RETRY carrying the error that caused it.
    pub fn retrying(mut self, retries: u32, last_error: TaskError) -> Self {
        self.last_error = Some(last_error);
        self.in_progress(TaskStatus::Retry, retries)
    }

    pub fn succeeded(mut self, value: Value, link_id: Option<TaskId>) -> Self {
        self.status = TaskStatus::Success;
        self.result = Some(value);
        self.error = None;
        self.last_error = None;
        self.link_id = link_id;
        self
    }

    pub fn failed(mut self, error: TaskError) -> Self {
        self.status = TaskStatus::Failure;
        self.retries = error.retries;
        self.result = None;
        self.error = Some(error);
        self.last_error = None;
        self
    }

    fn in_progress(mut self, status: TaskStatus, retries: u32) -> Self {
        self.status = status;
        self.retries = retries;
        self.result = None;
        self.error = None;
        self
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn last_error(&self) -> Option<&TaskError> {
        self.last_error.as_ref()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn link_id(&self) -> Option<TaskId> {
        self.link_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
