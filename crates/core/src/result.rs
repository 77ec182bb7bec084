//! Stored task results and their client-facing projection.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::id::TaskId;
use crate::state::TaskState;
use crate::task::TaskInvocation;

/// What the worker writes to the result store, keyed by task id.
///
/// Records only move forward (see [`TaskState::can_transition_to`]) and
/// expire after the configured retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub task: String,
    pub state: TaskState,
    /// Handler payload (SUCCESS only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error description (FAILURE, and the last error for RETRY).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Intermediate info for STARTED/RETRY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub retries: u32,
    pub updated_at: DateTime<Utc>,
}

impl TaskResult {
    fn base(invocation: &TaskInvocation, state: TaskState) -> Self {
        Self {
            task_id: invocation.id,
            task: invocation.task.clone(),
            state,
            result: None,
            error: None,
            meta: None,
            retries: invocation.retries,
            updated_at: Utc::now(),
        }
    }

    pub fn pending(invocation: &TaskInvocation) -> Self {
        Self::base(invocation, TaskState::Pending)
    }

    pub fn started(invocation: &TaskInvocation, worker: &str) -> Self {
        Self {
            meta: Some(json!({ "worker": worker, "retries": invocation.retries })),
            ..Self::base(invocation, TaskState::Started)
        }
    }

    /// RETRY record written before the invocation is redelivered; carries the
    /// incremented retry count.
    pub fn retry(invocation: &TaskInvocation, error: impl Into<String>, countdown_ms: u64) -> Self {
        let error = error.into();
        let retries = invocation.retries + 1;
        Self {
            retries,
            meta: Some(json!({
                "retries": retries,
                "last_error": error,
                "countdown_ms": countdown_ms,
            })),
            error: Some(error),
            ..Self::base(invocation, TaskState::Retry)
        }
    }

    pub fn success(invocation: &TaskInvocation, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::base(invocation, TaskState::Success)
        }
    }

    pub fn failure(invocation: &TaskInvocation, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::base(invocation, TaskState::Failure)
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        TaskStatus::from_result(self)
    }
}

/// Client-facing state. Mirrors [`TaskState`] plus `UNKNOWN` for identifiers
/// with no record (never issued, or expired).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    Unknown,
}

impl From<TaskState> for StatusState {
    fn from(value: TaskState) -> Self {
        match value {
            TaskState::Pending => StatusState::Pending,
            TaskState::Started => StatusState::Started,
            TaskState::Retry => StatusState::Retry,
            TaskState::Success => StatusState::Success,
            TaskState::Failure => StatusState::Failure,
        }
    }
}

/// How to report an identifier that has no stored record.
///
/// The store cannot tell "never issued" from "expired", and a submitted task
/// always has at least a PENDING record, so `Unknown` is the default. `Pending`
/// reproduces the Celery behaviour for clients that depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownTaskPolicy {
    #[default]
    Unknown,
    Pending,
}

impl FromStr for UnknownTaskPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "pending" => Ok(Self::Pending),
            other => Err(format!("expected `unknown` or `pending`, got `{other}`")),
        }
    }
}

/// Status API response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: StatusState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskStatus {
    /// SUCCESS carries the payload, FAILURE the error, STARTED/RETRY their
    /// intermediate info, PENDING nothing.
    pub fn from_result(record: &TaskResult) -> Self {
        let (result, error) = match record.state {
            TaskState::Success => (record.result.clone(), None),
            TaskState::Failure => (None, record.error.clone()),
            TaskState::Pending => (None, None),
            TaskState::Started => (record.meta.clone(), None),
            TaskState::Retry => (record.meta.clone(), record.error.clone()),
        };

        Self {
            task_id: record.task_id,
            state: record.state.into(),
            result,
            error,
        }
    }

    pub fn absent(task_id: TaskId, policy: UnknownTaskPolicy) -> Self {
        let state = match policy {
            UnknownTaskPolicy::Unknown => StatusState::Unknown,
            UnknownTaskPolicy::Pending => StatusState::Pending,
        };
        Self {
            task_id,
            state,
            result: None,
            error: None,
        }
    }
}
