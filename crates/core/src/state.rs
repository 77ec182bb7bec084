//! Task lifecycle states.

use serde::{Deserialize, Serialize};

/// State of a task as recorded in the result store.
///
/// ```text
/// PENDING --(dequeued)--> STARTED --(handler returns)--> SUCCESS
/// STARTED --(retryable error, retries < max)--> RETRY --(delay)--> STARTED
/// STARTED --(non-retryable error, or retries == max)--> FAILURE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Retry => "RETRY",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    /// Whether a stored record in `self` may be overwritten with `next`.
    ///
    /// Terminal states are final. STARTED and RETRY may alternate while
    /// attempts continue; nothing moves back to PENDING once work began.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match self {
            TaskState::Success | TaskState::Failure => false,
            TaskState::Pending => true,
            TaskState::Started | TaskState::Retry => next != TaskState::Pending,
        }
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
