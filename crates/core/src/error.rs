//! Task error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error surfaced by the submission, dispatch and status paths.
///
/// Infrastructure faults (`StoreUnavailable`, `BrokerUnavailable`) are kept
/// apart from task-level failures: the former are retried by whoever hit
/// them, the latter are governed by the task's [`RetryPolicy`].
///
/// [`RetryPolicy`]: crate::retry::RetryPolicy
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The invocation names a task that is not registered.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Arguments or results could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The handler itself failed.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// The result store could not be reached.
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),

    /// The broker could not be reached.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A client-supplied task identifier failed the format check.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl TaskError {
    pub fn unknown_task(name: impl Into<String>) -> Self {
        Self::UnknownTask(name.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn broker_unavailable(msg: impl Into<String>) -> Self {
        Self::BrokerUnavailable(msg.into())
    }

    pub fn invalid_identifier(msg: impl Into<String>) -> Self {
        Self::InvalidIdentifier(msg.into())
    }

    /// True for faults of the broker or store rather than of the task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::BrokerUnavailable(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Failure returned by a task handler.
///
/// Whether a given variant is retried is decided by the task's retry policy,
/// not by the variant alone.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum HandlerError {
    /// A failure expected to clear up on its own (timeouts, 5xx upstream).
    #[error("transient failure: {0}")]
    Transient(String),

    /// A failure that will repeat on every attempt.
    #[error("{0}")]
    Permanent(String),

    /// The invocation arguments did not match what the handler expects.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_errors_are_flagged() {
        assert!(TaskError::store_unavailable("down").is_infrastructure());
        assert!(TaskError::broker_unavailable("down").is_infrastructure());
        assert!(!TaskError::unknown_task("x").is_infrastructure());
        assert!(!TaskError::invalid_identifier("").is_infrastructure());
    }

    #[test]
    fn handler_error_converts_into_task_error() {
        let err: TaskError = HandlerError::permanent("boom").into();
        assert_eq!(err.to_string(), "handler failed: boom");
    }

    #[test]
    fn handler_error_serializes_with_kind_tag() {
        let json = serde_json::to_value(HandlerError::transient("smtp timeout")).unwrap();
        assert_eq!(json["kind"], "transient");
        assert_eq!(json["message"], "smtp timeout");
    }
}
