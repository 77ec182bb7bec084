//! Task invocations: what travels over the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;
use crate::id::TaskId;

/// Positional and keyword arguments of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Build keyword arguments from any serializable struct or map.
    ///
    /// The value must serialize to a JSON object.
    pub fn from_kwargs<T: Serialize + ?Sized>(kwargs: &T) -> Result<Self, TaskError> {
        match serde_json::to_value(kwargs)? {
            Value::Object(map) => Ok(Self {
                args: Vec::new(),
                kwargs: map,
            }),
            other => Err(TaskError::serialization(format!(
                "keyword arguments must serialize to an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One request to run a named handler with the given arguments.
///
/// Delivered at least once; the same invocation may be executed more than
/// once, so handlers must be idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub id: TaskId,
    pub task: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub submitted_at: DateTime<Utc>,
    /// RETRY transitions already taken before this delivery.
    #[serde(default)]
    pub retries: u32,
}

impl TaskInvocation {
    pub fn new(task: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            id: TaskId::new(),
            task: task.into(),
            args: args.args,
            kwargs: args.kwargs,
            submitted_at: Utc::now(),
            retries: 0,
        }
    }

    /// The invocation to redeliver after a retryable failure.
    pub fn next_retry(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TaskError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Email<'a> {
        to: &'a str,
        subject: &'a str,
    }

    #[test]
    fn kwargs_from_struct() {
        let args = TaskArgs::from_kwargs(&Email {
            to: "test@example.com",
            subject: "Hi",
        })
        .unwrap();

        assert!(args.args.is_empty());
        assert_eq!(args.kwargs["to"], json!("test@example.com"));
        assert_eq!(args.kwargs["subject"], json!("Hi"));
    }

    #[test]
    fn kwargs_must_be_an_object() {
        let err = TaskArgs::from_kwargs(&vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
    }

    #[test]
    fn next_retry_keeps_identity_and_bumps_counter() {
        let inv = TaskInvocation::new("example.process_data", TaskArgs::new().arg(1));
        let retry = inv.next_retry().next_retry();

        assert_eq!(retry.id, inv.id);
        assert_eq!(retry.task, inv.task);
        assert_eq!(retry.args, inv.args);
        assert_eq!(retry.retries, 2);
    }

    #[test]
    fn missing_optional_fields_default() {
        let id = TaskId::new();
        let raw = json!({
            "id": id.to_string(),
            "task": "example.send_email",
            "submitted_at": "2024-01-01T00:00:00Z",
        });

        let inv = TaskInvocation::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(inv.id, id);
        assert_eq!(inv.retries, 0);
        assert!(inv.kwargs.is_empty());
    }

    #[test]
    fn garbage_payload_is_a_serialization_error() {
        let err = TaskInvocation::from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));
    }
}
