//! Task registry: name → handler + retry policy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use conveyor_core::{HandlerError, RetryPolicy, TaskId, TaskInvocation};

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// Type-erased async handler.
pub type TaskHandlerFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Everything a handler sees about the invocation it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub task: String,
    pub retries: u32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskContext {
    pub fn from_invocation(invocation: &TaskInvocation) -> Self {
        Self {
            task_id: invocation.id,
            task: invocation.task.clone(),
            retries: invocation.retries,
            args: invocation.args.clone(),
            kwargs: invocation.kwargs.clone(),
        }
    }

    /// Decode one keyword argument.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, HandlerError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| HandlerError::invalid_arguments(format!("missing argument `{name}`")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::invalid_arguments(format!("argument `{name}`: {e}")))
    }

    /// Decode one positional argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self.args.get(index).ok_or_else(|| {
            HandlerError::invalid_arguments(format!("missing positional argument {index}"))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| HandlerError::invalid_arguments(format!("argument {index}: {e}")))
    }

    /// Decode all keyword arguments into one struct.
    pub fn kwargs_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.kwargs.clone()))
            .map_err(|e| HandlerError::invalid_arguments(e.to_string()))
    }
}

#[derive(Clone)]
pub struct RegisteredTask {
    pub name: String,
    pub policy: RetryPolicy,
    pub handler: TaskHandlerFn,
}

impl std::fmt::Debug for RegisteredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTask")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Explicit registration table, built once at startup and then shared
/// read-only behind an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. A later registration under the same
    /// name replaces the earlier one.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, policy: RetryPolicy, handler: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let name = name.into();
        let handler: TaskHandlerFn = Arc::new(move |ctx: TaskContext| -> TaskFuture { Box::pin(handler(ctx)) });
        if self.tasks.contains_key(&name) {
            tracing::warn!(task = %name, "task registered twice; keeping the latest handler");
        }
        self.tasks.insert(
            name.clone(),
            RegisteredTask {
                name,
                policy,
                handler,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTask> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tasks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
