//! Infrastructure layer: configuration, the task runtime and Redis adapters.

pub mod config;
pub mod jobs;

/// Redis adapters (Streams broker, result store).
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(test)]
mod integration_tests;

pub use config::{BackendKind, ConfigError, LogFormat, Settings};
pub use jobs::{TaskClient, TaskRegistry, TaskRuntime, Worker, WorkerConfig, WorkerHandle};
