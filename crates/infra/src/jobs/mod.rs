//! Task queue runtime: registration, submission, execution and status.
//!
//! ## Components
//!
//! - `TaskRegistry`: name → async handler + retry policy
//! - `TaskClient`: submission and status API
//! - `TaskResultBackend`: typed, forward-only task records over a `ResultStore`
//! - `Worker`: consumes a broker topic and executes invocations
//! - `EagerBroker`: inline execution for `TASK_ALWAYS_EAGER`
//! - `TaskRuntime`: wires the above from `Settings`

pub mod backend;
pub mod client;
pub mod eager;
pub mod executor;
pub mod registry;
pub mod runtime;

pub use backend::TaskResultBackend;
pub use client::TaskClient;
pub use eager::EagerBroker;
pub use executor::{
    Attempt, InfraBackoff, InfraFault, Processed, TaskExecutor, Worker, WorkerConfig, WorkerHandle, WorkerStats,
};
pub use registry::{RegisteredTask, TaskContext, TaskFuture, TaskHandlerFn, TaskRegistry};
pub use runtime::{RuntimeError, TaskRuntime};
