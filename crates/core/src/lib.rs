//! `conveyor-core` — task queue building blocks.
//!
//! This crate contains the **pure** task model shared by the submission side,
//! the workers and the status API: identifiers, invocations, states, results,
//! retry policies and the error taxonomy. No IO lives here.

pub mod error;
pub mod id;
pub mod result;
pub mod retry;
pub mod state;
pub mod task;

pub use error::{HandlerError, TaskError};
pub use id::TaskId;
pub use result::{StatusState, TaskResult, TaskStatus, UnknownTaskPolicy};
pub use retry::RetryPolicy;
pub use state::TaskState;
pub use task::{TaskArgs, TaskInvocation};
