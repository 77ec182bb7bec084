//! Typed task-result backend over a raw [`ResultStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use conveyor_broker::ResultStore;
use conveyor_core::{TaskError, TaskId, TaskResult};

const KEY_PREFIX: &str = "conveyor-task-meta-";

/// Reads and writes [`TaskResult`] records, one key per task id.
///
/// Writes are forward-only: a record whose state cannot follow the stored one
/// is dropped. The check is read-then-write and not atomic; two workers racing
/// on the same id can still interleave, which at-least-once delivery already
/// requires handlers to tolerate.
#[derive(Clone)]
pub struct TaskResultBackend {
    store: Arc<dyn ResultStore>,
    ttl: Duration,
}

impl std::fmt::Debug for TaskResultBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResultBackend")
            .field("store", &self.store.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl TaskResultBackend {
    pub fn new(store: Arc<dyn ResultStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn key(task_id: TaskId) -> String {
        format!("{KEY_PREFIX}{task_id}")
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current record, or `None` when absent or expired.
    ///
    /// A record that no longer decodes is reported as absent.
    #[instrument(skip_all, fields(task_id = %task_id), err)]
    pub async fn get(&self, task_id: TaskId) -> Result<Option<TaskResult>, TaskError> {
        let Some(raw) = self.store.get(&Self::key(task_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<TaskResult>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "undecodable task record");
                Ok(None)
            }
        }
    }

    /// Write `record` unless it would move the stored state backwards.
    ///
    /// Returns whether the record was written.
    #[instrument(skip_all, fields(task_id = %record.task_id, state = %record.state), err)]
    pub async fn put(&self, record: &TaskResult) -> Result<bool, TaskError> {
        if let Some(current) = self.get(record.task_id).await? {
            if !current.state.can_transition_to(record.state) {
                debug!(
                    task_id = %record.task_id,
                    from = %current.state,
                    to = %record.state,
                    "ignoring backwards state write"
                );
                return Ok(false);
            }
        }

        let value = serde_json::to_string(record)?;
        self.store
            .set(&Self::key(record.task_id), value, Some(self.ttl))
            .await?;
        Ok(true)
    }

    pub async fn forget(&self, task_id: TaskId) -> Result<bool, TaskError> {
        Ok(self.store.delete(&Self::key(task_id)).await?)
    }
}
