//! Process-wide services, built once at startup and passed to handlers via
//! `Extension`.

use std::sync::{Arc, Mutex};

use tracing::info;

use conveyor_broker::{Broker, ResultStore};
use conveyor_infra::Settings;
use conveyor_infra::jobs::{RuntimeError, TaskClient, TaskRuntime, WorkerHandle};

use super::tasks;

pub struct AppServices {
    settings: Settings,
    runtime: TaskRuntime,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("app_name", &self.settings.app_name)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    /// Wire the task runtime and, when the broker needs consumers in this
    /// process, start the embedded workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(settings: Settings) -> Result<Self, RuntimeError> {
        let runtime = TaskRuntime::build(&settings, tasks::registry())?;

        let mut workers = Vec::new();
        if settings.embedded_workers && runtime.needs_workers() {
            let name = format!("embedded-{}", std::process::id());
            workers.push(runtime.worker(runtime.worker_config(name)).spawn());
        }

        info!(
            app = %settings.app_name,
            environment = %settings.environment,
            embedded_workers = workers.len(),
            "services initialized"
        );

        Ok(Self {
            settings,
            runtime,
            workers: Mutex::new(workers),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn client(&self) -> &TaskClient {
        &self.runtime.client
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.runtime.broker
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.runtime.store
    }

    /// Stop embedded workers, letting in-flight attempts finish.
    /// Idempotent.
    pub async fn close(&self) {
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            let stats = worker.shutdown().await;
            info!(processed = stats.processed, "embedded worker closed");
        }
    }
}
