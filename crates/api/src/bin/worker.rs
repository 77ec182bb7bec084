//! Standalone worker process consuming the configured task queue.

use anyhow::{Context, bail};

use conveyor_api::app::tasks;
use conveyor_infra::Settings;
use conveyor_infra::jobs::TaskRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    conveyor_observability::init(&settings.log_config());

    let runtime = TaskRuntime::build(&settings, tasks::registry())
        .context("failed to initialize task runtime")?;
    if !runtime.needs_workers() {
        bail!("TASK_ALWAYS_EAGER is set; tasks run inline and there is nothing to consume");
    }
    if settings.broker.is_memory() {
        tracing::warn!("memory broker is private to this process; no submissions will arrive");
    }

    let name = format!("worker-{}", std::process::id());
    let handle = runtime.worker(runtime.worker_config(name)).spawn();
    tracing::info!(queue = %settings.task_queue, tasks = ?runtime.registry.names(), "worker.startup");

    conveyor_api::shutdown::signal().await;

    let stats = handle.shutdown().await;
    tracing::info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        failed = stats.failed,
        retried = stats.retried,
        "worker.shutdown"
    );
    Ok(())
}
