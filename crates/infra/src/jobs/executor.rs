//! Task execution: one attempt at a time, and the worker loop around it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conveyor_broker::{Broker, BrokerError, Delivery};
use conveyor_core::{HandlerError, TaskError, TaskInvocation, TaskResult};

use super::backend::TaskResultBackend;
use super::registry::{TaskContext, TaskRegistry};

/// Errors [`InfraBackoff`] can classify.
pub trait InfraFault {
    /// Whether the same call may succeed after a pause.
    fn is_transient(&self) -> bool;
}

impl InfraFault for TaskError {
    fn is_transient(&self) -> bool {
        self.is_infrastructure()
    }
}

impl InfraFault for BrokerError {
    fn is_transient(&self) -> bool {
        BrokerError::is_transient(self)
    }
}

/// Backoff for infrastructure operations (state writes, acks). Separate from
/// task retry policies.
#[derive(Debug, Clone, Copy)]
pub struct InfraBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for InfraBackoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl InfraBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a permanent error, or
    /// `max_attempts` is exhausted.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: InfraFault + std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts.max(1) && e.is_transient() => {
                    let delay = self.delay(attempt);
                    warn!(op = what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "infrastructure error; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    Succeeded,
    /// Retryable failure; `next` must be delivered again after `delay`.
    Retry {
        next: TaskInvocation,
        delay: Duration,
    },
    Failed,
    /// No handler registered under the invocation's task name.
    UnknownTask,
    /// The stored record is already terminal (duplicate delivery).
    Duplicate,
}

/// Runs one invocation against the registry and records every state change.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
    backend: TaskResultBackend,
    worker_name: String,
    infra_backoff: InfraBackoff,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>, backend: TaskResultBackend, worker_name: impl Into<String>) -> Self {
        Self {
            registry,
            backend,
            worker_name: worker_name.into(),
            infra_backoff: InfraBackoff::default(),
        }
    }

    pub fn with_infra_backoff(mut self, backoff: InfraBackoff) -> Self {
        self.infra_backoff = backoff;
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &TaskResultBackend {
        &self.backend
    }

    async fn record(&self, record: TaskResult) -> Result<(), TaskError> {
        self.infra_backoff
            .run("record_state", || self.backend.put(&record))
            .await
            .map(|_| ())
    }

    /// Execute one attempt of `invocation`.
    ///
    /// Errors are infrastructure faults that outlived the backoff; the caller
    /// must not acknowledge the delivery in that case.
    pub async fn attempt(&self, invocation: &TaskInvocation) -> Result<Attempt, TaskError> {
        let Some(task) = self.registry.get(&invocation.task) else {
            let err = TaskError::unknown_task(&invocation.task);
            warn!(task_id = %invocation.id, task = %invocation.task, "no handler registered");
            self.record(TaskResult::failure(invocation, err.to_string())).await?;
            return Ok(Attempt::UnknownTask);
        };

        let current = self
            .infra_backoff
            .run("read_state", || self.backend.get(invocation.id))
            .await?;
        if current.is_some_and(|r| r.state.is_terminal()) {
            debug!(task_id = %invocation.id, task = %invocation.task, "already finished; skipping duplicate");
            return Ok(Attempt::Duplicate);
        }

        self.record(TaskResult::started(invocation, &self.worker_name)).await?;
        debug!(task_id = %invocation.id, task = %invocation.task, retries = invocation.retries, "task started");

        let started = Instant::now();
        let outcome = run_handler(task.handler.clone(), TaskContext::from_invocation(invocation)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(value) => {
                self.record(TaskResult::success(invocation, value)).await?;
                info!(task_id = %invocation.id, task = %invocation.task, elapsed_ms, "task succeeded");
                Ok(Attempt::Succeeded)
            }
            Err(err) if task.policy.should_retry(invocation.retries, &err) => {
                let delay = task.policy.next_delay(invocation.retries);
                self.record(TaskResult::retry(invocation, err.to_string(), delay.as_millis() as u64))
                    .await?;
                warn!(
                    task_id = %invocation.id,
                    task = %invocation.task,
                    retries = invocation.retries + 1,
                    max_retries = task.policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed; retry scheduled"
                );
                Ok(Attempt::Retry {
                    next: invocation.next_retry(),
                    delay,
                })
            }
            Err(err) => {
                self.record(TaskResult::failure(invocation, err.to_string())).await?;
                error!(
                    task_id = %invocation.id,
                    task = %invocation.task,
                    retries = invocation.retries,
                    error = %err,
                    elapsed_ms,
                    "task failed"
                );
                Ok(Attempt::Failed)
            }
        }
    }
}

/// Run the handler on its own tokio task so a panic is contained and
/// reported as [`HandlerError::Panicked`].
async fn run_handler(
    handler: super::registry::TaskHandlerFn,
    ctx: TaskContext,
) -> Result<serde_json::Value, HandlerError> {
    match tokio::spawn(async move { handler(ctx).await }).await {
        Ok(result) => result,
        Err(join) if join.is_panic() => {
            let panic = join.into_panic();
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::Panicked(msg))
        }
        Err(join) => Err(HandlerError::Panicked(join.to_string())),
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging and the STARTED record
    pub name: String,
    /// Broker topic to consume
    pub topic: String,
    /// Number of concurrent consumer loops
    pub concurrency: usize,
    /// How long one `consume` call may wait for a message
    pub poll_wait: Duration,
    pub infra_backoff: InfraBackoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            topic: crate::config::DEFAULT_TASK_QUEUE.to_string(),
            concurrency: 4,
            poll_wait: Duration::from_millis(500),
            infra_backoff: InfraBackoff::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }

    pub fn with_infra_backoff(mut self, backoff: InfraBackoff) -> Self {
        self.infra_backoff = backoff;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// What the worker did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Succeeded,
    Retried,
    Failed,
    DeadLettered,
    Skipped,
}

/// Pulls invocations from a broker and executes them.
pub struct Worker {
    broker: Arc<dyn Broker>,
    executor: TaskExecutor,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("broker", &self.broker.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        backend: TaskResultBackend,
        config: WorkerConfig,
    ) -> Self {
        let executor = TaskExecutor::new(registry, backend, config.name.clone())
            .with_infra_backoff(config.infra_backoff);
        Self {
            broker,
            executor,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn bump(&self, outcome: Processed) {
        if let Ok(mut s) = self.stats.lock() {
            s.processed += 1;
            match outcome {
                Processed::Succeeded => s.succeeded += 1,
                Processed::Retried => s.retried += 1,
                Processed::Failed => s.failed += 1,
                Processed::DeadLettered => {
                    s.failed += 1;
                    s.dead_lettered += 1;
                }
                Processed::Skipped => {}
            }
        }
    }

    async fn broker_op<F, Fut>(&self, what: &str, op: F) -> Result<(), TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        match self.config.infra_backoff.run(what, op).await {
            Ok(()) => Ok(()),
            // Lease already gone: the broker will (or did) redeliver.
            Err(BrokerError::UnknownDelivery(id)) => {
                warn!(op = what, delivery = %id, "delivery no longer in flight");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handle one delivery end to end: decode, execute, record, then
    /// acknowledge, requeue or dead-letter.
    ///
    /// On `Err` the delivery was left unacknowledged.
    pub async fn process(&self, delivery: Delivery) -> Result<Processed, TaskError> {
        let handle = &delivery.handle;

        let invocation = match TaskInvocation::from_bytes(&delivery.payload) {
            Ok(inv) => inv,
            Err(e) => {
                warn!(worker = %self.config.name, delivery = %handle.id, error = %e, "undecodable payload");
                let reason = e.to_string();
                self.broker_op("dead_letter", || self.broker.dead_letter(handle, &reason))
                    .await?;
                self.bump(Processed::DeadLettered);
                return Ok(Processed::DeadLettered);
            }
        };

        if delivery.redelivered {
            info!(worker = %self.config.name, task_id = %invocation.id, task = %invocation.task, "redelivered task");
        }

        let outcome = match self.executor.attempt(&invocation).await {
            Ok(a) => a,
            Err(e) => {
                error!(
                    worker = %self.config.name,
                    task_id = %invocation.id,
                    error = %e,
                    "could not record task state; leaving delivery unacknowledged"
                );
                return Err(e);
            }
        };

        let processed = match outcome {
            Attempt::Succeeded => {
                self.broker_op("ack", || self.broker.ack(handle)).await?;
                Processed::Succeeded
            }
            Attempt::Failed => {
                self.broker_op("ack", || self.broker.ack(handle)).await?;
                Processed::Failed
            }
            Attempt::Duplicate => {
                self.broker_op("ack", || self.broker.ack(handle)).await?;
                Processed::Skipped
            }
            Attempt::UnknownTask => {
                let reason = TaskError::unknown_task(&invocation.task).to_string();
                self.broker_op("dead_letter", || self.broker.dead_letter(handle, &reason))
                    .await?;
                Processed::DeadLettered
            }
            Attempt::Retry { next, delay } => {
                let payload = next.to_bytes()?;
                self.broker_op("requeue", || self.broker.requeue(handle, payload.clone(), delay))
                    .await?;
                Processed::Retried
            }
        };

        self.bump(processed);
        Ok(processed)
    }

    /// Start `concurrency` consumer loops on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let worker = Arc::new(self);

        info!(
            worker = %worker.config.name,
            topic = %worker.config.topic,
            broker = worker.broker.name(),
            concurrency = worker.config.concurrency,
            "worker started"
        );

        let joins = (0..worker.config.concurrency.max(1))
            .map(|slot| {
                let worker = worker.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move { worker.run_loop(slot, shutdown).await })
            })
            .collect();

        WorkerHandle {
            name: worker.config.name.clone(),
            shutdown: shutdown_tx,
            joins,
            stats,
        }
    }

    async fn run_loop(&self, slot: usize, shutdown: watch::Receiver<bool>) {
        let mut consecutive_errors = 0u32;
        while !*shutdown.borrow() {
            match self.broker.consume(&self.config.topic, self.config.poll_wait).await {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    // Errors are already logged; the delivery stays in flight.
                    let _ = self.process(delivery).await;
                }
                Ok(None) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    let delay = self.config.infra_backoff.delay(consecutive_errors);
                    error!(worker = %self.config.name, slot, error = %e, delay_ms = delay.as_millis() as u64, "consume failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        debug!(worker = %self.config.name, slot, "consumer loop stopped");
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop consuming, wait for in-flight attempts to finish and return the
    /// final statistics.
    pub async fn shutdown(self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                error!(worker = %self.name, error = %e, "consumer loop aborted");
            }
        }
        let stats = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        info!(
            worker = %self.name,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "worker stopped"
        );
        stats
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}
