//! Backend selection and wiring from [`Settings`].

use std::sync::Arc;

use tracing::info;

use conveyor_broker::{Broker, InMemoryBroker, InMemoryResultStore, ResultStore};

use crate::config::{BackendKind, Settings};

use super::backend::TaskResultBackend;
use super::client::TaskClient;
use super::eager::EagerBroker;
use super::executor::{TaskExecutor, Worker, WorkerConfig};
use super::registry::TaskRegistry;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("{0} requires redis support (build with the `redis` feature)")]
    RedisDisabled(&'static str),

    #[error(transparent)]
    Broker(#[from] conveyor_broker::BrokerError),

    #[error(transparent)]
    Store(#[from] conveyor_broker::StoreError),
}

/// The broker, result store and client for one process.
#[derive(Clone)]
pub struct TaskRuntime {
    pub registry: Arc<TaskRegistry>,
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ResultStore>,
    pub backend: TaskResultBackend,
    pub client: TaskClient,
    topic: String,
    concurrency: usize,
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime")
            .field("broker", &self.broker.name())
            .field("store", &self.store.name())
            .field("tasks", &self.registry.names())
            .field("topic", &self.topic)
            .finish()
    }
}

impl TaskRuntime {
    /// Connect the configured backends. Redis connections are established
    /// lazily, so an unreachable server surfaces on first use.
    pub fn build(settings: &Settings, registry: TaskRegistry) -> Result<Self, RuntimeError> {
        let registry = Arc::new(registry);

        let store: Arc<dyn ResultStore> = match &settings.result_backend {
            BackendKind::Memory => Arc::new(InMemoryResultStore::new()),
            BackendKind::Redis(url) => redis_store(url)?,
        };
        let backend = TaskResultBackend::new(store.clone(), settings.result_expires);

        let broker: Arc<dyn Broker> = if settings.task_always_eager {
            Arc::new(EagerBroker::new(TaskExecutor::new(
                registry.clone(),
                backend.clone(),
                "eager",
            )))
        } else {
            match &settings.broker {
                BackendKind::Memory => {
                    Arc::new(InMemoryBroker::with_visibility_timeout(settings.visibility_timeout))
                }
                BackendKind::Redis(url) => redis_broker(url, settings)?,
            }
        };

        let client = TaskClient::new(
            registry.clone(),
            broker.clone(),
            backend.clone(),
            settings.task_queue.clone(),
        )
        .with_unknown_policy(settings.unknown_task_state);

        info!(
            broker = broker.name(),
            result_backend = store.name(),
            queue = %settings.task_queue,
            tasks = registry.len(),
            "task runtime ready"
        );

        Ok(Self {
            registry,
            broker,
            store,
            backend,
            client,
            topic: settings.task_queue.clone(),
            concurrency: settings.worker_concurrency,
        })
    }

    /// Default worker configuration for this runtime's queue.
    pub fn worker_config(&self, name: impl Into<String>) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(name)
            .with_topic(self.topic.clone())
            .with_concurrency(self.concurrency)
    }

    pub fn worker(&self, config: WorkerConfig) -> Worker {
        Worker::new(
            self.registry.clone(),
            self.broker.clone(),
            self.backend.clone(),
            config,
        )
    }

    /// Whether this runtime's broker delivers to workers at all.
    pub fn needs_workers(&self) -> bool {
        self.broker.name() != "eager"
    }
}

#[cfg(feature = "redis")]
fn redis_store(url: &str) -> Result<Arc<dyn ResultStore>, RuntimeError> {
    Ok(Arc::new(crate::redis::RedisResultStore::new(url)?))
}

#[cfg(not(feature = "redis"))]
fn redis_store(_url: &str) -> Result<Arc<dyn ResultStore>, RuntimeError> {
    Err(RuntimeError::RedisDisabled("RESULT_BACKEND"))
}

#[cfg(feature = "redis")]
fn redis_broker(url: &str, settings: &Settings) -> Result<Arc<dyn Broker>, RuntimeError> {
    let broker = crate::redis::RedisStreamsBroker::new(url)?
        .with_group(format!("{}-workers", settings.task_queue))
        .with_visibility_timeout(settings.visibility_timeout);
    Ok(Arc::new(broker))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(_url: &str, _settings: &Settings) -> Result<Arc<dyn Broker>, RuntimeError> {
    Err(RuntimeError::RedisDisabled("BROKER_URL"))
}
