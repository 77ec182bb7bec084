//! Submission and status API.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use conveyor_broker::Broker;
use conveyor_core::{
    TaskArgs, TaskError, TaskId, TaskInvocation, TaskResult, TaskStatus, UnknownTaskPolicy,
};

use super::backend::TaskResultBackend;
use super::registry::TaskRegistry;

/// Client side of the queue: publishes invocations and answers status
/// queries. Stateless apart from shared handles; clone freely.
#[derive(Clone)]
pub struct TaskClient {
    registry: Arc<TaskRegistry>,
    broker: Arc<dyn Broker>,
    backend: TaskResultBackend,
    topic: String,
    unknown_policy: UnknownTaskPolicy,
}

impl std::fmt::Debug for TaskClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClient")
            .field("broker", &self.broker.name())
            .field("backend", &self.backend)
            .field("topic", &self.topic)
            .field("unknown_policy", &self.unknown_policy)
            .finish()
    }
}

impl TaskClient {
    pub fn new(
        registry: Arc<TaskRegistry>,
        broker: Arc<dyn Broker>,
        backend: TaskResultBackend,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broker,
            backend,
            topic: topic.into(),
            unknown_policy: UnknownTaskPolicy::default(),
        }
    }

    pub fn with_unknown_policy(mut self, policy: UnknownTaskPolicy) -> Self {
        self.unknown_policy = policy;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue `task_name` and return its id without waiting for execution.
    ///
    /// The PENDING record is written before the single publish so a status
    /// query can tell a queued task from an unknown one.
    #[instrument(skip(self, args), fields(task = %task_name), err)]
    pub async fn submit(&self, task_name: &str, args: TaskArgs) -> Result<TaskId, TaskError> {
        if !self.registry.contains(task_name) {
            return Err(TaskError::unknown_task(task_name));
        }

        let invocation = TaskInvocation::new(task_name, args);
        let payload = invocation.to_bytes()?;

        self.backend.put(&TaskResult::pending(&invocation)).await?;
        self.broker.publish(&self.topic, payload).await?;

        info!(task_id = %invocation.id, task = %task_name, "task queued");
        Ok(invocation.id)
    }

    /// [`submit`](Self::submit) with keyword arguments taken from a struct or
    /// map.
    pub async fn submit_kwargs<T>(&self, task_name: &str, kwargs: &T) -> Result<TaskId, TaskError>
    where
        T: Serialize + ?Sized,
    {
        let args = TaskArgs::from_kwargs(kwargs)?;
        self.submit(task_name, args).await
    }

    /// Client-facing status for `identifier`.
    ///
    /// Malformed identifiers are rejected before the store is queried.
    pub async fn status(&self, identifier: &str) -> Result<TaskStatus, TaskError> {
        let task_id = TaskId::parse(identifier)?;
        let status = match self.backend.get(task_id).await? {
            Some(record) => record.to_status(),
            None => TaskStatus::absent(task_id, self.unknown_policy),
        };
        debug!(task_id = %task_id, state = ?status.state, "status query");
        Ok(status)
    }

    /// Raw stored record, if any.
    pub async fn result(&self, task_id: TaskId) -> Result<Option<TaskResult>, TaskError> {
        self.backend.get(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use conveyor_broker::{
        AckHandle, BrokerError, Delivery, InMemoryBroker, InMemoryResultStore, ResultStore, StoreError,
    };
    use conveyor_core::{HandlerError, RetryPolicy, StatusState, TaskState};

    use super::*;

    const TOPIC: &str = "client-tasks";

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.register("known", RetryPolicy::no_retry(), |_| async {
            Ok::<_, HandlerError>(Value::Null)
        });
        Arc::new(registry)
    }

    fn client(broker: Arc<InMemoryBroker>, store: Arc<dyn ResultStore>) -> TaskClient {
        TaskClient::new(
            registry(),
            broker,
            TaskResultBackend::new(store, Duration::from_secs(60)),
            TOPIC,
        )
    }

    #[tokio::test]
    async fn submit_records_pending_and_publishes_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = client(broker.clone(), Arc::new(InMemoryResultStore::new()));

        let id = client
            .submit("known", TaskArgs::new().kwarg("x", 1))
            .await
            .unwrap();
        assert_eq!(broker.pending_count(TOPIC), 1);

        let status = client.status(&id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Pending);
        assert_eq!(status.result, None);

        let d = broker.consume(TOPIC, Duration::ZERO).await.unwrap().unwrap();
        let inv = TaskInvocation::from_bytes(&d.payload).unwrap();
        assert_eq!(inv.id, id);
        assert_eq!(inv.kwargs.get("x"), Some(&json!(1)));
        assert_eq!(inv.retries, 0);
    }

    #[tokio::test]
    async fn submissions_get_fresh_ids() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = client(broker, Arc::new(InMemoryResultStore::new()));
        let a = client.submit("known", TaskArgs::new()).await.unwrap();
        let b = client.submit("known", TaskArgs::new()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn unknown_task_is_rejected_before_publish() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = client(broker.clone(), Arc::new(InMemoryResultStore::new()));

        let err = client.submit("nope", TaskArgs::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask(_)));
        assert_eq!(broker.pending_count(TOPIC), 0);
    }

    #[tokio::test]
    async fn submit_kwargs_requires_an_object() {
        let broker = Arc::new(InMemoryBroker::new());
        let client = client(broker.clone(), Arc::new(InMemoryResultStore::new()));

        let err = client.submit_kwargs("known", &json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, TaskError::Serialization(_)));

        client.submit_kwargs("known", &json!({"a": 1})).await.unwrap();
        assert_eq!(broker.pending_count(TOPIC), 1);
    }

    #[tokio::test]
    async fn status_maps_stored_records() {
        let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
        let client = client(Arc::new(InMemoryBroker::new()), store.clone());
        let backend = TaskResultBackend::new(store, Duration::from_secs(60));

        let ok = TaskInvocation::new("known", TaskArgs::new());
        backend.put(&TaskResult::success(&ok, json!({"n": 1}))).await.unwrap();
        let status = client.status(&ok.id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!({"n": 1})));

        let bad = TaskInvocation::new("known", TaskArgs::new());
        backend.put(&TaskResult::failure(&bad, "exploded")).await.unwrap();
        let status = client.status(&bad.id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Failure);
        assert_eq!(status.error.as_deref(), Some("exploded"));

        let running = TaskInvocation::new("known", TaskArgs::new());
        backend.put(&TaskResult::started(&running, "w1")).await.unwrap();
        let status = client.status(&running.id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Started);
        assert_eq!(status.result.unwrap()["worker"], "w1");
        assert_eq!(
            backend.get(running.id).await.unwrap().unwrap().state,
            TaskState::Started
        );
    }

    #[tokio::test]
    async fn absent_records_follow_the_policy() {
        let client = client(Arc::new(InMemoryBroker::new()), Arc::new(InMemoryResultStore::new()));
        let id = TaskId::new().to_string();

        assert_eq!(client.status(&id).await.unwrap().state, StatusState::Unknown);

        let client = client.with_unknown_policy(UnknownTaskPolicy::Pending);
        assert_eq!(client.status(&id).await.unwrap().state, StatusState::Pending);
    }

    /// Store that fails every call and counts them.
    #[derive(Default)]
    struct DownStore {
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl ResultStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn set(&self, _: &str, _: String, _: Option<Duration>) -> Result<(), StoreError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, StoreError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(StoreError::Unavailable("connection refused".into()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn malformed_identifier_never_touches_the_store() {
        let store = Arc::new(DownStore::default());
        let client = client(Arc::new(InMemoryBroker::new()), store.clone());

        for bad in ["", "   ", "not-a-uuid", "1234"] {
            let err = client.status(bad).await.unwrap_err();
            assert!(matches!(err, TaskError::InvalidIdentifier(_)), "{bad:?}");
        }
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let err = client.status(&TaskId::new().to_string()).await.unwrap_err();
        assert!(matches!(err, TaskError::StoreUnavailable(_)));
    }

    /// Broker that refuses every publish.
    struct DownBroker;

    #[async_trait]
    impl Broker for DownBroker {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn publish(&self, _: &str, _: Vec<u8>) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn consume(&self, _: &str, _: Duration) -> Result<Option<Delivery>, BrokerError> {
            Ok(None)
        }
        async fn ack(&self, h: &AckHandle) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownDelivery(h.id.clone()))
        }
        async fn requeue(&self, h: &AckHandle, _: Vec<u8>, _: Duration) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownDelivery(h.id.clone()))
        }
        async fn dead_letter(&self, h: &AckHandle, _: &str) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownDelivery(h.id.clone()))
        }
        async fn ping(&self) -> Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn broker_outage_surfaces_as_broker_unavailable() {
        let client = TaskClient::new(
            registry(),
            Arc::new(DownBroker),
            TaskResultBackend::new(Arc::new(InMemoryResultStore::new()), Duration::from_secs(60)),
            TOPIC,
        );
        let err = client.submit("known", TaskArgs::new()).await.unwrap_err();
        assert!(matches!(err, TaskError::BrokerUnavailable(_)));
    }
}
