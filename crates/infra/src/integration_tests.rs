//! Integration tests for the full task pipeline.
//!
//! Tests: TaskClient → Broker → Worker → ResultStore → TaskClient::status
//!
//! Verifies:
//! - Submitted tasks reach a terminal state through a real worker loop
//! - Retries are bounded and recorded
//! - Unacknowledged deliveries come back after the visibility timeout
//! - Eager mode produces the same observable outcome as a worker

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};

    use conveyor_broker::{Broker, InMemoryBroker, InMemoryResultStore};
    use conveyor_core::{HandlerError, RetryPolicy, StatusState, TaskArgs, TaskId, TaskInvocation, TaskStatus};

    use crate::jobs::{
        EagerBroker, TaskClient, TaskContext, TaskExecutor, TaskRegistry, TaskResultBackend, Worker,
        WorkerConfig,
    };

    const TOPIC: &str = "it-tasks";

    fn registry(flaky_calls: Arc<AtomicU32>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("count", RetryPolicy::no_retry(), |ctx: TaskContext| async move {
                let data: serde_json::Map<String, Value> = ctx.kwarg("data")?;
                Ok::<_, HandlerError>(json!({ "processed_items": data.len() }))
            })
            .register(
                "flaky",
                RetryPolicy::fixed(2, Duration::from_millis(5)),
                move |_| {
                    let calls = flaky_calls.clone();
                    async move {
                        // Fails twice, succeeds on the third attempt.
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err::<Value, _>(HandlerError::transient("warming up"))
                        } else {
                            Ok(json!("ready"))
                        }
                    }
                },
            )
            .register(
                "broken",
                RetryPolicy::fixed(2, Duration::from_millis(5)),
                |_| async { Err::<Value, _>(HandlerError::transient("always down")) },
            );
        registry
    }

    struct Pipeline {
        broker: Arc<InMemoryBroker>,
        client: TaskClient,
        registry: Arc<TaskRegistry>,
        backend: TaskResultBackend,
    }

    fn pipeline(visibility: Duration) -> Pipeline {
        let registry = Arc::new(registry(Arc::new(AtomicU32::new(0))));
        let broker = Arc::new(InMemoryBroker::with_visibility_timeout(visibility));
        let backend = TaskResultBackend::new(Arc::new(InMemoryResultStore::new()), Duration::from_secs(60));
        let client = TaskClient::new(registry.clone(), broker.clone(), backend.clone(), TOPIC);
        Pipeline {
            broker,
            client,
            registry,
            backend,
        }
    }

    fn worker(p: &Pipeline, name: &str) -> Worker {
        Worker::new(
            p.registry.clone(),
            p.broker.clone(),
            p.backend.clone(),
            WorkerConfig::default()
                .with_name(name)
                .with_topic(TOPIC)
                .with_concurrency(2)
                .with_poll_wait(Duration::from_millis(10)),
        )
    }

    /// Poll until the task is terminal (or give up after ~3s).
    async fn wait_terminal(client: &TaskClient, id: TaskId) -> TaskStatus {
        let id = id.to_string();
        for _ in 0..300 {
            let status = client.status(&id).await.unwrap();
            if matches!(status.state, StatusState::Success | StatusState::Failure) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        client.status(&id).await.unwrap()
    }

    #[tokio::test]
    async fn submitted_task_completes_through_worker() {
        let p = pipeline(Duration::from_secs(60));
        let handle = worker(&p, "w1").spawn();

        let id = p
            .client
            .submit_kwargs("count", &json!({"data": {"a": 1, "b": 2, "c": 3}}))
            .await
            .unwrap();
        let status = wait_terminal(&p.client, id).await;
        handle.shutdown().await;

        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!({"processed_items": 3})));
        assert_eq!(p.broker.pending_count(TOPIC), 0);
        assert_eq!(p.broker.in_flight_count(TOPIC), 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let p = pipeline(Duration::from_secs(60));
        let handle = worker(&p, "w1").spawn();

        let id = p.client.submit("flaky", TaskArgs::new()).await.unwrap();
        let status = wait_terminal(&p.client, id).await;
        let stats = handle.shutdown().await;

        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!("ready")));
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(p.client.result(id).await.unwrap().unwrap().retries, 2);
    }

    #[tokio::test]
    async fn retry_bound_ends_in_failure() {
        let p = pipeline(Duration::from_secs(60));
        let handle = worker(&p, "w1").spawn();

        let id = p.client.submit("broken", TaskArgs::new()).await.unwrap();
        let status = wait_terminal(&p.client, id).await;
        let stats = handle.shutdown().await;

        assert_eq!(status.state, StatusState::Failure);
        assert!(status.error.unwrap().contains("always down"));
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_to_another_worker() {
        let p = pipeline(Duration::from_millis(50));
        let id = p
            .client
            .submit_kwargs("count", &json!({"data": {"x": 1}}))
            .await
            .unwrap();

        // A worker takes the message and dies before acknowledging it.
        let lost = p.broker.consume(TOPIC, Duration::ZERO).await.unwrap().unwrap();
        drop(lost);

        let handle = worker(&p, "w2").spawn();
        let status = wait_terminal(&p.client, id).await;
        handle.shutdown().await;

        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!({"processed_items": 1})));
    }

    #[tokio::test]
    async fn handlers_are_idempotent_under_duplicate_delivery() {
        let p = pipeline(Duration::from_secs(60));
        let inv = TaskInvocation::new("count", TaskArgs::new().kwarg("data", json!({"k": true})));
        let payload = inv.to_bytes().unwrap();

        let w = worker(&p, "w1");
        for _ in 0..2 {
            p.broker.publish(TOPIC, payload.clone()).await.unwrap();
            let d = p.broker.consume(TOPIC, Duration::ZERO).await.unwrap().unwrap();
            w.process(d).await.unwrap();
        }

        let status = p.client.status(&inv.id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!({"processed_items": 1})));
        assert_eq!(w.stats().succeeded, 1);
        assert_eq!(p.broker.in_flight_count(TOPIC), 0);
    }

    #[tokio::test]
    async fn eager_mode_matches_worker_outcome() {
        let registry = Arc::new(registry(Arc::new(AtomicU32::new(0))));
        let backend = TaskResultBackend::new(Arc::new(InMemoryResultStore::new()), Duration::from_secs(60));
        let broker: Arc<dyn Broker> = Arc::new(EagerBroker::new(TaskExecutor::new(
            registry.clone(),
            backend.clone(),
            "eager",
        )));
        let client = TaskClient::new(registry, broker, backend, TOPIC);

        let id = client
            .submit_kwargs("count", &json!({"data": {"a": 1, "b": 2, "c": 3}}))
            .await
            .unwrap();
        let status = client.status(&id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Success);
        assert_eq!(status.result, Some(json!({"processed_items": 3})));

        let id = client.submit("flaky", TaskArgs::new()).await.unwrap();
        let status = client.status(&id.to_string()).await.unwrap();
        assert_eq!(status.state, StatusState::Success);
    }
}
