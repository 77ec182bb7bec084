use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use conveyor_broker::{Broker, InMemoryBroker, InMemoryResultStore};
use conveyor_core::{HandlerError, RetryPolicy, TaskArgs, TaskInvocation};
use conveyor_infra::jobs::{TaskContext, TaskRegistry, TaskResultBackend, Worker, WorkerConfig};

const TOPIC: &str = "bench";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn bench_broker_round_trip(c: &mut Criterion) {
    let rt = runtime();
    let broker = InMemoryBroker::new();
    let payload = TaskInvocation::new("bench", TaskArgs::new().kwarg("n", 1))
        .to_bytes()
        .expect("payload");

    c.bench_function("in_memory_broker/publish_consume_ack", |b| {
        b.iter(|| {
            rt.block_on(async {
                broker.publish(TOPIC, payload.clone()).await.unwrap();
                let d = broker.consume(TOPIC, Duration::ZERO).await.unwrap().unwrap();
                broker.ack(&d.handle).await.unwrap();
                black_box(d.payload.len())
            })
        })
    });
}

fn bench_worker_process(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("worker_process");

    for items in [1usize, 10, 100] {
        let mut registry = TaskRegistry::new();
        registry.register("count", RetryPolicy::no_retry(), |ctx: TaskContext| async move {
            let data: serde_json::Map<String, Value> = ctx.kwarg("data")?;
            Ok::<_, HandlerError>(json!({ "processed_items": data.len() }))
        });
        let broker = Arc::new(InMemoryBroker::new());
        let backend = TaskResultBackend::new(Arc::new(InMemoryResultStore::new()), Duration::from_secs(60));
        let worker = Worker::new(
            Arc::new(registry),
            broker.clone(),
            backend,
            WorkerConfig::default().with_topic(TOPIC),
        );
        let data: serde_json::Map<String, Value> =
            (0..items).map(|i| (format!("k{i}"), json!(i))).collect();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(items), &items, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let inv = TaskInvocation::new("count", TaskArgs::new().kwarg("data", data.clone()));
                    broker.publish(TOPIC, inv.to_bytes().unwrap()).await.unwrap();
                    let d = broker.consume(TOPIC, Duration::ZERO).await.unwrap().unwrap();
                    black_box(worker.process(d).await.unwrap())
                })
            })
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(600));
    c.bench_function("retry_policy/delay_for_retry", |b| {
        b.iter(|| {
            for n in 0..10 {
                black_box(policy.delay_for_retry(black_box(n)));
            }
        })
    });
    c.bench_function("retry_policy/next_delay_jittered", |b| {
        b.iter(|| black_box(policy.next_delay(black_box(3))))
    });
}

criterion_group!(benches, bench_broker_round_trip, bench_worker_process, bench_backoff);
criterion_main!(benches);
