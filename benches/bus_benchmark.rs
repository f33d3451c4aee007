use std::sync::Arc;

use amqp_bus::{BusConfig, FieldKind, MemoryBroker, MessageBus, ObjectSchema, ValidateStreamExt};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;
use tokio_stream::StreamExt;

async fn bus_with_queue(queue: &str, binding: &str) -> MessageBus {
    let (queue, binding) = (queue.to_string(), binding.to_string());
    MessageBus::connect_with(Arc::new(MemoryBroker::new().connect()), &BusConfig::default(), |topology| async move {
        topology.assert_queue("bench", &binding, &queue).await
    })
    .await
    .unwrap()
}

async fn publish_individual(bus: &MessageBus, count: usize) {
    for i in 0..count {
        bus.publish("bench", "item", &json!({ "id": i }), None).await.unwrap();
    }
}

async fn consume_and_ack(bus: &MessageBus, queue: &str, count: usize, prefetch: u16) {
    publish_individual(bus, count).await;
    let mut subscription = bus.consume(queue, Some(prefetch)).await.unwrap();
    for _ in 0..count {
        subscription.next().await.unwrap().ack().await.unwrap();
    }
    subscription.close().await.unwrap();
}

async fn consume_validated(bus: &MessageBus, queue: &str, count: usize) {
    publish_individual(bus, count).await;
    let schema = ObjectSchema::new().required("id", FieldKind::Integer);
    let subscription = bus.consume(queue, None).await.unwrap();
    let handle = subscription.handle();
    let mut validated = subscription.validate_or_dead_letter(schema);
    for _ in 0..count {
        validated.next().await.unwrap().ack().await.unwrap();
    }
    handle.close().await.unwrap();
}

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    // Nothing is bound to "item", so published messages are routed nowhere and do not pile up.
    let bus = rt.block_on(bus_with_queue("bench.publish", "audit"));
    let count = 1000;

    let mut group = c.benchmark_group("Publish");
    group.bench_function(BenchmarkId::new("Individual", count), |b| {
        b.to_async(&rt).iter(|| async {
            publish_individual(&bus, count).await;
        })
    });
    group.finish();
}

fn bench_consume(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let count = 1000;

    let mut group = c.benchmark_group("Consume");
    for prefetch in [1u16, 50, 200] {
        group.bench_function(BenchmarkId::new("Ack", prefetch), |b| {
            b.to_async(&rt).iter(|| async {
                let bus = bus_with_queue("bench.consume", "#").await;
                consume_and_ack(&bus, "bench.consume", count, prefetch).await;
            })
        });
    }
    group.bench_function(BenchmarkId::new("Validated", count), |b| {
        b.to_async(&rt).iter(|| async {
            let bus = bus_with_queue("bench.validated", "#").await;
            consume_validated(&bus, "bench.validated", count).await;
        })
    });
    group.finish();
}

criterion_group!(benches, bench_publish, bench_consume);
criterion_main!(benches);
