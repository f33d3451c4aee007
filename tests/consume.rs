use std::sync::Arc;
use std::time::Duration;

use amqp_bus::{BusConfig, BusError, Envelope, MemoryBroker, MessageBus};
use serde_json::json;
use tokio::time::timeout;
use tokio_stream::StreamExt;

const WAIT: Duration = Duration::from_secs(2);

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn orders_bus(broker: &MemoryBroker) -> amqp_bus::Result<MessageBus> {
    MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |topology| async move {
        topology.assert_queue("orders", "created", "orders.created").await
    })
    .await
}

async fn next<S>(stream: &mut S) -> anyhow::Result<Envelope>
where
    S: tokio_stream::Stream<Item = Envelope> + Unpin,
{
    timeout(WAIT, stream.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("subscription ended"))
}

#[tokio::test]
async fn test_publish_consume_ack_cycle() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    let mut orders = bus.consume("orders.created", Some(1)).await?;

    assert!(bus.publish("orders", "created", &json!({"id": 1}), None).await?);
    let first = next(&mut orders).await?;
    assert_eq!(first.data, json!({"id": 1}));
    assert_eq!(first.source, json!({"id": 1}));
    assert_eq!(first.exchange, "orders");
    assert_eq!(first.routing_key, "created");
    assert_eq!(first.queue, "orders.created");
    assert!(!first.redelivered);

    // Prefetch 1: nothing more arrives until the first delivery is acked.
    bus.publish("orders", "created", &json!({"id": 1}), None).await?;
    assert!(timeout(Duration::from_millis(100), orders.next()).await.is_err());

    let first_tag = first.delivery_tag();
    first.ack().await?;

    let second = next(&mut orders).await?;
    assert_eq!(second.data, json!({"id": 1}));
    assert_ne!(second.delivery_tag(), first_tag);
    second.ack().await?;

    assert_eq!(broker.queue_depth("orders.created").await, Some(0));
    assert_eq!(broker.unacked("orders.created").await, 0);
    Ok(())
}

#[tokio::test]
async fn test_prefetch_bounds_unacked_deliveries() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    for id in 0..20 {
        bus.publish("orders", "created", &json!({ "id": id }), None).await?;
    }

    let mut orders = bus.consume("orders.created", Some(3)).await?;
    let channel_id = orders.channel_id();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(next(&mut orders).await?);
    }
    // The fourth delivery waits for credit.
    assert!(timeout(Duration::from_millis(100), orders.next()).await.is_err());
    assert_eq!(broker.unacked("orders.created").await, 3);

    for envelope in held {
        envelope.ack().await?;
    }
    let mut seen = 3;
    while seen < 20 {
        next(&mut orders).await?.ack().await?;
        seen += 1;
    }

    let stats = broker.channel_stats(channel_id).await.expect("subscription channel is open");
    assert_eq!(stats.prefetch, 3);
    assert!(stats.peak_unacked <= 3, "peak unacked {} exceeded prefetch", stats.peak_unacked);
    assert_eq!(stats.acked, 20);
    Ok(())
}

#[tokio::test]
async fn test_default_prefetch_comes_from_config() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;

    let default = bus.consume("orders.created", None).await?;
    let zero = bus.consume("orders.created", Some(0)).await?;

    assert_eq!(default.prefetch(), amqp_bus::bus::DEFAULT_PREFETCH);
    assert_eq!(zero.prefetch(), amqp_bus::bus::DEFAULT_PREFETCH);
    assert_ne!(default.channel_id(), zero.channel_id());
    assert_ne!(default.consumer_tag(), zero.consumer_tag());
    assert!(default.consumer_tag().starts_with("amqp-bus.orders.created."));
    Ok(())
}

#[tokio::test]
async fn test_deliveries_keep_publish_order_within_a_queue() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    let mut orders = bus.consume("orders.created", Some(5)).await?;

    for id in 0..10 {
        bus.publish("orders", "created", &json!({ "id": id }), None).await?;
    }

    for expected in 0..10 {
        let envelope = next(&mut orders).await?;
        assert_eq!(envelope.data["id"], expected);
        envelope.ack().await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_subscriptions_on_separate_queues_are_independent() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |topology| async move {
        topology.assert_queue("orders", "created", "orders.created").await?;
        topology.assert_queue("orders", "#", "orders.audit").await
    })
    .await?;

    let mut created = bus.consume("orders.created", Some(1)).await?;
    let mut audit = bus.consume("orders.audit", Some(10)).await?;

    bus.publish("orders", "created", &json!({"id": 1}), None).await?;
    bus.publish("orders", "cancelled", &json!({"id": 1}), None).await?;

    // The created subscription holds its only credit unacked while audit keeps flowing.
    let held = next(&mut created).await?;
    let a = next(&mut audit).await?;
    let b = next(&mut audit).await?;
    assert_eq!(a.routing_key, "created");
    assert_eq!(b.routing_key, "cancelled");
    a.ack().await?;
    b.ack().await?;
    held.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_undecodable_body_passes_through_with_decode_error() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    let mut orders = bus.consume("orders.created", None).await?;

    broker.publish_raw("orders", "created", b"{not json".to_vec()).await?;

    let envelope = next(&mut orders).await?;
    assert!(matches!(envelope.decode_error(), Some(BusError::Serialization(_))));
    assert_eq!(envelope.source, json!("{not json"));
    envelope.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_requeues_unacked_and_rejects_late_ack() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    bus.publish("orders", "created", &json!({"id": 7}), None).await?;

    let mut orders = bus.consume("orders.created", None).await?;
    let envelope = next(&mut orders).await?;
    orders.close().await?;

    assert!(timeout(WAIT, orders.next()).await?.is_none());
    let err = envelope.ack().await.unwrap_err();
    assert!(matches!(err, BusError::Protocol(_)));
    assert_eq!(broker.queue_depth("orders.created").await, Some(1));

    let mut again = bus.consume("orders.created", None).await?;
    let redelivered = next(&mut again).await?;
    assert!(redelivered.redelivered);
    assert_eq!(redelivered.data, json!({"id": 7}));
    redelivered.ack().await?;
    Ok(())
}

#[tokio::test]
async fn test_consume_unknown_queue_fails() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;

    let err = bus.consume("no.such.queue", None).await.err().expect("queue does not exist");
    assert!(matches!(err, BusError::Channel(_)));
    // The subscription's channel was closed again.
    assert!(broker.channel_stats(2).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_publish_unserializable_payload_fails_before_send() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;

    let mut bad = std::collections::HashMap::new();
    bad.insert(vec![1u8], "tuple keys cannot be JSON object keys");
    let err = bus.publish("orders", "created", &bad, None).await.unwrap_err();

    assert!(matches!(err, BusError::Serialization(_)));
    assert_eq!(broker.queue_depth("orders.created").await, Some(0));
    Ok(())
}

#[tokio::test]
async fn test_priority_orders_ready_messages() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = orders_bus(&broker).await?;
    bus.publish("orders", "created", &json!({"id": "low"}), None).await?;
    bus.publish("orders", "created", &json!({"id": "urgent"}), Some(9)).await?;

    let mut orders = bus.consume("orders.created", Some(1)).await?;
    let first = next(&mut orders).await?;
    assert_eq!(first.data["id"], "urgent");
    first.ack().await?;
    assert_eq!(next(&mut orders).await?.data["id"], "low");
    Ok(())
}
