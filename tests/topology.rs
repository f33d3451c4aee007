use std::sync::Arc;

use amqp_bus::transport::memory::Binding;
use amqp_bus::{BusConfig, BusError, MemoryBroker, MessageBus, Topology};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn binding(exchange: &str, routing_key: &str, queue: &str) -> Binding {
    Binding { exchange: exchange.to_string(), queue: queue.to_string(), routing_key: routing_key.to_string() }
}

#[tokio::test]
async fn test_assert_queue_is_idempotent() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |topology: Topology| async move {
        topology.assert_queue("orders", "created", "orders.created").await?;
        topology.assert_queue("orders", "created", "orders.created").await
    })
    .await?;

    let first = broker.topology().await;
    bus.topology().assert_queue("orders", "created", "orders.created").await?;
    bus.topology().assert_exchange("orders").await?;
    let second = broker.topology().await;

    assert_eq!(first, second);
    assert_eq!(second.exchanges.len(), 1);
    assert_eq!(second.queues.len(), 1);
    assert_eq!(second.bindings.len(), 1);
    assert!(second.bindings.contains(&binding("orders", "created", "orders.created")));
    Ok(())
}

#[tokio::test]
async fn test_assert_queue_declares_missing_exchange() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |_| async { Ok(()) }).await?;
    assert!(broker.topology().await.exchanges.is_empty());

    bus.topology().assert_queue("billing", "invoice.*", "billing.invoices").await?;

    let snapshot = broker.topology().await;
    assert!(snapshot.exchanges.contains("billing"));
    assert!(snapshot.queues.contains("billing.invoices"));
    assert!(snapshot.bindings.contains(&binding("billing", "invoice.*", "billing.invoices")));
    Ok(())
}

#[tokio::test]
async fn test_rejected_topology_fails_startup_and_closes_connection() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let result = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |topology| async move {
        topology.assert_queue("amq.orders", "created", "orders.created").await
    })
    .await;

    let err = result.err().expect("reserved exchange name must be refused");
    assert!(matches!(err, BusError::Topology(_)), "unexpected error: {err}");
    assert!(err.is_fatal());
    // The publisher channel was closed along with the connection.
    assert!(broker.channel_stats(1).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_any_channel_opens() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let config = BusConfig { default_prefetch: 0, ..BusConfig::default() };

    let err = MessageBus::connect_with(Arc::new(broker.connect()), &config, |_| async { Ok(()) })
        .await
        .err()
        .expect("zero default prefetch must be rejected");

    assert!(matches!(err, BusError::Config(_)));
    assert!(broker.channel_stats(1).await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_consume_errors_asserts_error_topology() -> anyhow::Result<()> {
    init_logger();
    let broker = MemoryBroker::new();
    let bus = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |_| async { Ok(()) }).await?;
    assert!(!broker.topology().await.queues.contains(amqp_bus::bus::ERROR_QUEUE));

    let _errors = bus.consume_errors(None).await?;

    let snapshot = broker.topology().await;
    assert!(snapshot.exchanges.contains(amqp_bus::bus::ERROR_EXCHANGE));
    assert!(snapshot.bindings.contains(&binding(
        amqp_bus::bus::ERROR_EXCHANGE,
        amqp_bus::bus::ERROR_BINDING,
        amqp_bus::bus::ERROR_QUEUE
    )));
    Ok(())
}
