use std::sync::Arc;
use std::time::Duration;

use amqp_bus::{
    BusConfig, EnvelopeStreamExt, MemoryBroker, MessageBus, SchemaRegistry, Topology, ValidateStreamExt,
};
use log::{info, warn};
use serde_json::{json, Value};
use tokio_stream::StreamExt;

const SCHEMAS: &str = r#"{
    "shared": [
        { "name": "id", "kind": { "type": "integer" } },
        { "name": "tenant", "kind": { "type": "string" }, "required": false }
    ],
    "domains": [
        {
            "name": "order",
            "fields": [
                { "name": "total", "kind": { "type": "number" } },
                { "name": "express", "kind": { "type": "boolean" }, "required": false }
            ],
            "exclude": ["tenant"],
            "unknown": "strip"
        }
    ]
}"#;

async fn setup(topology: Topology) -> amqp_bus::Result<()> {
    topology.assert_queue("orders", "created", "orders.created").await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting Orders Pipeline Demo");

    // Talk to a real broker when AMQP_URL is set, otherwise run in-process.
    let config = BusConfig::from_env()?;
    let bus = if std::env::var("AMQP_URL").is_ok() {
        MessageBus::connect(&config, setup).await?
    } else {
        info!("AMQP_URL not set, using the in-memory broker");
        MessageBus::connect_with(Arc::new(MemoryBroker::new().connect()), &config, setup).await?
    };

    let registry = SchemaRegistry::from_json(SCHEMAS)?;
    info!("Registered schema domains: {:?}", registry.domains());

    let subscription = bus.consume("orders.created", Some(10)).await?;
    let handle = subscription.handle();
    let mut orders = subscription
        .filter_acked(|order: &Value| order["total"] != json!(0))
        .validate_or_dead_letter(registry.schema("order")?);

    bus.publish("orders", "created", &json!({"id": 1, "total": "19.90", "internal": "x"}), None).await?;
    bus.publish("orders", "created", &json!({"id": 2, "total": 0}), None).await?;
    bus.publish("orders", "created", &json!({"id": "three", "total": 5}), None).await?;
    bus.publish("orders", "created", &json!({"id": 4, "total": 42, "express": "true"}), Some(5)).await?;

    let mut processed = 0;
    while processed < 2 {
        match tokio::time::timeout(Duration::from_secs(2), orders.next()).await {
            Ok(Some(order)) => {
                info!("Processing order {} from {}/{}", order.data, order.exchange, order.routing_key);
                order.ack().await?;
                processed += 1;
            }
            Ok(None) => break,
            Err(_) => {
                warn!("No more orders within timeout");
                break;
            }
        }
    }

    let mut errors = bus.consume_errors(None).await?;
    if let Ok(Some(failed)) = tokio::time::timeout(Duration::from_secs(1), errors.next()).await {
        info!(
            "Dead-lettered {} from {}/{}: {}",
            failed.data.err_type, failed.data.source_exchange, failed.data.source_routing_key, failed.data.err_message
        );
        failed.ack().await?;
    }

    handle.close().await?;
    bus.close().await?;
    info!("Orders Pipeline Demo finished");
    Ok(())
}
