use std::sync::Arc;
use std::time::Duration;

use amqp_bus::{BusConfig, BusError, MemoryBroker, MessageBus};
use log::{info, warn};
use serde_json::json;
use tokio::time::timeout;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting Error Replay Demo");

    let broker = MemoryBroker::new();
    let bus = MessageBus::connect_with(Arc::new(broker.connect()), &BusConfig::default(), |topology| async move {
        topology.assert_queue("shipments", "dispatch.*", "shipments.dispatch").await
    })
    .await?;

    bus.publish("shipments", "dispatch.eu", &json!({"parcel": "P-1", "weight": 2.5}), None).await?;
    bus.publish("shipments", "dispatch.us", &json!({"parcel": "P-2", "weight": 0.4}), None).await?;

    // First pass: the carrier is down, so every shipment fails and is dead-lettered.
    let mut shipments = bus.consume("shipments.dispatch", Some(1)).await?;
    for _ in 0..2 {
        let Some(shipment) = timeout(Duration::from_secs(1), shipments.next()).await? else {
            break;
        };
        warn!("Carrier unavailable for {}", shipment.data["parcel"]);
        shipment.forward_error(&BusError::Processing("carrier unavailable".to_string())).await?;
    }
    info!("Error queue depth: {:?}", broker.queue_depth(amqp_bus::bus::ERROR_QUEUE).await);

    // Carrier is back: replay everything with a raised priority.
    let mut errors = bus.consume_errors(None).await?;
    for _ in 0..2 {
        let Some(failed) = timeout(Duration::from_secs(1), errors.next()).await? else {
            break;
        };
        info!(
            "Replaying {} to {}/{} (failed with: {})",
            failed.data.data, failed.data.source_exchange, failed.data.source_routing_key, failed.data.err_message
        );
        failed.replay_data(Some(5)).await?;
        failed.ack().await?;
    }

    for _ in 0..2 {
        let Some(shipment) = timeout(Duration::from_secs(1), shipments.next()).await? else {
            break;
        };
        info!("Dispatched {} via {}", shipment.data["parcel"], shipment.routing_key);
        shipment.ack().await?;
    }

    bus.close().await?;
    info!("Error Replay Demo finished");
    Ok(())
}
