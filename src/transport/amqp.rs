//! AMQP 0.9.1 传输层 / AMQP 0.9.1 transport backed by `lapin`.

use std::sync::Arc;

use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use log::{debug, error, info};
use tokio_stream::StreamExt;

use crate::bus::codec::CONTENT_TYPE;
use crate::bus::config::BusConfig;
use crate::bus::error::{BusError, Result};
use crate::bus::traits::{BrokerChannel, Delivery, DeliveryStream, Transport};

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

pub struct AmqpTransport {
    connection: Connection,
    max_priority: Option<u8>,
}

impl AmqpTransport {
    /// 连接代理 / Connect to the broker named by `config.url`.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        config.validate()?;
        info!("连接代理: {} / Connecting to broker: {}", config.redacted_url(), config.redacted_url());
        let properties = ConnectionProperties::default().with_connection_name(config.connection_name.clone().into());
        let connection = Connection::connect(&config.url, properties).await.map_err(|e| {
            error!("连接代理失败: {} / Broker connection failed: {}", e, e);
            BusError::Connection(e.to_string())
        })?;
        info!("已连接代理 / Broker connection established");
        Ok(AmqpTransport { connection, max_priority: config.max_priority })
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("cannot open channel: {}", e)))?;
        debug!("打开通道 {} / Opened channel {}", channel.id(), channel.id());
        Ok(Arc::new(AmqpChannel { channel, max_priority: self.max_priority }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| BusError::Connection(e.to_string()))
    }
}

pub struct AmqpChannel {
    channel: lapin::Channel,
    max_priority: Option<u8>,
}

impl AmqpChannel {
    fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if let Some(max) = self.max_priority {
            arguments.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }
        arguments
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let options = ExchangeDeclareOptions { durable: true, ..Default::default() };
        self.channel
            .exchange_declare(exchange, ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| BusError::Topology(format!("exchange '{}': {}", exchange, e)))
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let options = QueueDeclareOptions { durable: true, ..Default::default() };
        self.channel
            .queue_declare(queue, options, self.queue_arguments())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Topology(format!("queue '{}': {}", queue, e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::Topology(format!("binding '{}' <- '{}' ({}): {}", queue, exchange, routing_key, e)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("basic.qos {}: {}", count, e)))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, priority: Option<u8>) -> Result<bool> {
        let mut properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);
        if let Some(priority) = priority {
            properties = properties.with_priority(priority);
        }
        // Confirms are not enabled; the returned confirm resolves to NotRequested.
        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &body, properties)
            .await
            .map(|_confirm| true)
            .map_err(|e| BusError::Channel(format!("publish to {}/{}: {}", exchange, routing_key, e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| BusError::Channel(format!("basic.consume on '{}': {}", queue, e)))?;

        let deliveries = consumer.map(|result| match result {
            Ok(delivery) => Ok(Delivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.as_str().to_string(),
                routing_key: delivery.routing_key.as_str().to_string(),
                priority: *delivery.properties.priority(),
                redelivered: delivery.redelivered,
                body: delivery.data,
            }),
            Err(e) => Err(BusError::Channel(e.to_string())),
        });
        Ok(Box::pin(deliveries))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        if !self.is_open() {
            return Err(BusError::Protocol(format!(
                "ack of tag {} on closed channel {}",
                delivery_tag,
                self.channel.id()
            )));
        }
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Channel(format!("basic.ack {}: {}", delivery_tag, e)))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|e| BusError::Channel(e.to_string()))
    }
}
