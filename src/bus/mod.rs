use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod schema;
pub mod topology;
pub mod traits;

pub use config::{BusConfig, DEFAULT_PREFETCH};
pub use consumer::{Subscription, SubscriptionHandle};
pub use envelope::{Acker, Envelope, ErrorRecord};
pub use error::{BusError, ErrorKind, Result};
pub use pipeline::{EnvelopeStream, EnvelopeStreamExt, ValidateStreamExt};
pub use publisher::Publisher;
pub use schema::{
    from_fn, typed, DomainSchema, FieldKind, FieldSpec, Issue, ObjectSchema, Schema, SchemaConfig, SchemaRegistry,
    UnknownKeys, ValidationError,
};
pub use topology::{Topology, ERROR_BINDING, ERROR_EXCHANGE, ERROR_QUEUE};
pub use traits::{BrokerChannel, Delivery, DeliveryStream, Transport};

/// 消息总线连接 / Message bus connection
///
/// 持有一个代理连接和一个共享的发布通道；每个订阅打开自己的通道。
/// Owns one broker connection and the single shared publisher channel.
/// Every subscription opens its own channel. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    publisher: Publisher,
    config: Arc<BusConfig>,
}

impl MessageBus {
    /// 连接 AMQP 代理并运行拓扑设置
    ///
    /// Connect to the AMQP broker at `config.url`, open the publisher channel
    /// and run `setup` against it. Any failure closes the connection and is
    /// returned; callers are expected to treat it as fatal.
    #[cfg(feature = "amqp")]
    pub async fn connect<F, Fut>(config: &BusConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(Topology) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let transport = crate::transport::amqp::AmqpTransport::connect(config).await?;
        Self::connect_with(Arc::new(transport), config, setup).await
    }

    /// 基于任意传输层建立总线 / Build the bus over an already-open transport.
    pub async fn connect_with<F, Fut>(transport: Arc<dyn Transport>, config: &BusConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(Topology) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match Self::initialize(Arc::clone(&transport), config, setup).await {
            Ok(bus) => {
                info!("消息总线就绪: {} / Message bus ready: {}", config.connection_name, config.connection_name);
                Ok(bus)
            }
            Err(e) => {
                error!("消息总线启动失败: {} / Message bus startup failed: {}", e, e);
                if let Err(close_err) = transport.close().await {
                    warn!("关闭连接失败: {} / Closing connection failed: {}", close_err, close_err);
                }
                Err(e)
            }
        }
    }

    async fn initialize<F, Fut>(transport: Arc<dyn Transport>, config: &BusConfig, setup: F) -> Result<Self>
    where
        F: FnOnce(Topology) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        config.validate()?;
        let channel = transport.open_channel().await?;
        let publisher = Publisher::new(channel);
        debug!("运行拓扑设置 / Running topology setup");
        setup(publisher.topology().clone()).await?;
        Ok(MessageBus { transport, publisher, config: Arc::new(config.clone()) })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// 发布通道上的拓扑句柄 / Topology handle on the publisher channel.
    pub fn topology(&self) -> &Topology {
        self.publisher.topology()
    }

    /// 发布消息 / Publish a message.
    ///
    /// See [`Publisher::publish`].
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        priority: Option<u8>,
    ) -> Result<bool> {
        self.publisher.publish(exchange, routing_key, payload, priority).await
    }

    /// 订阅队列
    ///
    /// Open a fresh subscription to `queue` on a new channel. `prefetch`
    /// caps unacknowledged deliveries; `None` or `Some(0)` uses the
    /// configured default. Each call is independent and never replays
    /// history.
    pub async fn consume(&self, queue: &str, prefetch: Option<u16>) -> Result<Subscription> {
        let prefetch = self.config.prefetch_or_default(prefetch);
        Subscription::open(
            self.transport.as_ref(),
            self.publisher.clone(),
            &self.config.connection_name,
            queue,
            prefetch,
        )
        .await
    }

    /// 订阅错误队列
    ///
    /// Subscribe to the reserved error queue, asserting the error topology
    /// first. Records that do not parse as [`ErrorRecord`] are logged and
    /// acknowledged.
    pub async fn consume_errors(&self, prefetch: Option<u16>) -> Result<EnvelopeStream<ErrorRecord>> {
        self.publisher.ensure_error_topology().await?;
        let subscription = self.consume(ERROR_QUEUE, prefetch).await?;
        Ok(subscription.validate(typed::<ErrorRecord>(), |err, envelope| {
            error!(
                "错误队列中的记录无法解析 ({}): {} / Unreadable record on error queue ({}): {}",
                envelope.routing_key, err, envelope.routing_key, err
            );
        }))
    }

    /// 关闭连接及所有通道 / Close the connection and every channel on it.
    pub async fn close(&self) -> Result<()> {
        info!("关闭消息总线 / Closing message bus");
        self.transport.close().await
    }
}
