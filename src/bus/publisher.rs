use std::sync::Arc;

use log::{debug, error, info};
use serde::Serialize;
use tokio::sync::{Mutex, OnceCell};

use super::codec;
use super::envelope::ErrorRecord;
use super::error::Result;
use super::topology::{Topology, ERROR_EXCHANGE};
use super::traits::BrokerChannel;

#[derive(Clone)]
/// 发布者，所有发送共享同一个发布通道
///
/// Publisher. Every send goes through the one shared publisher channel.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    write_lock: Arc<Mutex<()>>,
    topology: Topology,
    error_topology: Arc<OnceCell<()>>,
}

impl Publisher {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        debug!("创建发布者，通道 {} / Creating publisher on channel {}", channel.id(), channel.id());
        Publisher {
            topology: Topology::new(Arc::clone(&channel)),
            channel,
            write_lock: Arc::new(Mutex::new(())),
            error_topology: Arc::new(OnceCell::new()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// 序列化并发布任意可序列化数据
    ///
    /// Serialize `payload` and publish it to `exchange` with `routing_key`.
    /// Serialization errors are returned before anything is sent. The result
    /// tells whether the channel's send buffer accepted the message.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        priority: Option<u8>,
    ) -> Result<bool> {
        let body = codec::encode(payload)?;
        self.publish_bytes(exchange, routing_key, body, priority).await
    }

    /// 发布已编码的消息体
    ///
    /// Publish a pre-encoded body.
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        priority: Option<u8>,
    ) -> Result<bool> {
        info!(
            "发布到 {}/{}: {} / Publishing to {}/{}: {}",
            exchange,
            routing_key,
            codec::preview(&body, 256),
            exchange,
            routing_key,
            codec::preview(&body, 256)
        );
        let _guard = self.write_lock.lock().await;
        let accepted = self.channel.publish(exchange, routing_key, body, priority).await.map_err(|e| {
            error!("发布失败 {}/{}: {} / Publish failed {}/{}: {}", exchange, routing_key, e, exchange, routing_key, e);
            e
        })?;
        if !accepted {
            debug!("发送缓冲未接受消息 / Send buffer did not accept the message");
        }
        Ok(accepted)
    }

    /// 发布错误记录到保留的错误拓扑（首次使用时声明）
    ///
    /// Publish an error record to the reserved error topology, asserting it
    /// on first use. The routing key is the record's error-type tag.
    pub async fn publish_error(&self, record: &ErrorRecord) -> Result<bool> {
        self.ensure_error_topology().await?;
        self.publish(ERROR_EXCHANGE, record.err_type.as_str(), record, None).await
    }

    pub(crate) async fn ensure_error_topology(&self) -> Result<()> {
        self.error_topology
            .get_or_try_init(|| async { self.topology.assert_error_topology().await })
            .await
            .map(|_| ())
    }
}
