use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::DecodedBody;
use super::error::{BusError, ErrorKind, Result};
use super::publisher::Publisher;
use super::traits::{BrokerChannel, Delivery};

/// 一次性确认能力 / One-shot acknowledgment capability
///
/// 绑定到具体的投递标签和通道；第二次确认会被拒绝。
/// Bound to one delivery tag on one channel. Clones share the same state, so
/// a second acknowledgment through any clone is rejected as a protocol violation.
#[derive(Clone)]
pub struct Acker {
    inner: Arc<AckerInner>,
}

struct AckerInner {
    channel: Arc<dyn BrokerChannel>,
    delivery_tag: u64,
    queue: String,
    settled: AtomicBool,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>, delivery_tag: u64, queue: String) -> Self {
        Acker {
            inner: Arc::new(AckerInner { channel, delivery_tag, queue, settled: AtomicBool::new(false) }),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    /// 是否已进入终止状态 / Whether the delivery reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// 确认投递 / Acknowledge the delivery.
    pub async fn ack(&self) -> Result<()> {
        self.claim()?;
        self.send().await
    }

    /// Move to the terminal state. Fails if another path got there first.
    pub(crate) fn claim(&self) -> Result<()> {
        if self.inner.settled.swap(true, Ordering::SeqCst) {
            warn!(
                "重复确认被拒绝: 队列 {}, 标签 {} / Duplicate acknowledgment rejected: queue {}, tag {}",
                self.inner.queue, self.inner.delivery_tag, self.inner.queue, self.inner.delivery_tag
            );
            return Err(BusError::Protocol(format!(
                "delivery {} from queue '{}' was already acknowledged",
                self.inner.delivery_tag, self.inner.queue
            )));
        }
        Ok(())
    }

    pub(crate) async fn send(&self) -> Result<()> {
        let channel = &self.inner.channel;
        if !channel.is_open() {
            warn!(
                "通道 {} 已关闭，无法确认标签 {} / Channel {} closed, cannot ack tag {}",
                channel.id(),
                self.inner.delivery_tag,
                channel.id(),
                self.inner.delivery_tag
            );
            return Err(BusError::Protocol(format!(
                "ack of delivery {} after channel {} closed",
                self.inner.delivery_tag,
                channel.id()
            )));
        }
        channel.ack(self.inner.delivery_tag).await.map_err(|e| {
            warn!("确认失败: {} / Ack failed: {}", e, e);
            e
        })
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.inner.delivery_tag)
            .field("queue", &self.inner.queue)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// 交给应用代码的消息信封
///
/// The unit handed to application code. `source` is the payload as
/// decoded from the wire; `data` is the typed payload, replaced by
/// validation stages. Exactly one of [`Envelope::ack`] or
/// [`Envelope::forward_error`] must be called per envelope.
pub struct Envelope<T = Value> {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub source: Value,
    pub data: T,
    pub redelivered: bool,
    decode_error: Option<BusError>,
    /// Original bytes, kept only when the body did not decode.
    raw_body: Option<Vec<u8>>,
    acker: Acker,
    publisher: Publisher,
}

impl Envelope<Value> {
    pub(crate) fn from_delivery(
        delivery: Delivery,
        queue: &str,
        channel: Arc<dyn BrokerChannel>,
        publisher: Publisher,
    ) -> Self {
        let (source, decode_error, raw_body) = match DecodedBody::from_bytes(&delivery.body) {
            DecodedBody::Json(value) => (value, None, None),
            DecodedBody::Invalid { text, error } => {
                error!(
                    "无法解析来自 {} 的消息体: {} / Cannot decode body from {}: {}",
                    queue, error, queue, error
                );
                (Value::String(text), Some(error), Some(delivery.body))
            }
        };
        Envelope {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            queue: queue.to_string(),
            data: source.clone(),
            source,
            redelivered: delivery.redelivered,
            decode_error,
            raw_body,
            acker: Acker::new(channel, delivery.delivery_tag, queue.to_string()),
            publisher,
        }
    }
}

impl<T> Envelope<T> {
    /// 消息体解码失败时的错误 / The decoding failure, if the body was not valid JSON.
    pub fn decode_error(&self) -> Option<&BusError> {
        self.decode_error.as_ref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.acker.delivery_tag()
    }

    /// 共享的确认句柄，可移交给其他任务
    ///
    /// A shared handle to this envelope's acknowledgment, e.g. to ack from another task.
    pub fn acker(&self) -> Acker {
        self.acker.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.acker.is_settled()
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// 替换类型化负载 / Replace the typed payload.
    pub fn with_data<U>(self, data: U) -> Envelope<U> {
        Envelope {
            exchange: self.exchange,
            routing_key: self.routing_key,
            queue: self.queue,
            source: self.source,
            data,
            redelivered: self.redelivered,
            decode_error: self.decode_error,
            raw_body: self.raw_body,
            acker: self.acker,
            publisher: self.publisher,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Envelope<U> {
        let Envelope { exchange, routing_key, queue, source, data, redelivered, decode_error, raw_body, acker, publisher } =
            self;
        Envelope {
            exchange,
            routing_key,
            queue,
            source,
            data: f(data),
            redelivered,
            decode_error,
            raw_body,
            acker,
            publisher,
        }
    }

    /// 确认并消费该信封 / Acknowledge and consume the envelope.
    pub async fn ack(self) -> Result<()> {
        debug!("确认 {} 标签 {} / Acking {} tag {}", self.queue, self.delivery_tag(), self.queue, self.delivery_tag());
        self.acker.ack().await
    }

    /// 构造带完整来源信息的错误记录
    ///
    /// Build the error record for `err` with this envelope's provenance.
    pub fn error_record(&self, err: &BusError) -> ErrorRecord {
        ErrorRecord {
            err_type: err.kind(),
            err_message: err.message(),
            source_exchange: self.exchange.clone(),
            source_routing_key: self.routing_key.clone(),
            source_queue: self.queue.clone(),
            data: self.source.clone(),
            raw: self.raw_body.clone(),
            failed_at: now_millis(),
        }
    }

    /// 将失败转发到错误队列并确认原消息
    ///
    /// Dead-letter this envelope: publish an [`ErrorRecord`] to the reserved
    /// error topology, then acknowledge the original delivery. The original
    /// is acknowledged even when the error publish fails, so a poison message
    /// never blocks its queue; the publish failure is returned.
    pub async fn forward_error(self, err: &BusError) -> Result<()> {
        self.acker.claim()?;
        let record = self.error_record(err);
        let published = self.publisher.publish_error(&record).await;
        if let Err(ref e) = published {
            error!(
                "错误记录发布失败，原消息 {}/{} 已丢弃: {} / Error record publish failed, original {}/{} dropped: {}",
                record.source_exchange, record.source_routing_key, e, record.source_exchange, record.source_routing_key, e
            );
        }
        let acked = self.acker.send().await;
        published?;
        acked
    }
}

impl Envelope<ErrorRecord> {
    /// 将恢复的负载重新发布到原始目的地
    ///
    /// Republish the recovered payload to the exchange and routing key
    /// recorded at failure time, optionally with a new priority. The error
    /// envelope itself still has to be acknowledged.
    pub async fn replay_data(&self, priority: Option<u8>) -> Result<bool> {
        self.data.replay(&self.publisher, priority).await
    }
}

impl<T: fmt::Debug> fmt::Debug for Envelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("queue", &self.queue)
            .field("data", &self.data)
            .field("redelivered", &self.redelivered)
            .field("decode_error", &self.decode_error)
            .field("acker", &self.acker)
            .finish()
    }
}

/// 死信错误记录 / Dead-letter error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub err_type: ErrorKind,
    pub err_message: String,
    /// 原始目的交换机 / Exchange the failed message was destined for.
    pub source_exchange: String,
    pub source_routing_key: String,
    #[serde(default)]
    pub source_queue: String,
    /// 原始负载 / The payload as it was received.
    pub data: Value,
    /// 无法解码的原始字节 / Undecodable body bytes, replayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
    /// Unix milliseconds.
    #[serde(default)]
    pub failed_at: u64,
}

impl ErrorRecord {
    pub async fn replay(&self, publisher: &Publisher, priority: Option<u8>) -> Result<bool> {
        debug!(
            "重放到 {}/{} / Replaying to {}/{}",
            self.source_exchange, self.source_routing_key, self.source_exchange, self.source_routing_key
        );
        match &self.raw {
            Some(raw) => {
                publisher
                    .publish_bytes(&self.source_exchange, &self.source_routing_key, raw.clone(), priority)
                    .await
            }
            None => publisher.publish(&self.source_exchange, &self.source_routing_key, &self.data, priority).await,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
