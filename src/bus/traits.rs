use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::Stream;

use super::error::Result;

/// 代理推送的一条投递 / A single delivery pushed by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// 通道内唯一的投递标签 / Delivery tag, unique within its channel.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub priority: Option<u8>,
    pub redelivered: bool,
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery>> + Send>>;

/// 代理连接 / Broker connection
///
/// 一个连接可以打开多个相互独立的通道。
/// One connection multiplexes any number of independent channels.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// 打开一个新通道 / Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// 关闭连接及其所有通道 / Close the connection and all of its channels.
    async fn close(&self) -> Result<()>;
}

/// 代理通道 / Broker channel
///
/// 声明操作都是幂等的；发布按提交顺序写出。
/// Declarations are idempotent; publishes go out in submission order.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// 声明持久化 topic 交换机 / Declare a durable topic exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// 声明持久化队列 / Declare a durable queue.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// 以路由键模式绑定队列 / Bind a queue to an exchange with a routing-key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// 设置本通道未确认投递的上限 / Cap unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// 提交消息；返回本地发送缓冲是否接受
    ///
    /// Submit a message. Returns whether the local send buffer accepted it.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, priority: Option<u8>) -> Result<bool>;

    /// 开始消费队列 / Start consuming a queue on this channel.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// 关闭通道，未确认的投递交还代理重新入队
    ///
    /// Close the channel; unacknowledged deliveries go back to the broker.
    async fn close(&self) -> Result<()>;
}
