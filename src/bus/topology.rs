use std::sync::Arc;

use log::{debug, error};

use super::error::{BusError, Result};
use super::traits::BrokerChannel;

/// 保留的错误交换机 / Reserved error exchange.
pub const ERROR_EXCHANGE: &str = "error";
/// 保留的错误队列 / Reserved error queue.
pub const ERROR_QUEUE: &str = "errors";
/// The error queue receives every error tag.
pub const ERROR_BINDING: &str = "#";

/// 拓扑声明句柄 / Topology declaration handle
///
/// 所有声明都是幂等的，可以重复调用。
/// Every assertion is idempotent and safe to repeat.
#[derive(Clone)]
pub struct Topology {
    channel: Arc<dyn BrokerChannel>,
}

impl Topology {
    pub(crate) fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Topology { channel }
    }

    /// 声明持久化 topic 交换机
    ///
    /// Assert a durable topic exchange.
    pub async fn assert_exchange(&self, exchange: &str) -> Result<()> {
        debug!("声明交换机: {} / Asserting exchange: {}", exchange, exchange);
        self.channel.declare_exchange(exchange).await.map_err(|e| topology_failure(e, exchange))
    }

    /// 声明交换机、持久化队列以及两者之间的绑定
    ///
    /// Assert the exchange, a durable queue, and the binding
    /// `queue <- exchange` by `routing_key` pattern. The exchange is always
    /// re-asserted first, so no prior `assert_exchange` is needed.
    pub async fn assert_queue(&self, exchange: &str, routing_key: &str, queue: &str) -> Result<()> {
        self.assert_exchange(exchange).await?;
        debug!(
            "声明队列 {} 并绑定到 {} ({}) / Asserting queue {} bound to {} ({})",
            queue, exchange, routing_key, queue, exchange, routing_key
        );
        self.channel.declare_queue(queue).await.map_err(|e| topology_failure(e, queue))?;
        self.channel
            .bind_queue(queue, exchange, routing_key)
            .await
            .map_err(|e| topology_failure(e, queue))
    }

    /// Assert the reserved error exchange and queue.
    pub async fn assert_error_topology(&self) -> Result<()> {
        self.assert_queue(ERROR_EXCHANGE, ERROR_BINDING, ERROR_QUEUE).await
    }
}

fn topology_failure(err: BusError, entity: &str) -> BusError {
    error!("拓扑声明失败 {}: {} / Topology assertion failed for {}: {}", entity, err, entity, err);
    match err {
        BusError::Topology(_) => err,
        other => BusError::Topology(format!("{}: {}", entity, other.message())),
    }
}
