use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use log::{debug, error, info, warn};
use tokio_stream::{Stream, StreamExt};

use super::envelope::Envelope;
use super::error::Result;
use super::publisher::Publisher;
use super::traits::{BrokerChannel, Transport};

static NEXT_CONSUMER: AtomicU64 = AtomicU64::new(1);

/// 队列订阅，作为信封流使用
///
/// A subscription to one queue on its own channel, consumed as a stream of
/// envelopes. Deliveries arrive in broker order; at most `prefetch` of them
/// are unacknowledged at any moment. The stream ends when the channel closes.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    prefetch: u16,
    channel: Arc<dyn BrokerChannel>,
    inner: Pin<Box<dyn Stream<Item = Envelope> + Send>>,
}

impl Subscription {
    pub(crate) async fn open(
        transport: &dyn Transport,
        publisher: Publisher,
        connection_name: &str,
        queue: &str,
        prefetch: u16,
    ) -> Result<Self> {
        let channel = transport.open_channel().await?;
        if let Err(e) = channel.set_prefetch(prefetch).await {
            error!("设置预取失败 {}: {} / Setting prefetch failed for {}: {}", queue, e, queue, e);
            close_quietly(channel.as_ref()).await;
            return Err(e);
        }

        let consumer_tag = format!("{}.{}.{}", connection_name, queue, NEXT_CONSUMER.fetch_add(1, Ordering::Relaxed));
        let mut deliveries = match channel.consume(queue, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!("无法消费队列 {}: {} / Cannot consume queue {}: {}", queue, e, queue, e);
                close_quietly(channel.as_ref()).await;
                return Err(e);
            }
        };
        info!(
            "订阅队列 {} (预取 {}, 标签 {}) / Subscribed to queue {} (prefetch {}, tag {})",
            queue, prefetch, consumer_tag, queue, prefetch, consumer_tag
        );

        let stream_channel = Arc::clone(&channel);
        let stream_queue = queue.to_string();
        let inner = async_stream::stream! {
            while let Some(item) = deliveries.next().await {
                match item {
                    Ok(delivery) => {
                        debug!("收到投递 {} 来自 {} / Delivery {} from {}", delivery.delivery_tag, stream_queue, delivery.delivery_tag, stream_queue);
                        yield Envelope::from_delivery(delivery, &stream_queue, Arc::clone(&stream_channel), publisher.clone());
                    }
                    Err(e) => {
                        error!("消费 {} 出错: {} / Consumer error on {}: {}", stream_queue, e, stream_queue, e);
                        if !stream_channel.is_open() {
                            break;
                        }
                    }
                }
            }
            warn!("队列 {} 的订阅已结束 / Subscription to {} ended", stream_queue, stream_queue);
        };

        Ok(Subscription {
            queue: queue.to_string(),
            consumer_tag,
            prefetch,
            channel,
            inner: Box::pin(inner),
        })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// 订阅所用通道的编号 / Id of the channel this subscription consumes on.
    pub fn channel_id(&self) -> u16 {
        self.channel.id()
    }

    /// 关闭订阅通道；未确认的投递由代理重新入队
    ///
    /// Close the subscription's channel. Unacknowledged deliveries are
    /// requeued by the broker, and acks issued afterwards fail.
    pub async fn close(&self) -> Result<()> {
        self.handle().close().await
    }

    /// 订阅被流水线接管后仍可用于关闭的句柄
    ///
    /// A handle that can still close the subscription after it has been
    /// moved into a pipeline stage.
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle { consumer_tag: self.consumer_tag.clone(), channel: Arc::clone(&self.channel) }
    }
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
}

impl SubscriptionHandle {
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn close(&self) -> Result<()> {
        info!("关闭订阅 {} / Closing subscription {}", self.consumer_tag, self.consumer_tag);
        self.channel.close().await
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!("关闭通道 {} 失败: {} / Closing channel {} failed: {}", channel.id(), e, channel.id(), e);
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("consumer_tag", &self.consumer_tag)
            .field("prefetch", &self.prefetch)
            .field("channel", &self.channel.id())
            .finish()
    }
}
