//! 进程内代理 / In-process broker
//!
//! 实现与 AMQP 代理相同的通道语义：topic 路由、持久化队列、预取额度和确认簿记。
//! Implements the same channel semantics the AMQP transport relies on: topic
//! routing, durable queues, per-channel prefetch credit and ack bookkeeping.
//! Queues and bindings live on the broker and survive connection close, like
//! durable entities on a real server.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::sync::{Mutex, Notify};

use crate::bus::error::{BusError, Result};
use crate::bus::traits::{BrokerChannel, Delivery, DeliveryStream, Transport};

/// AMQP reserves the `amq.` prefix for broker-defined entities.
const RESERVED_PREFIX: &str = "amq.";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// 代理拓扑快照 / Broker-visible topology snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub exchanges: BTreeSet<String>,
    pub queues: BTreeSet<String>,
    pub bindings: BTreeSet<Binding>,
}

/// 通道统计信息 / Channel statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub id: u16,
    pub prefetch: u16,
    pub unacked: usize,
    /// 同时未确认投递的历史峰值 / Highest number of simultaneously unacked deliveries.
    pub peak_unacked: usize,
    pub acked: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Arc<Vec<u8>>,
    priority: Option<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, StoredMessage)>,
    peak_unacked: usize,
    acked: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    bindings: BTreeSet<Binding>,
    channels: HashMap<u16, ChannelState>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_channel: AtomicU16,
}

/// 内存代理，可克隆并共享
///
/// In-memory broker; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        debug!("创建内存代理 / Creating in-memory broker");
        MemoryBroker {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                next_channel: AtomicU16::new(1),
            }),
        }
    }

    /// 打开一个新连接 / Open a new connection to this broker.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection { broker: self.clone(), channels: Mutex::new(Vec::new()) }
    }

    pub async fn topology(&self) -> TopologySnapshot {
        let state = self.inner.state.lock().await;
        TopologySnapshot {
            exchanges: state.exchanges.iter().cloned().collect(),
            queues: state.queues.keys().cloned().collect(),
            bindings: state.bindings.clone(),
        }
    }

    /// 队列中等待投递的消息数 / Messages ready for delivery in a queue.
    pub async fn queue_depth(&self, queue: &str) -> Option<usize> {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.len())
    }

    /// 队列已投递但未确认的消息数 / Delivered but unacknowledged messages of a queue.
    pub async fn unacked(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .channels
            .values()
            .map(|c| c.unacked.values().filter(|(q, _)| q == queue).count())
            .sum()
    }

    pub async fn channel_stats(&self, channel_id: u16) -> Option<ChannelStats> {
        let state = self.inner.state.lock().await;
        state.channels.get(&channel_id).map(|c| ChannelStats {
            id: channel_id,
            prefetch: c.prefetch,
            unacked: c.unacked.len(),
            peak_unacked: c.peak_unacked,
            acked: c.acked,
        })
    }

    /// 绕过编码直接发布原始字节 / Publish raw bytes, bypassing the JSON codec.
    pub async fn publish_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.route(exchange, routing_key, body, None).await.map(|_| ())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        if exchange.starts_with(RESERVED_PREFIX) {
            return Err(BusError::Topology(format!(
                "ACCESS_REFUSED - exchange name '{}' contains reserved prefix '{}'",
                exchange, RESERVED_PREFIX
            )));
        }
        let mut state = self.inner.state.lock().await;
        if state.exchanges.insert(exchange.to_string()) {
            info!("声明交换机: {} / Declared exchange: {}", exchange, exchange);
        }
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        if queue.starts_with(RESERVED_PREFIX) {
            return Err(BusError::Topology(format!(
                "ACCESS_REFUSED - queue name '{}' contains reserved prefix '{}'",
                queue, RESERVED_PREFIX
            )));
        }
        let mut state = self.inner.state.lock().await;
        if !state.queues.contains_key(queue) {
            info!("声明队列: {} / Declared queue: {}", queue, queue);
            state.queues.insert(queue.to_string(), VecDeque::new());
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.exchanges.contains(exchange) {
            return Err(BusError::Topology(format!("NOT_FOUND - no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if state.bindings.insert(binding) {
            info!("绑定 {} <- {} ({}) / Bound {} <- {} ({})", queue, exchange, routing_key, queue, exchange, routing_key);
        }
        Ok(())
    }

    /// 路由消息，返回进入的队列数 / Route a message; returns how many queues received it.
    async fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>, priority: Option<u8>) -> Result<usize> {
        let mut state = self.inner.state.lock().await;

        let targets: Vec<String> = if exchange.is_empty() {
            // Default exchange: routing key names the queue.
            state.queues.keys().filter(|q| q.as_str() == routing_key).cloned().collect()
        } else {
            if !state.exchanges.contains(exchange) {
                return Err(BusError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange)));
            }
            let matched: BTreeSet<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && topic_matches(&b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            matched.into_iter().collect()
        };

        if targets.is_empty() {
            debug!("消息无法路由，已丢弃: {}/{} / Unroutable message dropped: {}/{}", exchange, routing_key, exchange, routing_key);
            return Ok(0);
        }

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: Arc::new(body),
            priority,
            redelivered: false,
        };
        for queue in &targets {
            if let Some(ready) = state.queues.get_mut(queue) {
                enqueue_by_priority(ready, message.clone());
                trace!("消息进入队列 {} / Message enqueued on {}", queue, queue);
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(targets.len())
    }

    async fn open_channel_state(&self) -> u16 {
        let id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        state.channels.insert(id, ChannelState::default());
        id
    }

    async fn set_prefetch(&self, channel_id: u16, count: u16) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| BusError::Channel(format!("channel {} is closed", channel_id)))?;
        channel.prefetch = count;
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// 在预取额度内取出下一条投递
    ///
    /// Take the next delivery for a channel if its prefetch credit allows.
    async fn take_next(&self, channel_id: u16, queue: &str) -> Option<Delivery> {
        let mut state = self.inner.state.lock().await;
        let BrokerState { queues, channels, .. } = &mut *state;

        let channel = channels.get_mut(&channel_id)?;
        if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
            return None;
        }
        let message = queues.get_mut(queue)?.pop_front()?;

        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.as_ref().clone(),
            priority: message.priority,
            redelivered: message.redelivered,
        };
        channel.unacked.insert(delivery_tag, (queue.to_string(), message));
        channel.peak_unacked = channel.peak_unacked.max(channel.unacked.len());
        Some(delivery)
    }

    async fn ack(&self, channel_id: u16, delivery_tag: u64) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| BusError::Protocol(format!("ack on closed channel {}", channel_id)))?;
        if channel.unacked.remove(&delivery_tag).is_none() {
            return Err(BusError::Protocol(format!(
                "PRECONDITION_FAILED - unknown delivery tag {} on channel {}",
                delivery_tag, channel_id
            )));
        }
        channel.acked += 1;
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close_channel(&self, channel_id: u16) {
        let mut state = self.inner.state.lock().await;
        if let Some(channel) = state.channels.remove(&channel_id) {
            let mut pending: Vec<(u64, (String, StoredMessage))> = channel.unacked.into_iter().collect();
            pending.sort_by(|a, b| b.0.cmp(&a.0));
            let requeued = pending.len();
            for (_, (queue, mut message)) in pending {
                message.redelivered = true;
                if let Some(ready) = state.queues.get_mut(&queue) {
                    ready.push_front(message);
                }
            }
            if requeued > 0 {
                info!("通道 {} 关闭，重新入队 {} 条消息 / Channel {} closed, requeued {} messages", channel_id, requeued, channel_id, requeued);
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
    }
}

/// Higher priority first; equal priorities keep arrival order.
fn enqueue_by_priority(ready: &mut VecDeque<StoredMessage>, message: StoredMessage) {
    let priority = message.priority.unwrap_or(0);
    if priority == 0 {
        ready.push_back(message);
        return;
    }
    let position = ready
        .iter()
        .position(|m| m.priority.unwrap_or(0) < priority)
        .unwrap_or(ready.len());
    ready.insert(position, message);
}

/// AMQP topic 匹配：`*` 匹配一个单词，`#` 匹配零个或多个单词
///
/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}

/// 内存代理上的连接 / A connection to the in-memory broker.
pub struct MemoryConnection {
    broker: MemoryBroker,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait::async_trait]
impl Transport for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let id = self.broker.open_channel_state().await;
        debug!("打开内存通道 {} / Opened memory channel {}", id, id);
        let channel = Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        });
        let mut channels = self.channels.lock().await;
        channels.retain(|c| c.is_open());
        channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let channels: Vec<Arc<MemoryChannel>> = self.channels.lock().await.drain(..).collect();
        for channel in channels {
            channel.shutdown().await;
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    id: u16,
    broker: MemoryBroker,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Channel(format!("channel {} is closed", self.id)))
        }
    }

    async fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.close_channel(self.id).await;
        }
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open().map_err(|e| BusError::Topology(e.message()))?;
        self.broker.declare_exchange(exchange).await
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open().map_err(|e| BusError::Topology(e.message()))?;
        self.broker.declare_queue(queue).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open().map_err(|e| BusError::Topology(e.message()))?;
        self.broker.bind_queue(queue, exchange, routing_key).await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.ensure_open()?;
        self.broker.set_prefetch(self.id, count).await
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, priority: Option<u8>) -> Result<bool> {
        self.ensure_open()?;
        self.broker.route(exchange, routing_key, body, priority).await?;
        Ok(true)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        if self.broker.queue_depth(queue).await.is_none() {
            return Err(BusError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }
        debug!("通道 {} 开始消费 {} (标签 {}) / Channel {} consuming {} (tag {})", self.id, queue, consumer_tag, self.id, queue, consumer_tag);

        let broker = self.broker.clone();
        let open = Arc::clone(&self.open);
        let channel_id = self.id;
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                // Register for wake-ups before checking, so a publish in between is not missed.
                let notified = broker.inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !open.load(Ordering::SeqCst) {
                    debug!("通道 {} 已关闭，停止消费 / Channel {} closed, consumption stopped", channel_id, channel_id);
                    break;
                }
                if let Some(delivery) = broker.take_next(channel_id, &queue).await {
                    yield Ok(delivery);
                    continue;
                }
                notified.await;
            }
        };
        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        if !self.is_open() {
            warn!("在已关闭的通道 {} 上确认 / Ack on closed channel {}", self.id, self.id);
            return Err(BusError::Protocol(format!("ack of tag {} on closed channel {}", delivery_tag, self.id)));
        }
        self.broker.ack(self.id, delivery_tag).await
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}
