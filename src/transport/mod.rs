//! 传输层实现 / Transport implementations.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpTransport};
pub use memory::{Binding, ChannelStats, MemoryBroker, MemoryChannel, MemoryConnection, TopologySnapshot};
