//! AMQP Bus - 基于 Tokio 的 topic 消息总线客户端
//!
//! AMQP Bus - a topic-based message bus client powered by Tokio: topology
//! assertion, acknowledged consumption with prefetch backpressure, schema
//! validation, and a dead-letter pipeline with replay.
//!
//! # Examples
//!
//! Validate orders and dead-letter the rest:
//! ```no_run
//! use amqp_bus::{BusConfig, FieldKind, MessageBus, ObjectSchema, ValidateStreamExt};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BusConfig::from_env()?;
//!     let bus = MessageBus::connect(&config, |topology| async move {
//!         topology.assert_queue("orders", "created", "orders.created").await
//!     })
//!     .await?;
//!
//!     let schema = ObjectSchema::new().required("id", FieldKind::Number);
//!     let mut orders = bus.consume("orders.created", None).await?.validate_or_dead_letter(schema);
//!     while let Some(order) = orders.next().await {
//!         println!("order {}", order.data);
//!         order.ack().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Inspect and replay dead-lettered messages:
//! ```no_run
//! use amqp_bus::{BusConfig, MessageBus};
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bus = MessageBus::connect(&BusConfig::from_env()?, |_| async { Ok(()) }).await?;
//!     let mut errors = bus.consume_errors(None).await?;
//!     while let Some(failed) = errors.next().await {
//!         println!("{}: {}", failed.data.err_type, failed.data.err_message);
//!         failed.replay_data(Some(5)).await?;
//!         failed.ack().await?;
//!     }
//!     Ok(())
//! }
//! ```
pub mod bus;
pub mod transport;

pub use bus::config::BusConfig;
pub use bus::consumer::{Subscription, SubscriptionHandle};
pub use bus::envelope::{Acker, Envelope, ErrorRecord};
pub use bus::error::{BusError, ErrorKind, Result};
pub use bus::pipeline::{EnvelopeStream, EnvelopeStreamExt, ValidateStreamExt};
pub use bus::publisher::Publisher;
pub use bus::schema::{
    from_fn, typed, FieldKind, ObjectSchema, Schema, SchemaConfig, SchemaRegistry, UnknownKeys, ValidationError,
};
pub use bus::topology::Topology;
pub use bus::MessageBus;
pub use transport::MemoryBroker;
