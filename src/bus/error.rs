//! 消息总线错误分类 / Message bus error taxonomy
//!
//! 所有错误都是封闭的带标签变体，错误记录中的 `errType` 直接来自 [`ErrorKind`]。
//! Every failure is a closed, tagged variant; the `errType` carried by an
//! error record is derived from [`ErrorKind`], never from a type name.

use serde::{Deserialize, Serialize};

use super::schema::ValidationError;

pub type Result<T, E = BusError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable or handshake failure. Fatal at startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// Exchange, queue or binding assertion rejected by the broker. Fatal at startup.
    #[error("topology error: {0}")]
    Topology(String),

    /// Runtime channel failure (publish, consume or ack I/O).
    #[error("channel error: {0}")]
    Channel(String),

    /// Payload could not be encoded for publish or a body could not be decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Double acknowledgment or acknowledgment on a closed channel.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Application-level processing failure forwarded to the error queue.
    #[error("processing error: {0}")]
    Processing(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::Connection(_) => ErrorKind::Connection,
            BusError::Topology(_) => ErrorKind::Topology,
            BusError::Channel(_) => ErrorKind::Channel,
            BusError::Serialization(_) => ErrorKind::Serialization,
            BusError::Validation(_) => ErrorKind::Validation,
            BusError::Protocol(_) => ErrorKind::Protocol,
            BusError::Processing(_) => ErrorKind::Processing,
            BusError::Config(_) => ErrorKind::Config,
        }
    }

    /// 错误消息正文（不含类型前缀）
    ///
    /// The error message without its kind prefix, as stored in `errMessage`.
    pub fn message(&self) -> String {
        match self {
            BusError::Connection(m)
            | BusError::Topology(m)
            | BusError::Channel(m)
            | BusError::Serialization(m)
            | BusError::Protocol(m)
            | BusError::Processing(m)
            | BusError::Config(m) => m.clone(),
            BusError::Validation(e) => e.to_string(),
        }
    }

    /// Startup errors leave nothing safe to run; callers abort on them.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Topology | ErrorKind::Config)
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(err.to_string())
    }
}

/// 错误类型标签 / Error type tag
///
/// Serialized as the tag string and used as the routing key on the error exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ConnectionError")]
    Connection,
    #[serde(rename = "TopologyError")]
    Topology,
    #[serde(rename = "ChannelError")]
    Channel,
    #[serde(rename = "SerializationError")]
    Serialization,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "ProtocolViolation")]
    Protocol,
    #[serde(rename = "ProcessingError")]
    Processing,
    #[serde(rename = "ConfigError")]
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Topology => "TopologyError",
            ErrorKind::Channel => "ChannelError",
            ErrorKind::Serialization => "SerializationError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Protocol => "ProtocolViolation",
            ErrorKind::Processing => "ProcessingError",
            ErrorKind::Config => "ConfigError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
