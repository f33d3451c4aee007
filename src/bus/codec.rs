//! 消息体编解码 / Message body encoding
//!
//! Bodies are UTF-8 JSON text. Publishing encodes before touching the network;
//! consuming decodes into an untyped `serde_json::Value` tree.

use serde::Serialize;
use serde_json::Value;

use super::error::{BusError, Result};

pub const CONTENT_TYPE: &str = "application/json";

/// 将负载序列化为消息体
///
/// Serialize a payload into a message body.
pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| BusError::Serialization(format!("cannot encode payload: {}", e)))
}

/// 将消息体解析为 JSON 树
///
/// Parse a message body into a JSON tree.
pub fn decode(body: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(body)
        .map_err(|e| BusError::Serialization(format!("body is not valid UTF-8: {}", e)))?;
    serde_json::from_str(text).map_err(|e| BusError::Serialization(format!("body is not valid JSON: {}", e)))
}

/// Result of decoding a delivery body. Undecodable bodies keep their text so
/// later stages can report and dead-letter them.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    Json(Value),
    Invalid { text: String, error: BusError },
}

impl DecodedBody {
    pub fn from_bytes(body: &[u8]) -> Self {
        match decode(body) {
            Ok(value) => DecodedBody::Json(value),
            Err(error) => DecodedBody::Invalid { text: String::from_utf8_lossy(body).into_owned(), error },
        }
    }
}

/// Shorten a body for log output.
pub fn preview(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= limit {
        text.into_owned()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn encodes_utf8_json() {
        let body = encode(&json!({"id": 1, "name": "épée"})).unwrap();
        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.contains("épée"));
        assert_eq!(decode(&body).unwrap(), json!({"id": 1, "name": "épée"}));
    }

    #[test]
    fn rejects_non_string_map_keys() {
        let mut map = HashMap::new();
        map.insert(vec![1u8, 2], "value");
        let err = encode(&map).unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn keeps_text_of_invalid_bodies() {
        match DecodedBody::from_bytes(b"{not json") {
            DecodedBody::Invalid { text, error } => {
                assert_eq!(text, "{not json");
                assert!(matches!(error, BusError::Serialization(_)));
            }
            other => panic!("expected invalid body, got {:?}", other),
        }
        assert!(matches!(DecodedBody::from_bytes(&[0xff, 0xfe]), DecodedBody::Invalid { .. }));
    }

    #[test]
    fn preview_truncates() {
        assert_eq!(preview(b"short", 10), "short");
        assert_eq!(preview(b"0123456789abc", 10), "0123456789...");
    }
}
