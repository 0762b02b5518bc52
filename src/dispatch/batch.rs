//! Batch frame encoding and protocol-control helpers

use crate::dispatch::queue::PendingMessage;
use crate::error::PoolError;

use serde::Serialize;
use serde_json::Value;

/// One outbound frame bundling several messages for a connection
#[derive(Debug, Serialize)]
pub struct BatchFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub messages: Vec<&'a Value>,
    pub timestamp: u64,
    pub count: usize,
}

impl<'a> BatchFrame<'a> {
    pub fn new(batch: &'a [PendingMessage], timestamp: u64) -> Self {
        Self {
            kind: "batch",
            messages: batch.iter().map(|m| m.payload.as_ref()).collect(),
            timestamp,
            count: batch.len(),
        }
    }
}

/// Serialize a batch into the text frame sent to the peer
pub fn encode_batch(batch: &[PendingMessage], timestamp: u64) -> Result<String, PoolError> {
    serde_json::to_string(&BatchFrame::new(batch, timestamp))
        .map_err(|source| PoolError::SerializationFailed { what: "batch", source })
}

/// Whether an inbound application message is a keepalive ping
pub fn is_ping(message: &Value) -> bool {
    message.get("type").and_then(Value::as_str) == Some("ping")
}

/// Immediate reply to an application-level ping
pub fn pong_frame(timestamp: u64) -> String {
    serde_json::json!({ "type": "pong", "timestamp": timestamp }).to_string()
}

/// Wall-clock milliseconds since the Unix epoch
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Transport ping payload: pool uptime in ms when the ping left
pub fn encode_ping_payload(uptime_ms: u64) -> Vec<u8> {
    uptime_ms.to_be_bytes().to_vec()
}

/// Inverse of [`encode_ping_payload`]; `None` for pongs we did not originate
pub fn decode_ping_payload(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn batch_frame_shape() {
        let batch = vec![
            PendingMessage::new(Arc::new(json!({"type": "x"})), 0),
            PendingMessage::new(Arc::new(json!({"type": "y"})), 2),
        ];

        let frame: Value = serde_json::from_str(&encode_batch(&batch, 1_700_000_000_000).unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({
                "type": "batch",
                "messages": [{"type": "x"}, {"type": "y"}],
                "timestamp": 1_700_000_000_000_u64,
                "count": 2
            })
        );
    }

    #[test]
    fn detects_application_ping() {
        assert!(is_ping(&json!({"type": "ping"})));
        assert!(!is_ping(&json!({"type": "chat"})));
        assert!(!is_ping(&json!("ping")));
    }

    #[test]
    fn pong_frame_carries_timestamp() {
        let pong: Value = serde_json::from_str(&pong_frame(42)).unwrap();
        assert_eq!(pong, json!({"type": "pong", "timestamp": 42}));
    }

    #[test]
    fn foreign_pong_payload_is_ignored() {
        assert_eq!(decode_ping_payload(&encode_ping_payload(1234)), Some(1234));
        assert_eq!(decode_ping_payload(b"hello"), None);
    }
}
