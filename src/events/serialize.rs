//! Event serialization for the message broker
//!
//! Converts pool events to JSON envelopes for NATS publishing.

use crate::dispatch::batch::epoch_millis;
use crate::events::PoolEvent;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope published for forwarded pool events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub pool_id: u64,
    pub timestamp: u64,
    pub connection_id: Option<String>,
    pub client_id: Option<String>,
    pub data: serde_json::Value,
}

/// Serialize a pool event with a fresh id and the current time
///
/// Returns None for events we don't forward (messages, errors)
pub fn serialize_event(event: &PoolEvent, pool_id: u64) -> Option<PoolEventEnvelope> {
    serialize_event_with(event, pool_id, Uuid::new_v4(), epoch_millis())
}

/// Serialize a pool event with caller-supplied id and timestamp
pub fn serialize_event_with(
    event: &PoolEvent,
    pool_id: u64,
    event_id: Uuid,
    timestamp: u64,
) -> Option<PoolEventEnvelope> {
    let envelope = |event_type: &str,
                    connection_id: Option<String>,
                    client_id: Option<String>,
                    data: serde_json::Value| PoolEventEnvelope {
        event_id: event_id.to_string(),
        event_type: event_type.to_string(),
        pool_id,
        timestamp,
        connection_id,
        client_id,
        data,
    };

    match event {
        PoolEvent::Connection {
            connection_id,
            client_id,
            shard,
        } => Some(envelope(
            "connection.open",
            Some(connection_id.to_string()),
            Some(client_id.clone()),
            serde_json::json!({ "shard": shard }),
        )),

        PoolEvent::Close {
            connection_id,
            client_id,
            code,
            reason,
            reconnect_attempts,
        } => Some(envelope(
            "connection.close",
            Some(connection_id.to_string()),
            Some(client_id.clone()),
            serde_json::json!({
                "code": code,
                "reason": reason,
                "reconnect_attempts": reconnect_attempts,
            }),
        )),

        PoolEvent::ReconnectAttempt {
            connection_id,
            client_id,
            tags,
            attempt,
            delay,
        } => Some(envelope(
            "reconnect.attempt",
            Some(connection_id.to_string()),
            Some(client_id.clone()),
            serde_json::json!({
                "attempt": attempt,
                "delay_ms": delay.as_millis() as u64,
                "tags": tags,
            }),
        )),

        PoolEvent::Cleanup { removed } => Some(envelope(
            "maintenance.cleanup",
            None,
            None,
            serde_json::json!({ "removed": removed }),
        )),

        PoolEvent::Gc { heap_before } => Some(envelope(
            "maintenance.gc",
            None,
            None,
            serde_json::json!({ "heap_before": heap_before }),
        )),

        PoolEvent::Metrics(snapshot) => Some(envelope(
            "pool.metrics",
            None,
            None,
            serde_json::to_value(snapshot.as_ref()).ok()?,
        )),

        PoolEvent::Shutdown => Some(envelope(
            "pool.shutdown",
            None,
            None,
            serde_json::Value::Null,
        )),

        // Per-message traffic stays in process
        PoolEvent::Message { .. } | PoolEvent::Error { .. } => None,
    }
}
