//! Pool events
//!
//! Everything the pool reports goes out on a `tokio::sync::broadcast`
//! channel. Emitting never blocks: with no subscriber the event is
//! discarded, and a slow subscriber observes `Lagged` rather than stalling
//! the pool.

pub mod serialize;

pub use serialize::{serialize_event, serialize_event_with, PoolEventEnvelope};

use crate::metrics::PoolMetricsSnapshot;
use crate::shard::{ConnectionId, Tags};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Event emitted by the pool
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A transport was registered
    Connection {
        connection_id: ConnectionId,
        client_id: String,
        shard: usize,
    },
    /// An inbound application message
    Message {
        connection_id: ConnectionId,
        message: Arc<Value>,
    },
    /// A connection left the pool for good
    Close {
        connection_id: ConnectionId,
        client_id: String,
        code: u16,
        reason: String,
        reconnect_attempts: u32,
    },
    /// A non-fatal error (malformed message, transport error)
    Error {
        connection_id: Option<ConnectionId>,
        error: String,
    },
    /// The external layer should dial a replacement for `client_id`
    ReconnectAttempt {
        connection_id: ConnectionId,
        client_id: String,
        tags: Tags,
        attempt: u32,
        delay: Duration,
    },
    /// An idle sweep removed connections
    Cleanup { removed: usize },
    /// Heap usage crossed the threshold during a sweep
    Gc { heap_before: u64 },
    /// Periodic metrics snapshot
    Metrics(Arc<PoolMetricsSnapshot>),
    /// The pool shut down
    Shutdown,
}

impl PoolEvent {
    /// Event name as seen by subscribers and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Message { .. } => "message",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::ReconnectAttempt { .. } => "reconnect_attempt",
            Self::Cleanup { .. } => "cleanup",
            Self::Gc { .. } => "gc",
            Self::Metrics(_) => "metrics",
            Self::Shutdown => "shutdown",
        }
    }

    /// Connection the event concerns, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::Connection { connection_id, .. }
            | Self::Message { connection_id, .. }
            | Self::Close { connection_id, .. }
            | Self::ReconnectAttempt { connection_id, .. } => Some(*connection_id),
            Self::Error { connection_id, .. } => *connection_id,
            _ => None,
        }
    }
}

/// Fan-out of pool events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: PoolEvent) {
        // Err only means nobody is subscribed
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
