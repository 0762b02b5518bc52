//! Per-connection state tracking
//!
//! Metadata for one connection plus the lifecycle it moves through.

use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Application-defined labels attached to a connection
pub type Tags = HashMap<String, String>;

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for ConnectionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a connection
///
/// `Active` → `Closing` → `ReconnectPending` | `Finalized`. There is no
/// paused state; backpressure only shows as queue growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered and exchanging traffic
    Active,
    /// Close observed, reconnect eligibility being decided
    Closing,
    /// Waiting for the external layer to dial a replacement
    ReconnectPending,
    /// Terminal; the entry is being removed
    Finalized,
}

impl ConnectionState {
    /// Returns true if the connection accepts outbound traffic
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    /// Returns true once the connection can never become active again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Finalized)
    }
}

/// Metadata for a single connection
///
/// Owned by exactly one shard; callers only ever see clones.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: ConnectionId,
    pub client_id: String,
    pub shard: usize,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
    pub reconnect_attempts: u32,
    pub is_active: bool,
    pub state: ConnectionState,
    pub tags: Tags,
}

impl ConnectionMetadata {
    pub fn new(id: ConnectionId, client_id: String, tags: Tags) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_id,
            shard: 0,
            created_at: now,
            last_activity: now,
            messages_sent: 0,
            messages_received: 0,
            error_count: 0,
            reconnect_attempts: 0,
            is_active: true,
            state: ConnectionState::Active,
            tags,
        }
    }

    /// Move to a new lifecycle state, keeping `is_active` in sync
    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.is_active = state.is_active();
    }

    /// Record inbound activity
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the connection has been silent longer than `timeout`
    pub fn is_idle(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// A registered connection: metadata plus the transport handle
#[derive(Clone)]
pub struct ConnectionEntry {
    pub metadata: ConnectionMetadata,
    pub transport: Arc<dyn Transport>,
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("metadata", &self.metadata)
            .field("transport_open", &self.transport.is_open())
            .finish()
    }
}
