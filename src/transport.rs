//! Transport contract between the pool and the accept layer
//!
//! The pool never owns sockets. It is handed an already-open duplex
//! transport and observes it through [`TransportEvent`]s pushed by whoever
//! reads the socket.

use crate::error::TransportError;

/// Close codes used by the pool
pub mod close_code {
    /// Normal closure (explicit close, superseded entry)
    pub const NORMAL: u16 = 1000;
    /// Server going away (pool shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure (reconnect budget exhausted)
    pub const ABNORMAL: u16 = 1006;
    /// Try again later (pool full)
    pub const TRY_AGAIN_LATER: u16 = 1013;
    /// Idle timeout (application range)
    pub const IDLE_TIMEOUT: u16 = 4000;
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text payload (batches and control replies)
    Text(String),
    /// Keepalive ping
    Ping(Vec<u8>),
    /// Reply to a peer ping
    Pong(Vec<u8>),
}

/// Inbound transport event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Application message from the peer
    Message(String),
    /// Peer ping; answered immediately with a pong
    Ping(Vec<u8>),
    /// Peer answered one of our pings
    Pong(Vec<u8>),
    /// Non-fatal transport error
    Error(String),
    /// Transport closed
    Close { code: u16, reason: String },
}

/// An already-open duplex transport
///
/// Implementations must not block: `send` hands the frame off (usually to
/// a writer task) and reports only failures known at call time.
pub trait Transport: Send + Sync + 'static {
    /// Hand a frame to the transport
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Request the transport to close
    fn close(&self, code: u16, reason: &str);

    /// Whether the transport still accepts frames
    fn is_open(&self) -> bool;
}
