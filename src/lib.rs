//! Arrakis Socket Pool
//!
//! Sharded pool of real-time client connections. The pool is handed
//! already-open transports and takes care of:
//! - bounded sharding with O(1) lookup by connection id
//! - per-connection priority queues drained into batch frames
//! - reconnect bookkeeping with exponential backoff
//! - idle reaping and memory pressure checks
//! - counters and latency percentiles, mirrored to Prometheus
//!
//! The binary adds a WebSocket accept layer, health endpoints and a NATS
//! event sink around it.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod pool;
pub mod reaper;
pub mod reconnect;
pub mod shard;
pub mod transport;
pub mod ws;

pub use crate::config::{HostConfig, PoolConfig, QueueOverflow};
pub use crate::error::{PoolError, TransportError};
pub use crate::events::{EventBus, PoolEvent};
pub use crate::metrics::{LatencySnapshot, PoolMetricsSnapshot};
pub use crate::pool::ConnectionPool;
pub use crate::reaper::{HeapProbe, MemoryPressureHook};
pub use crate::shard::{ConnectionId, ConnectionMetadata, ConnectionState, Tags};
pub use crate::transport::{close_code, Frame, Transport, TransportEvent};
