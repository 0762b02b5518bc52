//! Shard management module
//!
//! Connection registry partitioned into bounded shards.

mod registry;
mod state;

pub use registry::ShardRegistry;
pub use state::{ConnectionEntry, ConnectionId, ConnectionMetadata, ConnectionState, Tags};
