//! Error types for the socket pool
//!
//! Library code returns `Result<T, PoolError>`; `anyhow` appears only in
//! the binary's `main`.

use thiserror::Error;

/// Pool domain errors
///
/// Variants keep their context as fields, so callers match on them instead
/// of parsing messages.
///
/// Example log output:
/// ```text
/// PoolError::PoolFull { shards: 10, per_shard: 1000 }
/// → "connection pool full (10 shards x 1000 connections)"
/// ```
#[derive(Error, Debug)]
pub enum PoolError {
    /// Every shard is at capacity; the caller must reject the transport
    #[error("connection pool full ({shards} shards x {per_shard} connections)")]
    PoolFull { shards: usize, per_shard: usize },

    /// Pool was shut down and no longer accepts connections
    #[error("connection pool is shut down")]
    ShutDown,

    /// NATS publish failed for a specific subject
    #[error("NATS publish failed for subject '{subject}'")]
    NatsPublishFailed {
        subject: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Event or batch serialization failed
    #[error("serialization failed for {what}")]
    SerializationFailed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Prometheus recorder could not be installed
    #[error("metrics recorder install failed")]
    MetricsInstall(#[source] metrics_exporter_prometheus::BuildError),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    /// Static label for the `error_type` dimension of error counters.
    ///
    /// Used as the `error_type` label on `pool_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::PoolFull { .. } => "pool_full",
            Self::ShutDown => "shut_down",
            Self::NatsPublishFailed { .. } => "nats_publish",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::SerializationFailed { .. } => "serialization",
            Self::MetricsInstall(_) => "metrics_install",
            Self::Config(_) => "config",
        }
    }
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Failure reported by a transport when a frame cannot be handed off
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport is no longer open
    #[error("transport closed")]
    Closed,

    /// The transport accepted the call but the write failed
    #[error("send failed: {0}")]
    SendFailed(String),
}
