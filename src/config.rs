//! Pool and host configuration
//!
//! `PoolConfig` carries every tunable of the connection pool and is loaded
//! from `POOL_*` environment variables through the `config` crate.
//! `HostConfig` covers the process around the pool (ports, NATS, logging).

use crate::error::PoolError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// What to do when a connection's pending queue is at `max_queue_depth`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// Evict the oldest message of the least urgent non-empty tier, or refuse
    /// the new message when it is less urgent than everything queued
    ShedLowestPriority,
    /// Refuse the new message
    Reject,
}

/// Connection pool configuration
///
/// Every field has a default; durations are expressed in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of registry shards
    pub shards: usize,
    /// Capacity of each shard
    pub max_connections_per_shard: usize,
    /// Maximum messages per outbound batch frame
    pub batch_size: usize,
    /// Dispatcher tick period
    pub batch_interval_ms: u64,
    /// Number of priority tiers (0 is the most urgent)
    pub priority_levels: u8,
    /// Priority used when the caller gives none (defaults to the middle tier)
    pub default_priority: Option<u8>,
    /// Whether transport close events schedule reconnect attempts
    pub reconnect: bool,
    /// Base backoff delay
    pub reconnect_interval_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Reconnect attempts before an entry is finalized
    pub max_reconnect_attempts: u32,
    /// Send attempts before a pending message is dropped
    pub max_delivery_attempts: u32,
    /// Pending messages allowed per connection
    pub max_queue_depth: usize,
    /// Policy applied when a queue is full
    pub queue_overflow: QueueOverflow,
    /// Metrics snapshot period
    pub metrics_interval_ms: u64,
    /// Idle reaper / memory sweep period
    pub gc_interval_ms: u64,
    /// Inactivity after which a connection is reaped
    pub connection_timeout_ms: u64,
    /// Keepalive ping period
    pub ping_interval_ms: u64,
    /// Heap usage above which a sweep emits a memory-pressure hint
    pub memory_threshold_bytes: u64,
    /// Capacity of the pool event channel
    pub event_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shards: 10,
            max_connections_per_shard: 1000,
            batch_size: 50,
            batch_interval_ms: 10,
            priority_levels: 3,
            default_priority: None,
            reconnect: true,
            reconnect_interval_ms: 1000,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 5,
            max_delivery_attempts: 3,
            max_queue_depth: 10_000,
            queue_overflow: QueueOverflow::ShedLowestPriority,
            metrics_interval_ms: 5000,
            gc_interval_ms: 30_000,
            connection_timeout_ms: 300_000,
            ping_interval_ms: 30_000,
            memory_threshold_bytes: 512 * 1024 * 1024,
            event_buffer: 1024,
        }
    }
}

impl PoolConfig {
    /// Load from `POOL_*` environment variables (and `.env`), falling back
    /// to defaults for anything unset
    pub fn from_env() -> Result<Self, PoolError> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("POOL").try_parsing(true))
            .build()?;

        Self::from_settings(settings)
    }

    /// Deserialize from an already-built `config::Config` and validate
    pub fn from_settings(settings: config::Config) -> Result<Self, PoolError> {
        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<(), PoolError> {
        let non_zero = [
            ("shards", self.shards as u64),
            ("max_connections_per_shard", self.max_connections_per_shard as u64),
            ("batch_size", self.batch_size as u64),
            ("batch_interval_ms", self.batch_interval_ms),
            ("priority_levels", u64::from(self.priority_levels)),
            ("max_delivery_attempts", u64::from(self.max_delivery_attempts)),
            ("max_queue_depth", self.max_queue_depth as u64),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("gc_interval_ms", self.gc_interval_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("event_buffer", self.event_buffer as u64),
        ];

        for (name, value) in non_zero {
            if value == 0 {
                return Err(PoolError::Config(format!("{name} must be greater than 0")));
            }
        }

        if let Some(priority) = self.default_priority {
            if priority >= self.priority_levels {
                return Err(PoolError::Config(format!(
                    "default_priority {priority} is outside 0..{}",
                    self.priority_levels
                )));
            }
        }

        Ok(())
    }

    /// Total connections the pool can hold
    pub fn capacity(&self) -> usize {
        self.shards.saturating_mul(self.max_connections_per_shard)
    }

    /// Priority applied when a caller passes none
    pub fn default_priority(&self) -> u8 {
        self.default_priority
            .unwrap_or(self.priority_levels / 2)
            .min(self.priority_levels.saturating_sub(1))
    }

    /// Clamp a caller priority into the configured tiers
    pub fn effective_priority(&self, priority: Option<u8>) -> u8 {
        priority
            .unwrap_or_else(|| self.default_priority())
            .min(self.priority_levels.saturating_sub(1))
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Process-level configuration for the host binary
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Pool ID for this process, used in NATS envelopes and health output
    pub pool_id: u64,

    /// WebSocket listen port
    pub ws_port: u16,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl HostConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, PoolError> {
        dotenvy::dotenv().ok();

        let pool_id = env::var("POOL_ID")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| PoolError::Config(format!("POOL_ID must be a valid number: {e}")))?;

        let ws_port = env::var("WS_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| PoolError::Config(format!("WS_PORT must be a valid port number: {e}")))?;

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT"))
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| PoolError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let nats_url = env::var("NATS_URL").ok();

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool_id,
            ws_port,
            http_port,
            nats_url,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity(), 10_000);
        assert_eq!(config.default_priority(), 1);
        assert_eq!(config.max_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn zero_shards_rejected() {
        let config = PoolConfig {
            shards: 0,
            ..PoolConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shards"));
    }

    #[test]
    fn default_priority_must_fit_levels() {
        let config = PoolConfig {
            priority_levels: 3,
            default_priority: Some(3),
            ..PoolConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn priority_is_clamped_to_last_tier() {
        let config = PoolConfig::default();
        assert_eq!(config.effective_priority(Some(0)), 0);
        assert_eq!(config.effective_priority(Some(200)), 2);
        assert_eq!(config.effective_priority(None), 1);
    }

    #[test]
    fn settings_override_defaults() {
        let settings = config::Config::builder()
            .set_override("shards", 2)
            .unwrap()
            .set_override("max_connections_per_shard", 1)
            .unwrap()
            .set_override("queue_overflow", "reject")
            .unwrap()
            .build()
            .unwrap();

        let config = PoolConfig::from_settings(settings).unwrap();
        assert_eq!(config.shards, 2);
        assert_eq!(config.max_connections_per_shard, 1);
        assert_eq!(config.queue_overflow, QueueOverflow::Reject);
        // Untouched fields keep their defaults
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn invalid_settings_surface_as_config_error() {
        let settings = config::Config::builder()
            .set_override("batch_size", 0)
            .unwrap()
            .build()
            .unwrap();

        let err = PoolConfig::from_settings(settings).unwrap_err();
        assert_eq!(err.error_type_label(), "config");
    }
}
