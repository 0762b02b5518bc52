//! Pool metrics
//!
//! `PoolMetrics` keeps the in-process counters and latency window behind
//! `metrics_snapshot()`. Every update is mirrored into the `metrics` facade
//! so a Prometheus recorder, when installed by the host, exports the same
//! series; without a recorder those calls are no-ops.

mod latency;

pub use latency::{LatencySnapshot, LatencyWindow, EMA_ALPHA, MAX_SAMPLES};

use crate::error::PoolError;

use ::metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Point-in-time view of the pool, as emitted on the `metrics` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    pub connection_count: usize,
    pub active_connections: usize,
    pub shard_sizes: Vec<usize>,
    pub pending_messages: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub batches_sent: u64,
    pub messages_dropped: u64,
    pub errors: u64,
    pub reconnect_attempts: u64,
    pub latency: LatencySnapshot,
    pub uptime_ms: u64,
    pub heap_used_bytes: Option<u64>,
    pub timestamp: u64,
}

/// Running counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub batches_sent: u64,
    pub messages_dropped: u64,
    pub errors: u64,
    pub reconnect_attempts: u64,
}

/// Counters and latency updated inline by the pool components
#[derive(Debug, Default)]
pub struct PoolMetrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    batches_sent: AtomicU64,
    messages_dropped: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    latency: Mutex<LatencyWindow>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection joining a shard
    pub fn record_connection_opened(&self, shard: usize) {
        counter!("pool_connections_opened_total", "shard" => shard.to_string()).increment(1);
    }

    /// Record a connection leaving the pool
    pub fn record_connection_closed(&self, reason: &'static str) {
        counter!("pool_connections_closed_total", "reason" => reason).increment(1);
    }

    /// Record an inbound application message
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        counter!("pool_messages_received_total").increment(1);
    }

    /// Record a delivered batch of `count` messages
    pub fn record_batch_sent(&self, count: usize, oldest_wait: Duration) {
        self.messages_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        counter!("pool_messages_sent_total").increment(count as u64);
        counter!("pool_batches_sent_total").increment(1);
        histogram!("pool_queue_wait_seconds").record(oldest_wait.as_secs_f64());
    }

    /// Record messages that left a queue without being delivered
    pub fn record_dropped(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.messages_dropped.fetch_add(count as u64, Ordering::Relaxed);
        counter!("pool_messages_dropped_total").increment(count as u64);
    }

    /// Record an error; `error_type` becomes the Prometheus label
    pub fn record_error(&self, error_type: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!("pool_errors_total", "error_type" => error_type).increment(1);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        counter!("pool_reconnect_attempts_total").increment(1);
    }

    /// Feed the latency window (processing time or ping round trip)
    pub fn record_latency(&self, sample: Duration) {
        let ms = sample.as_micros() as f64 / 1000.0;
        self.latency.lock().record(ms);
        histogram!("pool_latency_seconds").record(sample.as_secs_f64());
    }

    /// Sort the latency window once and cache its p95
    pub fn recompute_percentiles(&self) -> f64 {
        self.latency.lock().recompute_p95()
    }

    /// Export pool-level gauges
    pub fn set_gauges(&self, connections: usize, active: usize, pending: usize, heap: Option<u64>) {
        gauge!("pool_connections").set(connections as f64);
        gauge!("pool_connections_active").set(active as f64);
        gauge!("pool_pending_messages").set(pending as f64);
        if let Some(heap) = heap {
            gauge!("pool_heap_bytes").set(heap as f64);
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    pub fn latency(&self) -> LatencySnapshot {
        self.latency.lock().snapshot()
    }
}

/// Prometheus exporter installed by the host process
#[derive(Clone)]
pub struct PrometheusExporter {
    handle: Arc<PrometheusHandle>,
}

impl PrometheusExporter {
    /// Install the global recorder and register metric descriptions
    pub fn install() -> Result<Self, PoolError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(PoolError::MetricsInstall)?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "pool_connections_opened_total",
            Unit::Count,
            "Connections registered, by shard"
        );
        describe_counter!(
            "pool_connections_closed_total",
            Unit::Count,
            "Connections removed, by reason"
        );
        describe_counter!(
            "pool_messages_received_total",
            Unit::Count,
            "Inbound application messages"
        );
        describe_counter!(
            "pool_messages_sent_total",
            Unit::Count,
            "Messages delivered inside batches"
        );
        describe_counter!("pool_batches_sent_total", Unit::Count, "Batch frames sent");
        describe_counter!(
            "pool_messages_dropped_total",
            Unit::Count,
            "Messages discarded after retries, overflow or close"
        );
        describe_counter!("pool_errors_total", Unit::Count, "Pool errors, by type");
        describe_counter!(
            "pool_reconnect_attempts_total",
            Unit::Count,
            "Reconnect attempts emitted"
        );

        describe_histogram!(
            "pool_queue_wait_seconds",
            Unit::Seconds,
            "Age of the oldest message in each sent batch"
        );
        describe_histogram!(
            "pool_latency_seconds",
            Unit::Seconds,
            "Inbound processing time and ping round trips"
        );

        describe_gauge!("pool_connections", Unit::Count, "Registered connections");
        describe_gauge!("pool_connections_active", Unit::Count, "Active connections");
        describe_gauge!("pool_pending_messages", Unit::Count, "Queued outbound messages");
        describe_gauge!("pool_heap_bytes", Unit::Bytes, "Process memory at last sample");
        describe_gauge!(
            "pool_nats_connected",
            Unit::Count,
            "NATS connection status (1=connected, 0=disconnected)"
        );
    }

    /// Set NATS connection status
    pub fn set_nats_connected(&self, connected: bool) {
        gauge!("pool_nats_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
