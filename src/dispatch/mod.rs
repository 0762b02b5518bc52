//! Outbound batching
//!
//! Messages are never written straight to a transport. They are queued per
//! connection and a dispatcher tick packs up to `batch_size` of them into a
//! single `batch` frame per connection.

pub mod batch;
pub mod queue;

use crate::pool::PoolShared;
use crate::transport::Frame;

use batch::{encode_batch, encode_ping_payload, epoch_millis};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What one dispatcher tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Batch frames handed to transports
    pub batches: usize,
    /// Messages inside those frames
    pub messages: usize,
    /// Sends that failed and were requeued
    pub failed: usize,
    /// Messages discarded after exhausting their delivery attempts
    pub dropped: usize,
}

/// Drain every active connection's queue, one batch each
///
/// Shards are walked one at a time and only a snapshot of the transport
/// handles is taken under the shard lock, so sends never hold it.
pub(crate) fn dispatch_tick(shared: &PoolShared) -> DispatchStats {
    let mut stats = DispatchStats::default();
    let batch_size = shared.config.batch_size;
    let max_attempts = shared.config.max_delivery_attempts;

    for shard in 0..shared.registry.shard_count() {
        let targets = shared.registry.scan_shard(shard, |entry| {
            entry
                .metadata
                .is_active
                .then(|| (entry.metadata.id, Arc::clone(&entry.transport)))
        });

        for (id, transport) in targets {
            if !transport.is_open() {
                continue;
            }

            let batch = shared.queues.take_batch(&id, batch_size);
            if batch.is_empty() {
                continue;
            }

            let count = batch.len();
            let oldest_wait = batch
                .iter()
                .map(|m| m.enqueued_at)
                .min()
                .map(|t| Instant::now().saturating_duration_since(t))
                .unwrap_or_default();

            let frame = match encode_batch(&batch, epoch_millis()) {
                Ok(text) => text,
                Err(e) => {
                    // Values came from serde_json, so this is not expected
                    warn!(connection_id = %id, error = %e, "Failed to encode batch");
                    shared.metrics.record_error(e.error_type_label());
                    shared.metrics.record_dropped(count);
                    stats.dropped += count;
                    continue;
                }
            };

            match transport.send(Frame::Text(frame)) {
                Ok(()) => {
                    shared
                        .registry
                        .update(&id, |meta| meta.messages_sent += count as u64);
                    shared.metrics.record_batch_sent(count, oldest_wait);
                    stats.batches += 1;
                    stats.messages += count;
                }
                Err(e) => {
                    let outcome = shared.queues.requeue_failed(&id, batch, max_attempts);
                    shared.registry.update(&id, |meta| meta.error_count += 1);
                    shared.metrics.record_error("send_failed");
                    shared.metrics.record_dropped(outcome.dropped);
                    stats.failed += 1;
                    stats.dropped += outcome.dropped;

                    warn!(
                        connection_id = %id,
                        error = %e,
                        requeued = outcome.requeued,
                        dropped = outcome.dropped,
                        "Batch send failed"
                    );
                }
            }
        }
    }

    if stats.batches > 0 || stats.failed > 0 {
        debug!(
            batches = stats.batches,
            messages = stats.messages,
            failed = stats.failed,
            "Dispatch tick"
        );
    }

    stats
}

/// Ping every active connection; the payload carries the send time so the
/// pong yields a round-trip sample
pub(crate) fn send_keepalives(shared: &PoolShared) -> usize {
    let payload = encode_ping_payload(shared.uptime_ms());

    let targets = shared.registry.scan(|entry| {
        entry
            .metadata
            .is_active
            .then(|| (entry.metadata.id, Arc::clone(&entry.transport)))
    });

    let mut sent = 0;
    for (id, transport) in targets {
        if !transport.is_open() {
            continue;
        }
        match transport.send(Frame::Ping(payload.clone())) {
            Ok(()) => sent += 1,
            Err(e) => debug!(connection_id = %id, error = %e, "Keepalive ping failed"),
        }
    }
    sent
}
