//! Connection pool facade
//!
//! Ties the registry, outbound queues, reconnect supervisor, reaper and
//! metrics together behind one cloneable handle.

use crate::config::PoolConfig;
use crate::dispatch::batch::{decode_ping_payload, epoch_millis, is_ping, pong_frame};
use crate::dispatch::queue::{OutboundQueues, PendingMessage, PushOutcome};
use crate::dispatch::{self, DispatchStats};
use crate::error::PoolError;
use crate::events::{EventBus, PoolEvent};
use crate::metrics::{PoolMetrics, PoolMetricsSnapshot};
use crate::reaper::{self, HeapProbe, MemoryManager, MemoryPressureHook, SweepReport};
use crate::reconnect::{self, BackoffPolicy, PendingReconnects};
use crate::shard::{ConnectionId, ConnectionMetadata, ConnectionState, ShardRegistry, Tags};
use crate::transport::{close_code, Frame, Transport, TransportEvent};

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// State shared by the facade, its timers and the reconnect supervisors
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) registry: ShardRegistry,
    pub(crate) queues: OutboundQueues,
    pub(crate) metrics: PoolMetrics,
    pub(crate) events: EventBus,
    pub(crate) reconnects: PendingReconnects,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) memory: MemoryManager,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
    shut_down: AtomicBool,
    timers_started: AtomicBool,
}

impl PoolShared {
    /// Remove a connection for good
    ///
    /// Closes the transport if still open, drops the queue and emits the
    /// terminal `close`. Only the first caller for an id gets `Some`.
    pub(crate) fn finalize(
        &self,
        id: &ConnectionId,
        code: u16,
        reason: &str,
        label: &'static str,
    ) -> Option<ConnectionMetadata> {
        let entry = self.registry.remove(id)?;
        let mut metadata = entry.metadata;
        metadata.set_state(ConnectionState::Finalized);

        if let Some(mut queue) = self.queues.remove(id) {
            self.metrics.record_dropped(queue.drain_all().len());
        }
        self.reconnects.forget(&metadata.client_id, id);

        if entry.transport.is_open() {
            entry.transport.close(code, reason);
        }
        self.metrics.record_connection_closed(label);

        info!(
            connection_id = %id,
            client_id = %metadata.client_id,
            shard = metadata.shard,
            code,
            reason,
            reconnect_attempts = metadata.reconnect_attempts,
            "Connection finalized"
        );

        self.events.emit(PoolEvent::Close {
            connection_id: *id,
            client_id: metadata.client_id.clone(),
            code,
            reason: reason.to_string(),
            reconnect_attempts: metadata.reconnect_attempts,
        });

        Some(metadata)
    }

    pub(crate) fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub(crate) fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    fn snapshot(&self) -> PoolMetricsSnapshot {
        let counters = self.metrics.counters();
        PoolMetricsSnapshot {
            connection_count: self.registry.len(),
            active_connections: self.registry.active_count(),
            shard_sizes: self.registry.shard_sizes(),
            pending_messages: self.queues.pending_total(),
            messages_sent: counters.messages_sent,
            messages_received: counters.messages_received,
            batches_sent: counters.batches_sent,
            messages_dropped: counters.messages_dropped,
            errors: counters.errors,
            reconnect_attempts: counters.reconnect_attempts,
            latency: self.metrics.latency(),
            uptime_ms: self.uptime_ms(),
            heap_used_bytes: self.memory.heap_used(),
            timestamp: epoch_millis(),
        }
    }
}

/// Sharded connection pool
///
/// Cloning is cheap; every clone drives the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Build a pool sampling `/proc/self/statm` with no pressure hook
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let memory = MemoryManager::from_config(&config);
        Self::build(config, memory)
    }

    /// Build a pool with a custom memory probe and pressure hook
    pub fn with_memory(
        config: PoolConfig,
        probe: Arc<dyn HeapProbe>,
        hook: Arc<dyn MemoryPressureHook>,
    ) -> Result<Self, PoolError> {
        let threshold = config.memory_threshold_bytes;
        Self::build(config, MemoryManager::new(probe, hook, threshold))
    }

    fn build(config: PoolConfig, memory: MemoryManager) -> Result<Self, PoolError> {
        config.validate()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = PoolShared {
            registry: ShardRegistry::new(config.shards, config.max_connections_per_shard),
            queues: OutboundQueues::new(
                config.priority_levels,
                config.max_queue_depth,
                config.queue_overflow,
            ),
            metrics: PoolMetrics::new(),
            events: EventBus::new(config.event_buffer),
            reconnects: PendingReconnects::new(),
            backoff: BackoffPolicy::from_config(&config),
            memory,
            started_at: Instant::now(),
            shutdown_tx,
            shut_down: AtomicBool::new(false),
            timers_started: AtomicBool::new(false),
            config,
        };

        info!(
            shards = shared.config.shards,
            max_per_shard = shared.config.max_connections_per_shard,
            capacity = shared.config.capacity(),
            "Connection pool created"
        );

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Start the dispatch, keepalive, metrics and reaper timers
    ///
    /// Must be called inside a tokio runtime. A second call is a no-op.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.shared.timers_started.swap(true, Ordering::AcqRel) {
            warn!("Pool timers already started");
            return Vec::new();
        }

        let config = &self.shared.config;
        vec![
            self.spawn_ticker("dispatch", config.batch_interval(), |shared| {
                dispatch::dispatch_tick(shared);
            }),
            self.spawn_ticker("keepalive", config.ping_interval(), |shared| {
                dispatch::send_keepalives(shared);
            }),
            self.spawn_ticker("metrics", config.metrics_interval(), |shared| {
                publish_metrics(shared);
            }),
            self.spawn_ticker("reaper", config.gc_interval(), |shared| {
                reaper::sweep(shared);
            }),
        ]
    }

    fn spawn_ticker<F>(&self, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(&PoolShared) + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = shared.shutdown_receiver();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => tick(&*shared),
                    _ = shutdown.recv() => {
                        debug!(timer = name, "Timer received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Register an already-open transport
    ///
    /// If `client_id` belongs to an entry waiting for a reconnect, that entry
    /// is retired and its pending messages move to the new connection.
    pub fn add_connection(
        &self,
        transport: Arc<dyn Transport>,
        client_id: impl Into<String>,
        tags: Tags,
    ) -> Result<ConnectionId, PoolError> {
        let shared = &self.shared;
        if shared.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }

        let client_id = client_id.into();
        let carried = self.retire_superseded(&client_id);

        let id = ConnectionId::new();
        let metadata = ConnectionMetadata::new(id, client_id.clone(), tags);
        let shard = match shared.registry.insert(metadata, transport) {
            Ok(shard) => shard,
            Err(e) => {
                shared.metrics.record_dropped(carried.len());
                shared.metrics.record_error(e.error_type_label());
                warn!(client_id = %client_id, error = %e, "Connection rejected");
                return Err(e);
            }
        };

        shared.queues.create(id);

        // A shutdown that drained the registry before this insert landed
        if shared.shut_down.load(Ordering::Acquire) {
            shared.queues.remove(&id);
            if let Some(entry) = shared.registry.remove(&id) {
                entry.transport.close(close_code::GOING_AWAY, "Server shutdown");
            }
            shared.metrics.record_dropped(carried.len());
            debug!(connection_id = %id, client_id = %client_id, "Connection raced shutdown");
            return Err(PoolError::ShutDown);
        }

        if !carried.is_empty() {
            let moved = carried.len();
            let lost = shared.queues.absorb(&id, carried);
            shared.metrics.record_dropped(lost);
            debug!(connection_id = %id, moved, lost, "Carried pending messages over");
        }

        shared.metrics.record_connection_opened(shard);
        info!(connection_id = %id, client_id = %client_id, shard, "Connection added");
        shared.events.emit(PoolEvent::Connection {
            connection_id: id,
            client_id,
            shard,
        });

        Ok(id)
    }

    fn retire_superseded(&self, client_id: &str) -> Vec<PendingMessage> {
        let shared = &self.shared;
        let Some(pending) = shared.reconnects.take(client_id) else {
            return Vec::new();
        };

        let carried = shared
            .queues
            .remove(&pending.connection_id)
            .map(|mut queue| queue.drain_all())
            .unwrap_or_default();

        shared.finalize(
            &pending.connection_id,
            close_code::NORMAL,
            "superseded by reconnect",
            "superseded",
        );
        carried
    }

    /// Feed an inbound transport event for a registered connection
    pub fn handle_transport_event(&self, id: &ConnectionId, event: TransportEvent) {
        let shared = &self.shared;
        match event {
            TransportEvent::Message(text) => self.handle_message(id, &text),

            TransportEvent::Ping(payload) => {
                let Some(transport) = shared.registry.transport(id) else {
                    return;
                };
                shared.registry.update(id, |meta| meta.touch());
                if let Err(e) = transport.send(Frame::Pong(payload)) {
                    debug!(connection_id = %id, error = %e, "Failed to answer ping");
                }
            }

            TransportEvent::Pong(payload) => {
                if shared.registry.update(id, |meta| meta.touch()).is_none() {
                    return;
                }
                if let Some(sent_at) = decode_ping_payload(&payload) {
                    let rtt = shared.uptime_ms().saturating_sub(sent_at);
                    shared.metrics.record_latency(Duration::from_millis(rtt));
                }
            }

            TransportEvent::Error(error) => {
                if shared
                    .registry
                    .update(id, |meta| meta.error_count += 1)
                    .is_none()
                {
                    return;
                }
                shared.metrics.record_error("transport");
                warn!(connection_id = %id, error = %error, "Transport error");
                shared.events.emit(PoolEvent::Error {
                    connection_id: Some(*id),
                    error,
                });
            }

            TransportEvent::Close { code, reason } => {
                reconnect::on_transport_close(shared, id, code, &reason);
            }
        }
    }

    fn handle_message(&self, id: &ConnectionId, text: &str) {
        let shared = &self.shared;
        let started = std::time::Instant::now();

        let message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                if shared
                    .registry
                    .update(id, |meta| meta.error_count += 1)
                    .is_none()
                {
                    return;
                }
                shared.metrics.record_error("malformed_message");
                debug!(connection_id = %id, error = %e, "Malformed inbound message");
                shared.events.emit(PoolEvent::Error {
                    connection_id: Some(*id),
                    error: format!("malformed message: {e}"),
                });
                return;
            }
        };

        let received = shared.registry.update(id, |meta| {
            meta.messages_received += 1;
            meta.touch();
        });
        if received.is_none() {
            debug!(connection_id = %id, "Message for unknown connection dropped");
            return;
        }
        shared.metrics.record_received();

        if is_ping(&message) {
            if let Some(transport) = shared.registry.transport(id) {
                if let Err(e) = transport.send(Frame::Text(pong_frame(epoch_millis()))) {
                    debug!(connection_id = %id, error = %e, "Failed to answer application ping");
                }
            }
        } else {
            shared.events.emit(PoolEvent::Message {
                connection_id: *id,
                message: Arc::new(message),
            });
        }

        shared.metrics.record_latency(started.elapsed());
    }

    /// Queue a message for one connection
    ///
    /// False for unknown ids and when the queue refused the message.
    pub fn queue_message(&self, id: &ConnectionId, message: Value, priority: Option<u8>) -> bool {
        let shared = &self.shared;
        let priority = shared.config.effective_priority(priority);
        let pending = PendingMessage::new(Arc::new(message), priority);

        match shared.queues.enqueue(id, pending) {
            Some(outcome) => self.count_push(id, outcome),
            None => false,
        }
    }

    /// Queue `message` for every active connection accepted by `filter`
    ///
    /// Returns the number of connections targeted.
    pub fn broadcast<F>(&self, message: Value, filter: F, priority: Option<u8>) -> usize
    where
        F: Fn(&ConnectionMetadata) -> bool,
    {
        let shared = &self.shared;
        let priority = shared.config.effective_priority(priority);
        let payload = Arc::new(message);

        let targets = shared.registry.scan(|entry| {
            (entry.metadata.is_active && filter(&entry.metadata)).then_some(entry.metadata.id)
        });

        let mut targeted = 0;
        for id in targets {
            let pending = PendingMessage::new(Arc::clone(&payload), priority);
            if let Some(outcome) = shared.queues.enqueue(&id, pending) {
                self.count_push(&id, outcome);
                targeted += 1;
            }
        }

        debug!(targeted, priority, "Broadcast queued");
        targeted
    }

    fn count_push(&self, id: &ConnectionId, outcome: PushOutcome) -> bool {
        match outcome {
            PushOutcome::Queued => true,
            PushOutcome::QueuedWithEviction => {
                self.shared.metrics.record_dropped(1);
                true
            }
            PushOutcome::Rejected => {
                self.shared.metrics.record_dropped(1);
                debug!(connection_id = %id, "Outbound queue full, message refused");
                false
            }
        }
    }

    /// Copy of a connection's metadata
    pub fn get_connection(&self, id: &ConnectionId) -> Option<ConnectionMetadata> {
        self.shared.registry.get(id)
    }

    /// Close and remove a connection; false if it was not registered
    pub fn close_connection(
        &self,
        id: &ConnectionId,
        code: Option<u16>,
        reason: Option<&str>,
    ) -> bool {
        self.shared
            .finalize(
                id,
                code.unwrap_or(close_code::NORMAL),
                reason.unwrap_or(""),
                "explicit",
            )
            .is_some()
    }

    pub fn metrics_snapshot(&self) -> PoolMetricsSnapshot {
        self.shared.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.registry.capacity()
    }

    /// Pending messages for one connection
    pub fn queue_depth(&self, id: &ConnectionId) -> usize {
        self.shared.queues.depth(id)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Stop timers and supervisors, force-close everything, emit `shutdown`
    ///
    /// Pending messages are discarded. Safe to call more than once.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        info!(connections = shared.registry.len(), "Shutting down connection pool");

        // Err only means no timer or supervisor is listening
        let _ = shared.shutdown_tx.send(());

        let entries = shared.registry.drain();
        for entry in &entries {
            if entry.transport.is_open() {
                entry.transport.close(close_code::GOING_AWAY, "Server shutdown");
            }
            shared.metrics.record_connection_closed("shutdown");
        }
        shared.queues.clear();
        shared.reconnects.clear();

        info!(closed = entries.len(), "Connection pool shut down");
        shared.events.emit(PoolEvent::Shutdown);
    }

    /// Run one dispatcher tick now
    pub fn dispatch_now(&self) -> DispatchStats {
        dispatch::dispatch_tick(&self.shared)
    }

    /// Run one reaper sweep now
    pub fn sweep_now(&self) -> SweepReport {
        reaper::sweep(&self.shared)
    }

    /// Recompute percentiles and emit a `metrics` event now
    pub fn publish_metrics_now(&self) -> PoolMetricsSnapshot {
        publish_metrics(&self.shared)
    }

    /// Ping every active connection now
    pub fn send_keepalives_now(&self) -> usize {
        dispatch::send_keepalives(&self.shared)
    }

    /// Resolves once `shutdown` has been called
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.shutdown_receiver();
        let already = self.is_shut_down();
        async move {
            if !already {
                let _ = rx.recv().await;
            }
        }
    }
}

fn publish_metrics(shared: &PoolShared) -> PoolMetricsSnapshot {
    shared.metrics.recompute_percentiles();
    let snapshot = shared.snapshot();

    shared.metrics.set_gauges(
        snapshot.connection_count,
        snapshot.active_connections,
        snapshot.pending_messages,
        snapshot.heap_used_bytes,
    );
    debug!(
        connections = snapshot.connection_count,
        pending = snapshot.pending_messages,
        p95_ms = snapshot.latency.p95_ms,
        "Metrics tick"
    );

    shared.events.emit(PoolEvent::Metrics(Arc::new(snapshot.clone())));
    snapshot
}
