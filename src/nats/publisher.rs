//! NATS event publisher
//!
//! Publishes serialized pool events to NATS JetStream

use crate::error::PoolError;
use crate::events::serialize::{serialize_event, PoolEventEnvelope};
use crate::events::PoolEvent;

use async_nats::jetstream::{self, Context as JsContext};
use async_nats::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Stream names
pub mod streams {
    /// Every pool event subject
    pub const POOL: &str = "POOL";
}

/// Subject prefixes for routing
pub mod subjects {
    /// Periodic metrics snapshots
    pub const METRICS: &str = "pool.metrics";
    /// Reconnect attempts for the external re-dial layer
    pub const RECONNECT: &str = "pool.reconnect";
    /// Connection lifecycle: pool.connection.{open|close}
    pub const CONNECTION: &str = "pool.connection";
    /// Reaper output: pool.maintenance.{cleanup|gc}
    pub const MAINTENANCE: &str = "pool.maintenance";
}

/// Subject an envelope of `event_type` is published on
pub fn route_subject(event_type: &str) -> String {
    match event_type {
        "pool.metrics" => subjects::METRICS.to_string(),
        "pool.shutdown" => "pool.shutdown".to_string(),
        "reconnect.attempt" => subjects::RECONNECT.to_string(),

        "connection.open" => format!("{}.open", subjects::CONNECTION),
        "connection.close" => format!("{}.close", subjects::CONNECTION),

        "maintenance.cleanup" => format!("{}.cleanup", subjects::MAINTENANCE),
        "maintenance.gc" => format!("{}.gc", subjects::MAINTENANCE),

        // Default: generic pool event
        other => format!("pool.{}", other.replace('.', "_")),
    }
}

/// NATS publisher for pool events
pub struct EventPublisher {
    client: Client,
    jetstream: JsContext,
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl EventPublisher {
    /// Connect to NATS server
    pub async fn connect(servers: &str) -> Result<Arc<Self>, PoolError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| PoolError::NatsConnectionFailed(Box::new(e)))?;

        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS JetStream");

        Ok(Arc::new(Self {
            client,
            jetstream,
            connected: AtomicBool::new(true),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }))
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
            && matches!(
                self.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    /// Get total messages published
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Get total publish failures
    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    /// Publish an envelope and wait for the JetStream ack
    pub async fn publish_event(&self, envelope: &PoolEventEnvelope) -> Result<(), PoolError> {
        let subject = route_subject(&envelope.event_type);
        let payload = serde_json::to_vec(envelope).map_err(|source| {
            PoolError::SerializationFailed {
                what: "event envelope",
                source,
            }
        })?;

        debug!(
            event_type = %envelope.event_type,
            subject,
            event_id = %envelope.event_id,
            "Publishing event"
        );

        let result = match self.jetstream.publish(subject.clone(), payload.into()).await {
            Ok(ack) => ack.await,
            Err(e) => Err(e),
        };

        match result {
            Ok(ack) => {
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    subject,
                    stream = %ack.stream,
                    seq = ack.sequence,
                    "Event published"
                );
                Ok(())
            }
            Err(e) => {
                self.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subject, error = %e, "Failed to publish event");
                Err(PoolError::NatsPublishFailed {
                    subject,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Ensure the POOL stream exists
    pub async fn ensure_streams(&self) -> Result<(), PoolError> {
        ensure_streams(&self.jetstream).await
    }

    /// Graceful shutdown
    pub async fn close(&self) {
        info!("Closing NATS connection");
        self.connected.store(false, Ordering::SeqCst);
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "Flush on close failed");
        }
    }
}

/// Ensure streams exist with correct configuration
///
/// This is typically run during startup or by a separate setup job.
pub async fn ensure_streams(js: &JsContext) -> Result<(), PoolError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    // POOL stream - memory storage, 5min retention for downstream consumers
    let pool_config = Config {
        name: streams::POOL.to_string(),
        subjects: vec!["pool.>".to_string()],
        retention: RetentionPolicy::Limits,
        max_age: std::time::Duration::from_secs(300),
        storage: StorageType::Memory,
        ..Default::default()
    };

    match js.get_or_create_stream(pool_config).await {
        Ok(_) => info!("POOL stream ready"),
        Err(e) => {
            error!(error = %e, "Failed to create POOL stream");
            return Err(PoolError::NatsPublishFailed {
                subject: "pool.>".to_string(),
                source: Box::new(e),
            });
        }
    }

    info!("NATS streams configured");
    Ok(())
}

/// Forward pool events to NATS until the pool shuts down
pub async fn run_forwarder(
    publisher: Arc<EventPublisher>,
    pool_id: u64,
    mut events: broadcast::Receiver<PoolEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, events skipped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let is_shutdown = matches!(event, PoolEvent::Shutdown);

        if let Some(envelope) = serialize_event(&event, pool_id) {
            if let Err(e) = publisher.publish_event(&envelope).await {
                debug!(error = %e, event_type = %envelope.event_type, "Event not forwarded");
            }
        }

        if is_shutdown {
            break;
        }
    }

    debug!("Event forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_lifecycle_events() {
        assert_eq!(route_subject("connection.open"), "pool.connection.open");
        assert_eq!(route_subject("connection.close"), "pool.connection.close");
        assert_eq!(route_subject("reconnect.attempt"), "pool.reconnect");
        assert_eq!(route_subject("pool.metrics"), "pool.metrics");
    }

    #[test]
    fn test_route_maintenance_events() {
        assert_eq!(route_subject("maintenance.cleanup"), "pool.maintenance.cleanup");
        assert_eq!(route_subject("maintenance.gc"), "pool.maintenance.gc");
    }

    #[test]
    fn test_route_unknown_stays_in_stream() {
        assert_eq!(route_subject("pool.shutdown"), "pool.shutdown");
        assert_eq!(route_subject("anything.else"), "pool.anything_else");
    }
}
