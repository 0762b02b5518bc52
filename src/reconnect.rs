//! Reconnection / backoff supervisor
//!
//! A closed transport cannot be resurrected. On close the supervisor only
//! keeps the entry around as `ReconnectPending` and emits
//! `reconnect_attempt` events on an exponential schedule, so an external
//! layer can dial a replacement and register it under the same client id.
//! When the budget runs out the entry is finalized.

use crate::config::PoolConfig;
use crate::events::PoolEvent;
use crate::pool::PoolShared;
use crate::shard::{ConnectionId, ConnectionState};
use crate::transport::close_code;

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Exponential backoff with a ceiling and an attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub enabled: bool,
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            enabled: config.reconnect,
            base: config.reconnect_interval(),
            max_delay: config.max_backoff(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// `min(base * 2^attempts, max_delay)`
    pub fn delay_for(&self, attempts: u32) -> Duration {
        1u32.checked_shl(attempts)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether a connection that already used `attempts` may be retried
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.enabled && attempts < self.max_attempts
    }
}

/// Close details kept while an entry waits for its replacement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReconnect {
    pub connection_id: ConnectionId,
    pub code: u16,
    pub reason: String,
}

/// Reconnect-pending entries by client id
#[derive(Debug, Default)]
pub struct PendingReconnects {
    by_client: DashMap<String, PendingReconnect>,
}

impl PendingReconnects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client_id: String, pending: PendingReconnect) {
        self.by_client.insert(client_id, pending);
    }

    /// Claim the pending entry of `client_id` (a replacement arrived)
    pub fn take(&self, client_id: &str) -> Option<PendingReconnect> {
        self.by_client.remove(client_id).map(|(_, pending)| pending)
    }

    /// Forget `client_id` only if it still points at `connection_id`
    pub fn forget(&self, client_id: &str, connection_id: &ConnectionId) {
        self.by_client
            .remove_if(client_id, |_, pending| pending.connection_id == *connection_id);
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.by_client.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.by_client.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_client.is_empty()
    }

    pub fn clear(&self) {
        self.by_client.clear();
    }
}

/// React to a transport close event
///
/// Ignored unless the connection is registered and active, so a close that
/// follows an explicit close or a reap is a no-op.
pub(crate) fn on_transport_close(
    shared: &Arc<PoolShared>,
    id: &ConnectionId,
    code: u16,
    reason: &str,
) {
    let closing = shared
        .registry
        .update(id, |meta| {
            if !meta.state.is_active() {
                return None;
            }
            meta.set_state(ConnectionState::Closing);
            Some((meta.client_id.clone(), meta.reconnect_attempts))
        })
        .flatten();

    let Some((client_id, attempts)) = closing else {
        debug!(connection_id = %id, code, "Close for unknown or inactive connection ignored");
        return;
    };

    if !shared.backoff.should_retry(attempts) {
        shared.finalize(id, code, reason, "transport_close");
        return;
    }

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(connection_id = %id, "No runtime to schedule reconnect attempts; finalizing");
        shared.finalize(id, code, reason, "transport_close");
        return;
    };

    shared
        .registry
        .update(id, |meta| meta.set_state(ConnectionState::ReconnectPending));
    shared.reconnects.insert(
        client_id.clone(),
        PendingReconnect {
            connection_id: *id,
            code,
            reason: reason.to_string(),
        },
    );

    info!(
        connection_id = %id,
        client_id = %client_id,
        code,
        attempts,
        max_attempts = shared.backoff.max_attempts,
        "Connection closed, awaiting reconnect"
    );

    runtime.spawn(supervise(Arc::clone(shared), *id, shared.shutdown_receiver()));
}

/// Emit attempts until the entry is claimed, closed, or out of budget
async fn supervise(
    shared: Arc<PoolShared>,
    id: ConnectionId,
    mut shutdown: broadcast::Receiver<()>,
) {
    let policy = shared.backoff;

    loop {
        let Some(meta) = shared.registry.get(&id) else {
            return;
        };
        if meta.state != ConnectionState::ReconnectPending {
            return;
        }

        let attempts = meta.reconnect_attempts;
        let delay = policy.delay_for(attempts);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                debug!(connection_id = %id, "Reconnect supervisor received shutdown signal");
                return;
            }
        }

        if attempts >= policy.max_attempts {
            // The last attempt had its window and nobody claimed the entry
            shared.finalize(
                &id,
                close_code::ABNORMAL,
                "reconnect attempts exhausted",
                "reconnect_exhausted",
            );
            return;
        }

        let attempt = shared
            .registry
            .update(&id, |meta| {
                if meta.state != ConnectionState::ReconnectPending {
                    return None;
                }
                meta.reconnect_attempts += 1;
                Some(meta.reconnect_attempts)
            })
            .flatten();

        let Some(attempt) = attempt else {
            return;
        };

        shared.metrics.record_reconnect_attempt();
        info!(
            connection_id = %id,
            client_id = %meta.client_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnect attempt"
        );
        shared.events.emit(PoolEvent::ReconnectAttempt {
            connection_id: id,
            client_id: meta.client_id,
            tags: meta.tags,
            attempt,
            delay,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            enabled: true,
            base: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy(10);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn retry_budget() {
        let policy = policy(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let disabled = BackoffPolicy {
            enabled: false,
            ..policy
        };
        assert!(!disabled.should_retry(0));
    }

    #[test]
    fn forget_only_matching_connection() {
        let pending = PendingReconnects::new();
        let old = ConnectionId::new();
        let newer = ConnectionId::new();
        pending.insert(
            "client".to_string(),
            PendingReconnect {
                connection_id: newer,
                code: 1006,
                reason: String::new(),
            },
        );

        pending.forget("client", &old);
        assert!(pending.contains("client"));

        pending.forget("client", &newer);
        assert!(pending.is_empty());
    }
}
