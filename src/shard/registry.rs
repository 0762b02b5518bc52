//! Sharded connection registry
//!
//! Partitions connections into N bounded maps so that full scans
//! (broadcast, reaping) walk small units and each shard has its own lock.
//! An auxiliary `id -> shard` index gives O(1) lookup by connection id.

use crate::error::PoolError;
use crate::shard::state::{ConnectionEntry, ConnectionId, ConnectionMetadata};
use crate::transport::Transport;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type Shard = RwLock<HashMap<ConnectionId, ConnectionEntry>>;

/// Connection registry split into bounded shards
pub struct ShardRegistry {
    shards: Vec<Shard>,
    index: DashMap<ConnectionId, usize>,
    max_per_shard: usize,
    len: AtomicUsize,
}

impl ShardRegistry {
    /// Create a registry with `shard_count` shards of `max_per_shard` slots
    pub fn new(shard_count: usize, max_per_shard: usize) -> Self {
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::with_capacity(max_per_shard.min(1024))))
            .collect();

        Self {
            shards,
            index: DashMap::new(),
            max_per_shard,
            len: AtomicUsize::new(0),
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Total slots across all shards
    pub fn capacity(&self) -> usize {
        self.shards.len() * self.max_per_shard
    }

    /// Registered connections
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of every shard
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.read().len()).collect()
    }

    /// Register a connection in the least-loaded shard with spare capacity
    ///
    /// Returns the shard index, or `PoolFull` when every shard is saturated.
    pub fn insert(
        &self,
        mut metadata: ConnectionMetadata,
        transport: Arc<dyn Transport>,
    ) -> Result<usize, PoolError> {
        // A concurrent insert may fill the chosen shard between the scan and
        // the write lock; rescan in that case.
        for _ in 0..self.shards.len() {
            let Some(shard) = self.least_loaded() else {
                break;
            };

            let mut guard = self.shards[shard].write();
            if guard.len() >= self.max_per_shard {
                continue;
            }

            let id = metadata.id;
            metadata.shard = shard;
            self.index.insert(id, shard);
            guard.insert(id, ConnectionEntry { metadata, transport });
            self.len.fetch_add(1, Ordering::AcqRel);

            debug!(connection_id = %id, shard, shard_size = guard.len(), "Connection registered");
            return Ok(shard);
        }

        Err(PoolError::PoolFull {
            shards: self.shards.len(),
            per_shard: self.max_per_shard,
        })
    }

    fn least_loaded(&self) -> Option<usize> {
        self.shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| (idx, shard.read().len()))
            .filter(|(_, size)| *size < self.max_per_shard)
            .min_by_key(|(_, size)| *size)
            .map(|(idx, _)| idx)
    }

    /// Remove a connection; only the first caller for an id gets the entry
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        let (_, shard) = self.index.remove(id)?;
        let entry = self.shards[shard].write().remove(id);
        if entry.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        entry
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.index.contains_key(id)
    }

    /// Copy of a connection's metadata
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionMetadata> {
        let shard = *self.index.get(id)?;
        self.shards[shard].read().get(id).map(|e| e.metadata.clone())
    }

    /// Transport handle of a connection
    pub fn transport(&self, id: &ConnectionId) -> Option<Arc<dyn Transport>> {
        let shard = *self.index.get(id)?;
        self.shards[shard]
            .read()
            .get(id)
            .map(|e| Arc::clone(&e.transport))
    }

    /// Mutate a connection's metadata under its shard lock
    pub fn update<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut ConnectionMetadata) -> R,
    ) -> Option<R> {
        let shard = *self.index.get(id)?;
        let mut guard = self.shards[shard].write();
        guard.get_mut(id).map(|e| f(&mut e.metadata))
    }

    /// Filter-map every entry of one shard under its read lock
    pub fn scan_shard<R>(
        &self,
        shard: usize,
        mut f: impl FnMut(&ConnectionEntry) -> Option<R>,
    ) -> Vec<R> {
        self.shards
            .get(shard)
            .map(|s| s.read().values().filter_map(&mut f).collect())
            .unwrap_or_default()
    }

    /// Filter-map every entry of every shard, one shard lock at a time
    pub fn scan<R>(&self, mut f: impl FnMut(&ConnectionEntry) -> Option<R>) -> Vec<R> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().values().filter_map(&mut f));
        }
        out
    }

    /// Count of connections in the `Active` state
    pub fn active_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().filter(|e| e.metadata.is_active).count())
            .sum()
    }

    /// Remove every connection
    pub fn drain(&self) -> Vec<ConnectionEntry> {
        let mut drained = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let mut guard = shard.write();
            for (id, entry) in guard.drain() {
                self.index.remove(&id);
                drained.push(entry);
            }
        }
        self.len.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::state::Tags;
    use crate::transport::test_support::RecordingTransport;

    fn meta(client: &str) -> ConnectionMetadata {
        ConnectionMetadata::new(ConnectionId::new(), client.to_string(), Tags::new())
    }

    fn transport() -> Arc<dyn Transport> {
        Arc::new(RecordingTransport::default())
    }

    fn sizes_match_len(registry: &ShardRegistry) -> bool {
        registry.shard_sizes().iter().sum::<usize>() == registry.len()
    }

    #[test]
    fn two_by_one_boundary() {
        let registry = ShardRegistry::new(2, 1);

        let a = meta("a");
        let a_id = a.id;
        assert!(registry.insert(a, transport()).is_ok());
        assert!(registry.insert(meta("b"), transport()).is_ok());

        let err = registry.insert(meta("c"), transport()).unwrap_err();
        assert!(matches!(err, PoolError::PoolFull { shards: 2, per_shard: 1 }));

        assert!(registry.remove(&a_id).is_some());
        assert!(registry.insert(meta("d"), transport()).is_ok());
        assert!(sizes_match_len(&registry));
    }

    #[test]
    fn inserts_spread_to_least_loaded_shard() {
        let registry = ShardRegistry::new(4, 10);
        for i in 0..8 {
            registry.insert(meta(&format!("c{i}")), transport()).unwrap();
        }
        assert_eq!(registry.shard_sizes(), vec![2, 2, 2, 2]);
        assert!(sizes_match_len(&registry));
    }

    #[test]
    fn metadata_records_owning_shard() {
        let registry = ShardRegistry::new(3, 5);
        let m = meta("x");
        let id = m.id;
        let shard = registry.insert(m, transport()).unwrap();
        assert_eq!(registry.get(&id).unwrap().shard, shard);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ShardRegistry::new(2, 2);
        let m = meta("x");
        let id = m.id;
        registry.insert(m, transport()).unwrap();

        assert!(registry.remove(&id).is_some());
        assert!(registry.remove(&id).is_none());
        assert!(registry.get(&id).is_none());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn update_mutates_in_place() {
        let registry = ShardRegistry::new(1, 2);
        let m = meta("x");
        let id = m.id;
        registry.insert(m, transport()).unwrap();

        registry.update(&id, |m| m.messages_sent += 3);
        assert_eq!(registry.get(&id).unwrap().messages_sent, 3);
        assert!(registry.update(&ConnectionId::new(), |_| ()).is_none());
    }

    #[test]
    fn drain_empties_every_shard() {
        let registry = ShardRegistry::new(3, 3);
        for i in 0..7 {
            registry.insert(meta(&format!("c{i}")), transport()).unwrap();
        }
        assert_eq!(registry.drain().len(), 7);
        assert!(registry.is_empty());
        assert_eq!(registry.shard_sizes(), vec![0, 0, 0]);
    }
}
