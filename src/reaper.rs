//! Idle reaper and memory guard
//!
//! Runs every `gc_interval`. Active connections silent for longer than
//! `connection_timeout` are closed with code 4000. Afterwards process
//! memory is sampled; above the threshold the pool emits `gc` and asks the
//! pressure hook to reclaim what it can. Rust has no collector to trigger,
//! so the default hook only logs.

use crate::config::PoolConfig;
use crate::events::PoolEvent;
use crate::pool::PoolShared;
use crate::transport::close_code;

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Source of the process memory figure
pub trait HeapProbe: Send + Sync + 'static {
    /// Bytes in use, `None` when the platform cannot tell
    fn heap_used_bytes(&self) -> Option<u64>;
}

/// Resident set size from `/proc/self/statm`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

const PAGE_SIZE: u64 = 4096;

impl HeapProbe for ProcessMemory {
    fn heap_used_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        parse_statm_resident(&statm).map(|pages| pages * PAGE_SIZE)
    }
}

fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

/// Invoked when memory crosses the threshold
pub trait MemoryPressureHook: Send + Sync + 'static {
    /// Attempt to release memory; returns whether anything was done
    fn request_collection(&self) -> bool;
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl MemoryPressureHook for NoopHook {
    fn request_collection(&self) -> bool {
        debug!("No memory pressure hook installed, skipping collection");
        false
    }
}

/// Threshold check over a probe and a hook
pub struct MemoryManager {
    probe: Arc<dyn HeapProbe>,
    hook: Arc<dyn MemoryPressureHook>,
    threshold: u64,
}

impl MemoryManager {
    pub fn new(
        probe: Arc<dyn HeapProbe>,
        hook: Arc<dyn MemoryPressureHook>,
        threshold: u64,
    ) -> Self {
        Self {
            probe,
            hook,
            threshold,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            Arc::new(ProcessMemory),
            Arc::new(NoopHook),
            config.memory_threshold_bytes,
        )
    }

    pub fn heap_used(&self) -> Option<u64> {
        self.probe.heap_used_bytes()
    }

    /// Sample memory and run the hook when above the threshold
    ///
    /// Returns the usage that triggered it.
    pub fn check(&self) -> Option<u64> {
        let used = self.probe.heap_used_bytes()?;
        if used <= self.threshold {
            return None;
        }

        let collected = self.hook.request_collection();
        warn!(
            heap_used = used,
            threshold = self.threshold,
            collected,
            "Memory above threshold"
        );
        Some(used)
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reaped: usize,
    pub heap_before: Option<u64>,
}

/// Reap idle connections, then check memory
///
/// Entries waiting for a reconnect are left to their supervisor.
pub(crate) fn sweep(shared: &PoolShared) -> SweepReport {
    let now = Instant::now();
    let timeout = shared.config.connection_timeout();

    let idle = shared.registry.scan(|entry| {
        (entry.metadata.is_active && entry.metadata.is_idle(now, timeout))
            .then_some(entry.metadata.id)
    });

    let reaped = idle
        .into_iter()
        .filter(|id| {
            shared
                .finalize(id, close_code::IDLE_TIMEOUT, "Connection timeout", "idle_timeout")
                .is_some()
        })
        .count();

    if reaped > 0 {
        info!(reaped, "Reaped idle connections");
        shared.events.emit(PoolEvent::Cleanup { removed: reaped });
    }

    let heap_before = shared.memory.check();
    if let Some(heap_before) = heap_before {
        shared.events.emit(PoolEvent::Gc { heap_before });
    }

    SweepReport {
        reaped,
        heap_before,
    }
}
