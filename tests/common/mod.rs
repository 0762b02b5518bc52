//! Shared fixtures for pool integration tests

#![allow(dead_code)]

use arrakis_socket_pool::reaper::{HeapProbe, MemoryPressureHook};
use arrakis_socket_pool::{
    ConnectionPool, Frame, PoolConfig, PoolEvent, Transport, TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Transport that records every frame and close request
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Frame>>,
    closed: Mutex<Option<(u16, String)>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    /// Text frames parsed as JSON
    pub fn texts(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                _ => None,
            })
            .collect()
    }

    /// Text frames of type `batch`
    pub fn batches(&self) -> Vec<Value> {
        self.texts()
            .into_iter()
            .filter(|v| v["type"] == "batch")
            .collect()
    }

    pub fn pings(&self) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Ping(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.closed.lock().clone()
    }

    pub fn fail_sends(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("mock failure".to_string()));
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn close(&self, code: u16, reason: &str) {
        *self.closed.lock() = Some((code, reason.to_string()));
    }

    fn is_open(&self) -> bool {
        self.closed.lock().is_none()
    }
}

/// Probe returning whatever the test stores
pub struct FakeProbe(pub AtomicU64);

impl HeapProbe for FakeProbe {
    fn heap_used_bytes(&self) -> Option<u64> {
        Some(self.0.load(Ordering::SeqCst))
    }
}

/// Hook counting how often it was asked to collect
#[derive(Default)]
pub struct CountingHook(pub AtomicUsize);

impl MemoryPressureHook for CountingHook {
    fn request_collection(&self) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Small pool config for tests
pub fn test_config() -> PoolConfig {
    PoolConfig {
        shards: 2,
        max_connections_per_shard: 10,
        ..PoolConfig::default()
    }
}

/// Pool whose memory probe reports `heap` bytes against a 1000 byte threshold
pub fn pool_with_heap(
    config: PoolConfig,
    heap: u64,
) -> (ConnectionPool, Arc<FakeProbe>, Arc<CountingHook>) {
    let probe = Arc::new(FakeProbe(AtomicU64::new(heap)));
    let hook = Arc::new(CountingHook::default());
    let config = PoolConfig {
        memory_threshold_bytes: 1000,
        ..config
    };
    let pool = ConnectionPool::with_memory(config, probe.clone(), hook.clone()).unwrap();
    (pool, probe, hook)
}

/// Pool with a quiet memory probe
pub fn pool(config: PoolConfig) -> ConnectionPool {
    pool_with_heap(config, 0).0
}

/// Every event currently buffered on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
