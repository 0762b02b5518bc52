//! Per-connection outbound queues
//!
//! Each connection gets one FIFO tier per priority level, so draining tiers
//! in order yields priority-then-age ordering without a sort.

use crate::config::QueueOverflow;
use crate::shard::ConnectionId;

use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

/// A message waiting to be batched
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Shared across every connection a broadcast targeted
    pub payload: Arc<Value>,
    /// 0 is the most urgent
    pub priority: u8,
    pub enqueued_at: Instant,
    pub delivery_attempts: u32,
}

impl PendingMessage {
    pub fn new(payload: Arc<Value>, priority: u8) -> Self {
        Self {
            payload,
            priority,
            enqueued_at: Instant::now(),
            delivery_attempts: 0,
        }
    }
}

/// Result of pushing onto a full or non-full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting an older, less urgent message
    QueuedWithEviction,
    /// The new message was refused
    Rejected,
}

/// Result of putting a failed batch back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueOutcome {
    pub requeued: usize,
    pub dropped: usize,
}

/// Pending messages of one connection
#[derive(Debug)]
pub struct PendingQueue {
    tiers: Vec<VecDeque<PendingMessage>>,
    len: usize,
}

impl PendingQueue {
    pub fn new(priority_levels: u8) -> Self {
        Self {
            tiers: (0..priority_levels.max(1)).map(|_| VecDeque::new()).collect(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn tier_of(&self, priority: u8) -> usize {
        usize::from(priority).min(self.tiers.len() - 1)
    }

    /// Append a message, applying `policy` when `max_depth` is reached
    pub fn push(
        &mut self,
        message: PendingMessage,
        max_depth: usize,
        policy: QueueOverflow,
    ) -> PushOutcome {
        let tier = self.tier_of(message.priority);
        let mut outcome = PushOutcome::Queued;

        if self.len >= max_depth {
            match policy {
                QueueOverflow::Reject => return PushOutcome::Rejected,
                QueueOverflow::ShedLowestPriority => {
                    let Some(victim) = self.tiers.iter().rposition(|t| !t.is_empty()) else {
                        return PushOutcome::Rejected;
                    };
                    if tier > victim {
                        return PushOutcome::Rejected;
                    }
                    self.tiers[victim].pop_front();
                    self.len -= 1;
                    outcome = PushOutcome::QueuedWithEviction;
                }
            }
        }

        self.tiers[tier].push_back(message);
        self.len += 1;
        outcome
    }

    /// Remove up to `max` messages, most urgent tier first, oldest first
    pub fn take_batch(&mut self, max: usize) -> Vec<PendingMessage> {
        let mut batch = Vec::with_capacity(max.min(self.len));
        for tier in &mut self.tiers {
            while batch.len() < max {
                match tier.pop_front() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }
            if batch.len() == max {
                break;
            }
        }
        self.len -= batch.len();
        batch
    }

    /// Put messages back at the head of their tiers, preserving their order
    pub fn requeue_front(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            let tier = self.tier_of(message.priority);
            self.tiers[tier].push_front(message);
            self.len += 1;
        }
    }

    /// Take everything, most urgent first
    pub fn drain_all(&mut self) -> Vec<PendingMessage> {
        let all: Vec<_> = self.tiers.iter_mut().flat_map(|t| t.drain(..)).collect();
        self.len = 0;
        all
    }
}

/// Outbound queues for every registered connection
pub struct OutboundQueues {
    queues: DashMap<ConnectionId, PendingQueue>,
    priority_levels: u8,
    max_depth: usize,
    overflow: QueueOverflow,
}

impl OutboundQueues {
    pub fn new(priority_levels: u8, max_depth: usize, overflow: QueueOverflow) -> Self {
        Self {
            queues: DashMap::new(),
            priority_levels,
            max_depth,
            overflow,
        }
    }

    /// Create the (empty) queue for a newly registered connection
    pub fn create(&self, id: ConnectionId) {
        self.queues
            .entry(id)
            .or_insert_with(|| PendingQueue::new(self.priority_levels));
    }

    /// Drop a connection's queue, returning whatever was still pending
    pub fn remove(&self, id: &ConnectionId) -> Option<PendingQueue> {
        self.queues.remove(id).map(|(_, queue)| queue)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.queues.contains_key(id)
    }

    /// Enqueue for one connection; `None` when the connection has no queue
    pub fn enqueue(&self, id: &ConnectionId, message: PendingMessage) -> Option<PushOutcome> {
        let mut queue = self.queues.get_mut(id)?;
        Some(queue.push(message, self.max_depth, self.overflow))
    }

    /// Move previously pending messages onto another connection's queue
    ///
    /// Returns how many messages the depth limit cost, refused or evicted.
    pub fn absorb(&self, id: &ConnectionId, messages: Vec<PendingMessage>) -> usize {
        let Some(mut queue) = self.queues.get_mut(id) else {
            return messages.len();
        };
        let mut lost = 0;
        for message in messages {
            match queue.push(message, self.max_depth, self.overflow) {
                PushOutcome::Queued => {}
                PushOutcome::QueuedWithEviction | PushOutcome::Rejected => lost += 1,
            }
        }
        lost
    }

    /// Take the next batch for a connection
    pub fn take_batch(&self, id: &ConnectionId, max: usize) -> Vec<PendingMessage> {
        match self.queues.get_mut(id) {
            Some(mut queue) if !queue.is_empty() => queue.take_batch(max),
            _ => Vec::new(),
        }
    }

    /// Return a batch whose send failed
    ///
    /// Each message's attempt count is bumped; those reaching
    /// `max_attempts` are dropped.
    pub fn requeue_failed(
        &self,
        id: &ConnectionId,
        batch: Vec<PendingMessage>,
        max_attempts: u32,
    ) -> RequeueOutcome {
        let (retry, expired): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .map(|mut m| {
                m.delivery_attempts += 1;
                m
            })
            .partition(|m| m.delivery_attempts < max_attempts);

        match self.queues.get_mut(id) {
            Some(mut queue) => {
                let requeued = retry.len();
                queue.requeue_front(retry);
                RequeueOutcome {
                    requeued,
                    dropped: expired.len(),
                }
            }
            None => RequeueOutcome {
                requeued: 0,
                dropped: retry.len() + expired.len(),
            },
        }
    }

    /// Pending messages for one connection
    pub fn depth(&self, id: &ConnectionId) -> usize {
        self.queues.get(id).map(|q| q.len()).unwrap_or(0)
    }

    /// Pending messages across all connections
    pub fn pending_total(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Number of queues (one per registered connection)
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn clear(&self) {
        self.queues.clear();
    }
}
