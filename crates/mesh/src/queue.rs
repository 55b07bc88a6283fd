//! Offline message queue for gateway-bound traffic.
//!
//! Holds messages while no usable bridge is reachable and replays them
//! when one appears. Volatile: nothing survives a restart.

use crate::error::QueueError;
use canopy_core::{Millis, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Flush attempts before an undeliverable entry is dropped
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Priority tier. Declaration order is urgency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Never evicted to make room
    Critical,
    /// Evicted only for critical traffic
    High,
    /// Default tier for telemetry
    Normal,
    /// First to go when the queue is full
    Low,
}

impl Priority {
    /// All tiers in flush order
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    fn tier(self) -> usize {
        self as usize
    }
}

/// Where a queued message goes once it can be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryScope {
    /// Whichever bridge is recommended at flush time
    Gateway,
    /// One specific node
    Single(NodeId),
    /// Every node
    Broadcast,
}

/// One buffered message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue-assigned id, increasing in enqueue order
    pub id: u64,
    /// Opaque application bytes
    pub payload: Vec<u8>,
    /// Tier the message was queued under
    pub priority: Priority,
    /// Delivery target
    pub scope: DeliveryScope,
    /// Engine clock at enqueue
    pub enqueued_at: Millis,
    /// Delivery attempts made so far
    pub attempts: u32,
}

/// Fill level of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    /// Nothing queued
    Empty,
    /// Below three quarters of capacity
    Normal,
    /// At or above three quarters of capacity
    NearlyFull,
    /// At capacity; the next enqueue evicts or fails
    Full,
}

impl QueueState {
    fn from_fill(len: usize, capacity: usize) -> Self {
        if len == 0 {
            QueueState::Empty
        } else if len >= capacity {
            QueueState::Full
        } else if len * 4 >= capacity * 3 {
            QueueState::NearlyFull
        } else {
            QueueState::Normal
        }
    }
}

/// Lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages accepted
    pub total_queued: u64,
    /// Messages handed off during flush
    pub total_sent: u64,
    /// Messages evicted or pruned
    pub total_dropped: u64,
    /// Messages dropped after exhausting their flush attempts
    pub total_failed: u64,
    /// Enqueues refused for lack of room
    pub total_rejected: u64,
    /// Highest occupancy seen
    pub peak_len: usize,
}

/// Result of a successful enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Id of the new entry
    pub id: u64,
    /// Entry evicted to make room
    pub evicted: Option<QueuedMessage>,
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport<E> {
    /// Entries handed off and removed
    pub sent: usize,
    /// Entries still queued
    pub remaining: usize,
    /// Entries that hit the attempt limit and were removed undelivered
    pub failed: Vec<QueuedMessage>,
    /// Failure that halted the cycle
    pub error: Option<E>,
}

/// Bounded, tiered, FIFO-within-tier queue
#[derive(Debug)]
pub struct MessageQueue {
    tiers: [VecDeque<QueuedMessage>; 4],
    capacity: usize,
    max_attempts: u32,
    next_id: u64,
    stats: QueueStats,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages across all tiers
    pub fn new(capacity: usize) -> Self {
        Self {
            tiers: Default::default(),
            capacity,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_id: 1,
            stats: QueueStats::default(),
        }
    }

    /// Drop entries undelivered after `max_attempts` flushes. Zero is
    /// treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Add a message, evicting the oldest entry of the least urgent tier
    /// that does not outrank it when the queue is full.
    pub fn enqueue(
        &mut self,
        payload: Vec<u8>,
        priority: Priority,
        scope: DeliveryScope,
        now: Millis,
    ) -> Result<Enqueued, QueueError> {
        let mut evicted = None;
        if self.len() >= self.capacity {
            let victim = (priority.tier()..self.tiers.len())
                .rev()
                .find(|&t| t != Priority::Critical.tier() && !self.tiers[t].is_empty());
            match victim.and_then(|t| self.tiers[t].pop_front()) {
                Some(old) => {
                    warn!(id = old.id, priority = ?old.priority, "Queue full, evicted message");
                    self.stats.total_dropped += 1;
                    evicted = Some(old);
                }
                None => {
                    self.stats.total_rejected += 1;
                    error!(capacity = self.capacity, ?priority, "Queue full, message rejected");
                    return Err(QueueError::CapacityExhausted {
                        capacity: self.capacity,
                        priority,
                    });
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.tiers[priority.tier()].push_back(QueuedMessage {
            id,
            payload,
            priority,
            scope,
            enqueued_at: now,
            attempts: 0,
        });
        self.stats.total_queued += 1;
        self.stats.peak_len = self.stats.peak_len.max(self.len());
        debug!(id, ?priority, len = self.len(), "Message queued");
        Ok(Enqueued { id, evicted })
    }

    /// Replay entries in tier order, FIFO within a tier.
    ///
    /// An entry is removed only after `deliver` accepts it. The first
    /// failure stops the cycle and leaves that entry at the head, unless
    /// the entry has used up its attempts: then it is removed and the
    /// cycle moves on.
    pub fn flush<F, E>(&mut self, mut deliver: F) -> FlushReport<E>
    where
        F: FnMut(&QueuedMessage) -> Result<(), E>,
    {
        let max_attempts = self.max_attempts;
        let mut sent = 0;
        let mut failed = Vec::new();
        let mut error = None;
        'tiers: for tier in self.tiers.iter_mut() {
            while let Some(front) = tier.front_mut() {
                front.attempts += 1;
                match deliver(&*front) {
                    Ok(()) => {
                        tier.pop_front();
                        sent += 1;
                    }
                    Err(_) if front.attempts >= max_attempts => {
                        warn!(
                            id = front.id,
                            attempts = front.attempts,
                            "Retry limit reached, dropping queued message"
                        );
                        failed.extend(tier.pop_front());
                    }
                    Err(e) => {
                        debug!(id = front.id, attempts = front.attempts, "Flush halted");
                        error = Some(e);
                        break 'tiers;
                    }
                }
            }
        }
        self.stats.total_sent += sent as u64;
        self.stats.total_failed += failed.len() as u64;
        let remaining = self.len();
        if sent > 0 {
            info!(sent, remaining, "Offline queue flushed");
        }
        FlushReport {
            sent,
            remaining,
            failed,
            error,
        }
    }

    /// Drop non-critical entries older than `max_age_ms`
    pub fn prune(&mut self, now: Millis, max_age_ms: Millis) -> Vec<QueuedMessage> {
        let mut removed = Vec::new();
        for tier in self.tiers.iter_mut().skip(1) {
            while tier
                .front()
                .map(|m| now.saturating_sub(m.enqueued_at) > max_age_ms)
                .unwrap_or(false)
            {
                if let Some(old) = tier.pop_front() {
                    removed.push(old);
                }
            }
        }
        if !removed.is_empty() {
            self.stats.total_dropped += removed.len() as u64;
            info!(pruned = removed.len(), "Pruned aged messages");
        }
        removed
    }

    /// Entries in flush order
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.tiers.iter().flatten()
    }

    /// Total entries
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    /// Entries in one tier
    pub fn len_of(&self, priority: Priority) -> usize {
        self.tiers[priority.tier()].len()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill level
    pub fn state(&self) -> QueueState {
        QueueState::from_fill(self.len(), self.capacity)
    }

    /// Lifetime counters
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Remove everything; returns how many entries were dropped
    pub fn clear(&mut self) -> usize {
        let n = self.len();
        for tier in self.tiers.iter_mut() {
            tier.clear();
        }
        n
    }
}
