//! Outbound update buffer for a single peer link.
//!
//! This module provides a queue for outgoing CRDT updates with:
//! - FIFO ordering for delivery
//! - Sequence numbers assigned at enqueue time
//! - Pending tracking (updates sent but not yet acknowledged)
//! - Max size limits to prevent unbounded memory growth
//!
//! A peer acknowledges with the highest sequence it applied, so a single
//! `Ack` prunes every pending update up to that point.

use std::collections::{BTreeMap, VecDeque};

/// Error type for buffer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Buffer is at capacity.
    Full {
        /// Current buffer capacity.
        capacity: usize,
    },
}

impl std::fmt::Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferError::Full { capacity } => {
                write!(f, "update buffer full (capacity: {})", capacity)
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// An encoded update waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundUpdate {
    /// Link-local sequence number.
    pub seq: u64,
    /// Encoded update bytes.
    pub update: Vec<u8>,
}

/// Update buffer with pending tracking.
///
/// Updates flow through the buffer in this order:
/// 1. `enqueue()` - assign a sequence number and queue
/// 2. `dequeue()` - remove from queue, move to pending
/// 3. `ack_through()` - drop every pending update up to a sequence
///
/// If the link drops, call `requeue_pending()` so unacknowledged updates are
/// sent again, in order, once the link is back.
#[derive(Debug)]
pub struct UpdateBuffer {
    /// Maximum number of updates (queued + pending).
    max_size: usize,
    /// Next sequence number to assign.
    next_seq: u64,
    /// Updates waiting to be sent.
    queue: VecDeque<OutboundUpdate>,
    /// Updates sent but not yet acknowledged.
    pending: BTreeMap<u64, OutboundUpdate>,
}

impl UpdateBuffer {
    /// Create a new buffer with the given maximum size.
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            next_seq: 1,
            queue: VecDeque::new(),
            pending: BTreeMap::new(),
        }
    }

    /// Queue an update and return its sequence number.
    ///
    /// Returns an error if the buffer is full (queued + pending >= max_size).
    pub fn enqueue(&mut self, update: Vec<u8>) -> Result<u64, BufferError> {
        if self.total_count() >= self.max_size {
            return Err(BufferError::Full {
                capacity: self.max_size,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(OutboundUpdate { seq, update });
        Ok(seq)
    }

    /// Remove and return the next update from the queue.
    ///
    /// The update is moved to the pending set until acknowledged.
    pub fn dequeue(&mut self) -> Option<OutboundUpdate> {
        let next = self.queue.pop_front()?;
        self.pending.insert(next.seq, next.clone());
        Some(next)
    }

    /// Acknowledge every pending update with `seq <= through`.
    ///
    /// Returns how many updates were pruned.
    pub fn ack_through(&mut self, through: u64) -> usize {
        let keep = self.pending.split_off(&(through.saturating_add(1)));
        let pruned = self.pending.len();
        self.pending = keep;
        pruned
    }

    /// Move all pending updates back to the front of the queue, in order.
    pub fn requeue_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for (_, update) in pending.into_iter().rev() {
            self.queue.push_front(update);
        }
    }

    /// Check if an update is pending (sent but not acknowledged).
    pub fn is_pending(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Number of updates in the queue (not including pending).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of pending updates.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Total number of updates (queued + pending).
    pub fn total_count(&self) -> usize {
        self.queue.len() + self.pending.len()
    }

    /// Clear all updates (both queued and pending).
    ///
    /// Sequence numbers keep increasing so late acks cannot match new updates.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}
