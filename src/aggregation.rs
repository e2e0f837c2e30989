//! # Aggregation Buffer
//!
//! Fixed-capacity, drop-oldest FIFO that batches decoded records briefly before
//! they are written to the durable queue.
//!
//! Flushes are handed over a channel instead of a callback: when occupancy
//! reaches `capacity × flush_threshold` the buffer takes a snapshot, clears
//! itself and sends the snapshot to its subscriber. The producer never waits
//! for the consumer, and nothing the consumer does can touch buffer state.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default capacity: 5 seconds of samples at 25Hz
pub const DEFAULT_CAPACITY: usize = 125;

/// Default occupancy ratio that triggers a flush
pub const DEFAULT_FLUSH_THRESHOLD: f64 = 0.8;

/// Buffer observability counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    /// Items currently held
    pub len: usize,
    /// Maximum items held
    pub capacity: usize,
    /// `len / capacity` in percent
    pub occupancy_pct: f64,
    /// Items ever added
    pub total_writes: u64,
    /// Snapshots handed out (automatic and manual)
    pub total_flushes: u64,
    /// Items evicted by the drop-oldest policy
    pub total_overflows: u64,
    /// Automatic flushes whose subscriber had gone away
    pub failed_handoffs: u64,
}

/// Drop-oldest circular buffer with threshold-triggered flush handoff
#[derive(Debug)]
pub struct AggregationBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    flush_threshold: f64,
    subscriber: Option<mpsc::UnboundedSender<Vec<T>>>,
    total_writes: u64,
    total_flushes: u64,
    total_overflows: u64,
    failed_handoffs: u64,
}

impl<T> AggregationBuffer<T> {
    /// Create a buffer with the default capacity and threshold
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_FLUSH_THRESHOLD)
    }

    /// Create a buffer
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of items (clamped to at least 1)
    /// * `flush_threshold` - Occupancy ratio in (0, 1] that triggers a flush
    pub fn with_capacity(capacity: usize, flush_threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            flush_threshold: flush_threshold.clamp(f64::MIN_POSITIVE, 1.0),
            subscriber: None,
            total_writes: 0,
            total_flushes: 0,
            total_overflows: 0,
            failed_handoffs: 0,
        }
    }

    /// Register the flush consumer
    ///
    /// Replaces any previous subscriber. Without a subscriber the buffer never
    /// flushes on its own and simply keeps the newest `capacity` items.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Vec<T>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    /// Drop the flush consumer; queued handoffs stay with the receiver
    pub fn unsubscribe(&mut self) {
        self.subscriber = None;
    }

    /// Append one item, evicting the oldest when full
    pub fn add(&mut self, item: T) {
        self.push(item);
        self.maybe_flush();
    }

    /// Append several items, then check the flush threshold once
    pub fn add_batch<I: IntoIterator<Item = T>>(&mut self, items: I) {
        for item in items {
            self.push(item);
        }
        self.maybe_flush();
    }

    fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.total_overflows += 1;
        }
        self.items.push_back(item);
        self.total_writes += 1;
    }

    fn threshold_reached(&self) -> bool {
        self.items.len() as f64 >= self.capacity as f64 * self.flush_threshold
    }

    fn maybe_flush(&mut self) {
        if !self.threshold_reached() {
            return;
        }
        let Some(subscriber) = &self.subscriber else {
            return;
        };

        let snapshot: Vec<T> = self.items.drain(..).collect();
        let count = snapshot.len();

        match subscriber.send(snapshot) {
            Ok(()) => {
                self.total_flushes += 1;
                debug!("Handed off {} buffered records", count);
            }
            Err(mpsc::error::SendError(snapshot)) => {
                // Consumer is gone: keep the data and fall back to drop-oldest
                warn!("Flush subscriber closed, keeping {} records in buffer", count);
                self.failed_handoffs += 1;
                self.subscriber = None;
                self.items.extend(snapshot);
            }
        }
    }

    /// Drain everything synchronously, e.g. on shutdown
    pub fn flush(&mut self) -> Vec<T> {
        let snapshot: Vec<T> = self.items.drain(..).collect();
        if !snapshot.is_empty() {
            self.total_flushes += 1;
        }
        snapshot
    }

    /// Oldest item, if any
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    /// Iterate over held items, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove every item matching `predicate`, returning how many were removed
    pub fn remove_where<F: FnMut(&T) -> bool>(&mut self, mut predicate: F) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !predicate(item));
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Observability counters
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            len: self.items.len(),
            capacity: self.capacity,
            occupancy_pct: self.items.len() as f64 / self.capacity as f64 * 100.0,
            total_writes: self.total_writes,
            total_flushes: self.total_flushes,
            total_overflows: self.total_overflows,
            failed_handoffs: self.failed_handoffs,
        }
    }
}

impl<T> Default for AggregationBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
