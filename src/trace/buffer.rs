//! Lock-free ring buffer between emitters and the trace processor
//!
//! Multi-producer push on the hot path, single-consumer drain in the
//! background worker. `push` never blocks: on overflow the event is
//! dropped (drop-newest) and a counter is incremented. Dropped events
//! never enter the hash chain, so a full buffer cannot corrupt it.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use super::raw::RawEvent;

/// Default buffer capacity
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Bounded lock-free queue of raw events
#[derive(Debug)]
pub struct TraceRingBuffer {
    queue: ArrayQueue<RawEvent>,
    total_pushed: AtomicU64,
    total_drained: AtomicU64,
    dropped: AtomicU64,
}

impl TraceRingBuffer {
    /// Create a buffer with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_drained: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a buffer with [`DEFAULT_BUFFER_CAPACITY`]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }

    /// Push a raw event; returns `false` if the buffer is full and the
    /// event was dropped
    pub fn push(&self, event: RawEvent) -> bool {
        match self.queue.push(event) {
            Ok(()) => {
                self.total_pushed.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop up to `max` events in FIFO order
    pub fn drain(&self, max: usize) -> Vec<RawEvent> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(event) => out.push(event),
                None => break,
            }
        }
        self.total_drained
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    /// Pop every queued event
    pub fn drain_all(&self) -> Vec<RawEvent> {
        self.drain(usize::MAX)
    }

    /// Current queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue capacity
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Occupancy in `[0.0, 1.0]`
    pub fn pressure(&self) -> f32 {
        self.queue.len() as f32 / self.queue.capacity() as f32
    }

    /// Events dropped due to overflow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events accepted since creation
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    /// Events drained since creation
    pub fn total_drained(&self) -> u64 {
        self.total_drained.load(Ordering::Relaxed)
    }

    /// Snapshot of buffer counters
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            capacity: self.capacity(),
            len: self.len(),
            pressure: self.pressure(),
            total_pushed: self.total_pushed(),
            total_drained: self.total_drained(),
            dropped: self.dropped(),
        }
    }
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferStats {
    /// Queue capacity
    pub capacity: usize,
    /// Current queue length
    pub len: usize,
    /// Occupancy in `[0.0, 1.0]`
    pub pressure: f32,
    /// Events accepted since creation
    pub total_pushed: u64,
    /// Events drained since creation
    pub total_drained: u64,
    /// Events dropped due to overflow
    pub dropped: u64,
}
