//! Admission control for the pending-operation queue.
//!
//! Producers reserve a slot before their operation is handed to the
//! connection. When every slot is taken the reservation fails at once, so
//! callers see `QueueFull` instead of memory growing without bound. Slots
//! are released when an operation leaves the queue: sent, failed or
//! cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Result of attempting to admit an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was reserved.
    Admitted,
    /// Every slot is taken.
    Backpressure,
}

/// Lock-free counter of queued operations with a fixed capacity.
#[derive(Debug)]
pub struct QueueGauge {
    pending: AtomicUsize,
    capacity: usize,
}

impl QueueGauge {
    /// Creates a gauge admitting up to `capacity` operations. A capacity of
    /// zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Reserves a slot for a new operation.
    pub fn try_admit(&self) -> Admission {
        match self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            }) {
            Ok(_) => Admission::Admitted,
            Err(_) => Admission::Backpressure,
        }
    }

    /// Puts a retried operation back into the count. Retries were admitted
    /// once already and are never rejected.
    pub fn readmit(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Frees a slot.
    pub fn release(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Returns the number of operations currently counted.
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if new operations would be rejected.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Returns the capacity of the gauge.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
