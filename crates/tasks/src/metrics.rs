//! Operation Queue Metrics

use core::fmt;
use metrics::{Counter, Gauge};

/// Operation Queue Metrics
#[derive(Clone, Debug)]
pub struct OperationQueueMetrics {
    /// Number of operations appended to the tail
    pub(crate) enqueued_total: Counter,
    /// Number of operations injected at the head
    pub(crate) enqueued_at_top_total: Counter,
    /// Number of operations that settled, whatever the outcome
    pub(crate) settled_total: Counter,
    /// Number of operations whose body panicked
    pub(crate) panicked_total: Counter,
    /// Operations waiting to start
    pub(crate) pending: Gauge,
}

impl OperationQueueMetrics {
    /// Creates the metric handles for the queue with the given name.
    pub fn new(queue: &'static str) -> Self {
        Self {
            enqueued_total: metrics::counter!("operation_queue.enqueued_total", "queue" => queue),
            enqueued_at_top_total: metrics::counter!(
                "operation_queue.enqueued_at_top_total",
                "queue" => queue
            ),
            settled_total: metrics::counter!("operation_queue.settled_total", "queue" => queue),
            panicked_total: metrics::counter!("operation_queue.panicked_total", "queue" => queue),
            pending: metrics::gauge!("operation_queue.pending", "queue" => queue),
        }
    }

    /// Records a new operation and the resulting backlog.
    pub(crate) fn inc_enqueued(&self, at_top: bool, pending: usize) {
        if at_top {
            self.enqueued_at_top_total.increment(1);
        } else {
            self.enqueued_total.increment(1);
        }
        self.pending.set(pending as f64);
    }

    /// Updates the backlog gauge after an operation was taken off the queue.
    pub(crate) fn set_pending(&self, pending: usize) {
        self.pending.set(pending as f64);
    }

    /// Increments the counter for panicked operations.
    pub(crate) fn inc_panicked(&self) {
        self.panicked_total.increment(1);
    }

    /// Returns a guard that counts the operation as settled when dropped.
    pub(crate) fn settle_guard(&self) -> IncCounterOnDrop {
        IncCounterOnDrop::new(self.settled_total.clone())
    }
}

/// Helper type for increasing counters even if a task fails
pub struct IncCounterOnDrop(Counter);

impl fmt::Debug for IncCounterOnDrop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IncCounterOnDrop").finish()
    }
}

impl IncCounterOnDrop {
    /// Creates a new instance of `IncCounterOnDrop` with the given counter.
    pub const fn new(counter: Counter) -> Self {
        Self(counter)
    }
}

impl Drop for IncCounterOnDrop {
    /// Increment the counter when the instance is dropped.
    fn drop(&mut self) {
        self.0.increment(1);
    }
}
