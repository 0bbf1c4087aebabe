//! Control-plane task primitives.
//!
//! [`OperationQueue`] runs deferred operations one at a time. Ordinary operations
//! run in enqueue order; operations injected with
//! [`OperationQueue::enqueue_at_top`] jump ahead of everything that has not started
//! yet. Independent queues never wait on each other.

mod metrics;
mod queue;

pub use metrics::{IncCounterOnDrop, OperationQueueMetrics};
pub use queue::{Operation, OperationError, OperationQueue};
