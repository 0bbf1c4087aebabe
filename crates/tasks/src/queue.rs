//! FIFO operation queue with head injection.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::metrics::OperationQueueMetrics;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Why an operation did not produce a value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperationError<E> {
    /// The operation body returned an error.
    #[error("{0}")]
    Failed(E),
    /// The operation body panicked; the queue moved on to the next operation.
    #[error("operation panicked: {0}")]
    Panicked(String),
    /// The worker was torn down before the operation settled (runtime shutdown).
    #[error("operation dropped before it settled")]
    Dropped,
}

impl<E> OperationError<E> {
    /// Maps the error returned by the operation body, keeping queue-level failures.
    pub fn map_failed<F>(self, f: impl FnOnce(E) -> F) -> OperationError<F> {
        match self {
            Self::Failed(e) => OperationError::Failed(f(e)),
            Self::Panicked(msg) => OperationError::Panicked(msg),
            Self::Dropped => OperationError::Dropped,
        }
    }
}

/// Pending result of a queued operation.
///
/// Dropping it does not cancel the operation; the queue still runs it in turn.
#[must_use = "the result of a queued operation should be awaited or explicitly ignored"]
pub struct Operation<T, E> {
    rx: oneshot::Receiver<Result<T, OperationError<E>>>,
}

impl<T, E> fmt::Debug for Operation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").finish_non_exhaustive()
    }
}

impl<T, E> Future for Operation<T, E> {
    type Output = Result<T, OperationError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OperationError::Dropped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Job>,
    running: bool,
}

struct Inner {
    name: &'static str,
    state: Mutex<QueueState>,
    metrics: OperationQueueMetrics,
}

/// Runs at most one operation at a time.
///
/// Cheap to clone; clones share the same backlog. Must be used from within a tokio
/// runtime because operations are always started on a spawned worker task.
#[derive(Clone)]
pub struct OperationQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("OperationQueue")
            .field("name", &self.inner.name)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}

impl OperationQueue {
    /// Creates an empty queue. The name labels log lines and metrics.
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(QueueState::default()),
                metrics: OperationQueueMetrics::new(name),
            }),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Number of operations waiting to start (the running one is not counted).
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether no operation is running or waiting.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        !state.running && state.pending.is_empty()
    }

    /// Appends an operation; it starts once every earlier operation has settled.
    pub fn enqueue<T, E, F, Fut>(&self, task: F) -> Operation<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.push(task, false)
    }

    /// Inserts an operation ahead of every operation that has not started yet.
    ///
    /// Operations injected this way run last-in first-out among themselves.
    pub fn enqueue_at_top<T, E, F, Fut>(&self, task: F) -> Operation<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.push(task, true)
    }

    fn push<T, E, F, Fut>(&self, task: F, at_top: bool) -> Operation<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        let job: Job = Box::new(move || {
            async move {
                let _settled = inner.metrics.settle_guard();
                let outcome = AssertUnwindSafe(async move { task().await })
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(OperationError::Failed(err)),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(queue = inner.name, %message, "queued operation panicked");
                        inner.metrics.inc_panicked();
                        Err(OperationError::Panicked(message))
                    }
                };
                // The caller may have dropped the handle.
                let _ = tx.send(result);
            }
            .boxed()
        });

        let start_worker = {
            let mut state = self.inner.state.lock();
            if at_top {
                state.pending.push_front(job);
            } else {
                state.pending.push_back(job);
            }
            self.inner.metrics.inc_enqueued(at_top, state.pending.len());
            trace!(queue = self.inner.name, at_top, pending = state.pending.len(), "operation enqueued");

            !std::mem::replace(&mut state.running, true)
        };

        if start_worker {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drain());
        }

        Operation { rx }
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        loop {
            let job = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(job) => {
                        self.metrics.set_pending(state.pending.len());
                        job
                    }
                    None => {
                        state.running = false;
                        return;
                    }
                }
            };
            job().await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
