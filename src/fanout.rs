//! Two-barrier fan-out task group
//!
//! The lock-handoff pattern: an operation that must touch every instance of
//! a challenge holds the coarse challenge lock only long enough for one
//! worker per instance to take that instance's own lock. Each worker signals
//! the first barrier ("handoff") once its fine-grained lock is held; the
//! coordinator then releases the coarse lock while the slow work continues,
//! and waits on the second barrier ("join") for per-worker results.

use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::errors::{self, Error, Result};

/// Token for the handoff barrier. Signals on drop as well, so a worker that
/// fails or panics before reaching the handoff point still releases the
/// coordinator.
pub struct Handoff {
    tx: Option<mpsc::Sender<()>>,
}

impl Handoff {
    /// Mark the handoff point passed.
    pub fn passed(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            // Capacity equals the worker count and each token signals once,
            // so this cannot fill up; a dropped receiver means the
            // coordinator has already moved on.
            let _ = tx.try_send(());
        }
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        self.signal();
    }
}

/// A group of spawned workers with two wait points.
pub struct TaskGroup<R> {
    tasks: JoinSet<Result<R>>,
    handoff_rx: mpsc::Receiver<()>,
    pending_handoffs: usize,
}

impl<R: Send + 'static> TaskGroup<R> {
    /// Spawn one worker per item. Each worker receives the item and its
    /// [`Handoff`] token.
    pub fn spawn<T, F, Fut>(items: Vec<T>, worker: F) -> Self
    where
        T: Send + 'static,
        F: Fn(T, Handoff) -> Fut,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let total = items.len();
        let (tx, handoff_rx) = mpsc::channel(total.max(1));
        let mut tasks = JoinSet::new();
        for item in items {
            let handoff = Handoff {
                tx: Some(tx.clone()),
            };
            tasks.spawn(worker(item, handoff));
        }
        Self {
            tasks,
            handoff_rx,
            pending_handoffs: total,
        }
    }

    /// First barrier: every worker has signalled (lock held or worker
    /// already finished).
    pub async fn handoff(&mut self) {
        while self.pending_handoffs > 0 {
            if self.handoff_rx.recv().await.is_none() {
                break;
            }
            self.pending_handoffs -= 1;
        }
    }

    /// Second barrier: every worker finished; per-worker results collected.
    /// A panicked worker surfaces as an internal error; its siblings run to
    /// completion regardless.
    pub async fn join(mut self) -> Vec<Result<R>> {
        let mut results = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            results.push(match joined {
                Ok(result) => result,
                Err(err) => Err(Error::internal(
                    "fanout",
                    format!("worker panicked: {err}"),
                )),
            });
        }
        results
    }

    /// Second barrier plus aggregation per the error-propagation policy.
    pub async fn join_aggregated(self, operation: &str) -> Result<Vec<R>> {
        let results = self.join().await;
        errors::aggregate(operation, results)
    }
}
