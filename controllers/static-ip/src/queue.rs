//! Owner-keyed work queue.
//!
//! Each resource kind gets one queue. Keys are enqueued by watchers and by
//! delayed requeues; the run loop hands them to a bounded number of
//! concurrent workers with these guarantees:
//!
//! - a key is never reconciled by two workers at once,
//! - enqueueing a key that is already queued is a no-op,
//! - enqueueing a key that is running marks it dirty; it runs once more
//!   after the current pass finishes,
//! - a newer requeue decision for a key replaces the pending one,
//! - on shutdown nothing new starts and in-flight passes are awaited.

use futures::{FutureExt, StreamExt};
use resource_store::ObjectKey;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info};

/// What to do with a key after a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay
    Requeue(Duration),
    /// Wait for the next change event
    AwaitChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Queued,
    Running { dirty: bool },
}

/// Sending half of a queue; cheap to clone
#[derive(Debug, Clone)]
pub struct QueueHandle {
    name: &'static str,
    tx: mpsc::UnboundedSender<ObjectKey>,
}

impl QueueHandle {
    /// Schedules a reconciliation of `key`
    pub fn enqueue(&self, key: ObjectKey) {
        if self.tx.send(key).is_err() {
            debug!("{} queue is shut down; dropping event", self.name);
        }
    }
}

/// Receiving half of a queue, consumed by [`WorkQueue::run`]
#[derive(Debug)]
pub struct WorkQueue {
    name: &'static str,
    rx: mpsc::UnboundedReceiver<ObjectKey>,
    lanes: HashMap<ObjectKey, Lane>,
    ready: VecDeque<ObjectKey>,
    delayed: DelayQueue<ObjectKey>,
    timers: HashMap<ObjectKey, delay_queue::Key>,
}

impl WorkQueue {
    /// Creates a queue and its handle
    pub fn new(name: &'static str) -> (Self, QueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            name,
            rx,
            lanes: HashMap::new(),
            ready: VecDeque::new(),
            delayed: DelayQueue::new(),
            timers: HashMap::new(),
        };
        (queue, QueueHandle { name, tx })
    }

    fn push(&mut self, key: ObjectKey) {
        match self.lanes.get_mut(&key) {
            Some(Lane::Queued) => {}
            Some(Lane::Running { dirty }) => *dirty = true,
            None => {
                self.lanes.insert(key.clone(), Lane::Queued);
                self.ready.push_back(key);
            }
        }
    }

    fn schedule(&mut self, key: ObjectKey, action: Action) {
        if let Some(timer) = self.timers.remove(&key) {
            self.delayed.remove(&timer);
        }
        if let Action::Requeue(delay) = action {
            let timer = self.delayed.insert(key.clone(), delay);
            self.timers.insert(key, timer);
        }
    }

    fn finish(&mut self, key: ObjectKey, action: Action) {
        let dirty = matches!(self.lanes.remove(&key), Some(Lane::Running { dirty: true }));
        if dirty {
            self.push(key.clone());
        }
        self.schedule(key, action);
    }

    /// Processes keys until `shutdown` is cancelled, then drains in-flight work.
    ///
    /// A pass that panics is logged and retried after `panic_delay`.
    pub async fn run<F, Fut>(
        mut self,
        concurrency: usize,
        panic_delay: Duration,
        shutdown: CancellationToken,
        reconcile: F,
    ) where
        F: Fn(ObjectKey) -> Fut,
        Fut: Future<Output = Action> + Send + 'static,
    {
        let concurrency = concurrency.max(1);
        let mut running: JoinSet<(ObjectKey, Action)> = JoinSet::new();
        info!("{} queue started (concurrency {})", self.name, concurrency);

        loop {
            while running.len() < concurrency {
                let Some(key) = self.ready.pop_front() else { break };
                self.lanes.insert(key.clone(), Lane::Running { dirty: false });

                let name = self.name;
                let pass = AssertUnwindSafe(reconcile(key.clone())).catch_unwind();
                running.spawn(async move {
                    match pass.await {
                        Ok(action) => (key, action),
                        Err(_) => {
                            error!("{} reconciliation of {} panicked", name, key);
                            (key, Action::Requeue(panic_delay))
                        }
                    }
                });
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(done) = running.join_next(), if !running.is_empty() => match done {
                    Ok((key, action)) => self.finish(key, action),
                    // Tasks are never aborted and panics are caught inside
                    Err(e) => error!("{} worker failed: {}", self.name, e),
                },
                Some(key) = self.rx.recv() => self.push(key),
                Some(expired) = self.delayed.next(), if !self.delayed.is_empty() => {
                    let key = expired.into_inner();
                    self.timers.remove(&key);
                    self.push(key);
                }
                else => break,
            }
        }

        info!("{} queue stopping; waiting for {} in-flight reconciliations", self.name, running.len());
        while running.join_next().await.is_some() {}
    }
}
