//! Policy-driven work queue shared by a pool of workers.
//!
//! One queue serves many producers (submitting threads) and many consumers
//! (workers). The discipline comes from [`QueuePolicy`]: hand-off refuses
//! anything an idle worker cannot pick up immediately, bounded refuses at
//! capacity, unbounded always accepts. Refusal is returned to the caller,
//! which may grow the pool or reject the submission.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ergane_core::{QueuePolicy, TaskProbe};

/// A queued unit of work: the instrumented run closure plus the erased
/// observational probe of its task handle.
pub struct Work {
    run: Box<dyn FnOnce() + Send>,
    probe: Arc<dyn TaskProbe>,
}

impl Work {
    /// Pair a run closure with its task probe.
    #[must_use]
    pub fn new(run: Box<dyn FnOnce() + Send>, probe: Arc<dyn TaskProbe>) -> Self {
        Self { run, probe }
    }

    /// Execute the work on the current thread.
    pub fn run(self) {
        (self.run)();
    }

    /// The observational probe of the underlying task.
    #[must_use]
    pub fn probe(&self) -> &Arc<dyn TaskProbe> {
        &self.probe
    }

    /// Discard the work, resolving its task as cancelled.
    pub fn abort(self) -> Arc<dyn TaskProbe> {
        self.probe.cancel(true);
        self.probe
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work").field("id", &self.probe.id()).finish()
    }
}

/// Outcome of a worker's [`WorkQueue::take`].
#[derive(Debug)]
pub enum Take {
    /// A unit of work was dequeued
    Work(Work),
    /// The keep-alive wait elapsed with nothing to do
    TimedOut,
    /// The queue is closed and drained; the worker should exit
    Closed,
}

struct QueueState {
    items: VecDeque<Work>,
    waiting: usize,
    closed: bool,
}

/// Multi-producer multi-consumer FIFO work queue.
#[allow(clippy::module_name_repetitions)]
pub struct WorkQueue {
    policy: QueuePolicy,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WorkQueue {
    /// Create a queue with the given discipline.
    #[must_use]
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                waiting: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// The queue discipline.
    #[must_use]
    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// The buffering capacity, `None` for unbounded.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        match self.policy {
            QueuePolicy::Handoff => Some(0),
            QueuePolicy::Bounded(n) => Some(n),
            QueuePolicy::Unbounded => None,
        }
    }

    /// Try to enqueue work without blocking.
    ///
    /// # Errors
    /// Returns the work back when the queue is closed, at capacity, or (for
    /// hand-off) no idle worker is currently waiting to pick it up.
    pub fn offer(&self, work: Work) -> Result<(), Work> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(work);
        }
        let accepted = match self.policy {
            QueuePolicy::Handoff => state.waiting > state.items.len(),
            QueuePolicy::Bounded(capacity) => state.items.len() < capacity,
            QueuePolicy::Unbounded => true,
        };
        if !accepted {
            return Err(work);
        }
        state.items.push_back(work);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeue work, waiting up to `timeout` (or indefinitely for `None`).
    ///
    /// Returns [`Take::Closed`] once the queue is closed *and* drained, so
    /// work queued before a graceful shutdown still runs.
    pub fn take(&self, timeout: Option<Duration>) -> Take {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(work) = state.items.pop_front() {
                return Take::Work(work);
            }
            if state.closed {
                return Take::Closed;
            }
            state.waiting += 1;
            state = match deadline {
                None => self.available.wait(state).unwrap(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        state.waiting -= 1;
                        return Take::TimedOut;
                    }
                    self.available.wait_timeout(state, remaining).unwrap().0
                }
            };
            state.waiting -= 1;
        }
    }

    /// Close the queue; pending work remains for workers to drain.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.available.notify_all();
    }

    /// Close the queue and remove everything still buffered.
    pub fn close_and_drain(&self) -> Vec<Work> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        let drained = state.items.drain(..).collect();
        self.available.notify_all();
        drained
    }

    /// Number of buffered units of work.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only snapshot of the probes of buffered work, FIFO order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn TaskProbe>> {
        self.state
            .lock()
            .unwrap()
            .items
            .iter()
            .map(|work| work.probe.clone())
            .collect()
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}
