//! The managed executor: pool ownership, submission, and observability.
//!
//! Pool growth follows the classic discipline: below the core size every
//! submission starts a worker; at or above it the queue is offered; when the
//! queue refuses and the pool is below its maximum a transient worker is
//! started with the work as its first item; otherwise the submission is
//! rejected. Workers beyond the core size retire after the configured
//! keep-alive of idleness.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use ergane_core::{
    CapturedContext, ContextRegistry, Dispatcher, ExecutorConfig, ExecutorError, ExecutorResult,
    TaskCompleter, TaskError, TaskHandle, TaskProbe,
};

use crate::queue::{Take, Work, WorkQueue};

/// Prune the tracking table whenever it grows past this many entries.
const TRACK_PRUNE_THRESHOLD: usize = 64;

pub(crate) struct Shared {
    pub(crate) config: ExecutorConfig,
    pub(crate) contexts: Arc<ContextRegistry>,
    pub(crate) queue: WorkQueue,
    pool: Mutex<PoolState>,
    terminated: Condvar,
    shutdown: AtomicBool,
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) active: AtomicUsize,
    largest: AtomicUsize,
    tracked: Mutex<Vec<Weak<dyn TaskProbe>>>,
}

struct PoolState {
    workers: usize,
    next_worker: u64,
}

/// A managed, observable thread-pool executor.
///
/// Cloning is cheap and yields another reference to the same pool.
#[derive(Clone)]
pub struct ManagedExecutor {
    shared: Arc<Shared>,
}

impl ManagedExecutor {
    /// Build an executor from a validated configuration record and a live
    /// context-service registry.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the configuration fails validation.
    pub fn new(config: ExecutorConfig, contexts: Arc<ContextRegistry>) -> ExecutorResult<Self> {
        config.validate()?;
        let queue = WorkQueue::new(config.queue_policy());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                contexts,
                queue,
                pool: Mutex::new(PoolState {
                    workers: 0,
                    next_worker: 0,
                }),
                terminated: Condvar::new(),
                shutdown: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                largest: AtomicUsize::new(0),
                tracked: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Build an executor with default configuration for the given name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the name is empty.
    pub fn with_name(name: impl Into<String>) -> ExecutorResult<Self> {
        Self::new(ExecutorConfig::new(name), Arc::new(ContextRegistry::new()))
    }

    // --- submission -----------------------------------------------------

    /// Submit a unit of work computing a value.
    ///
    /// Context is captured on this thread before enqueue; the returned
    /// handle resolves to the computed value, or to the captured failure if
    /// the work panics. Failures never propagate to the submitting thread.
    ///
    /// # Errors
    /// Returns `RejectedExecution` after shutdown or when the queue policy
    /// refuses the work with the pool at its maximum size.
    pub fn submit<F, R>(&self, work: F) -> ExecutorResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let (handle, completer) = TaskHandle::create(self.shared.config.hung_task_threshold);
        let context = self.shared.contexts.capture();
        let run = instrumented(&self.shared, context, completer, Box::new(work));
        self.track(&handle.probe());
        self.enqueue(Work::new(run, handle.probe()))?;
        Ok(handle)
    }

    /// Submit a unit of work with no computed value; the handle resolves to
    /// the supplied `result` on success.
    ///
    /// # Errors
    /// As [`ManagedExecutor::submit`].
    pub fn submit_with_result<F, T>(&self, work: F, result: T) -> ExecutorResult<TaskHandle<T>>
    where
        F: FnOnce() + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.submit(move || {
            work();
            result
        })
    }

    /// Submit every unit of work, block until all complete (or the optional
    /// timeout elapses), and return the handles in submission order.
    ///
    /// Failures in individual work items are recorded on their handles, not
    /// aggregated into this call. On timeout the unfinished handles are
    /// cancelled cooperatively before returning.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty batch; `RejectedExecution` as
    /// [`ManagedExecutor::submit`], after cancelling the part of the batch
    /// already submitted.
    pub fn invoke_all<F, R>(
        &self,
        works: Vec<F>,
        timeout: Option<Duration>,
    ) -> ExecutorResult<Vec<TaskHandle<R>>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        if works.is_empty() {
            return Err(ExecutorError::InvalidArgument(
                "invoke_all requires at least one unit of work".into(),
            ));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut handles = Vec::with_capacity(works.len());
        for work in works {
            match self.submit(work) {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for handle in &handles {
                        handle.cancel(true);
                    }
                    return Err(error);
                }
            }
        }
        for handle in &handles {
            let finished = match deadline {
                None => {
                    handle.wait();
                    true
                }
                Some(deadline) => {
                    handle.wait_timeout(deadline.saturating_duration_since(Instant::now()))
                }
            };
            if !finished {
                for unfinished in &handles {
                    if !unfinished.is_done() {
                        unfinished.cancel(true);
                    }
                }
                break;
            }
        }
        Ok(handles)
    }

    pub(crate) fn shared_ref(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Enqueue pre-instrumented work on behalf of the scheduled executor.
    pub(crate) fn enqueue(&self, work: Work) -> ExecutorResult<()> {
        if self.is_shutdown() {
            return Err(ExecutorError::RejectedExecution(format!(
                "executor '{}' is shut down",
                self.shared.config.name
            )));
        }
        let accepted = self.dispatch_work(work);
        if accepted.is_ok() {
            self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    fn dispatch_work(&self, work: Work) -> ExecutorResult<()> {
        {
            let mut pool = self.shared.pool.lock().unwrap();
            if pool.workers < self.shared.config.effective_core_size() {
                return self.spawn_worker(&mut pool, Some(work));
            }
        }
        match self.shared.queue.offer(work) {
            Ok(()) => {
                // A zero-core pool still needs someone to drain the queue.
                let mut pool = self.shared.pool.lock().unwrap();
                if pool.workers == 0 {
                    self.spawn_worker(&mut pool, None)?;
                }
                Ok(())
            }
            Err(work) => {
                let mut pool = self.shared.pool.lock().unwrap();
                if pool.workers < self.shared.config.effective_max_size() {
                    self.spawn_worker(&mut pool, Some(work))
                } else {
                    drop(pool);
                    drop(work);
                    warn!(executor = %self.shared.config.name, "submission rejected: queue saturated");
                    Err(ExecutorError::RejectedExecution(format!(
                        "queue saturated for executor '{}'",
                        self.shared.config.name
                    )))
                }
            }
        }
    }

    fn spawn_worker(&self, pool: &mut PoolState, first: Option<Work>) -> ExecutorResult<()> {
        let worker_id = pool.next_worker;
        pool.next_worker += 1;
        pool.workers += 1;
        self.shared.largest.fetch_max(pool.workers, Ordering::Relaxed);

        let shared = self.shared.clone();
        let name = format!("{}-worker-{}", self.shared.config.name, worker_id);
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&shared, first));
        if let Err(error) = spawned {
            pool.workers -= 1;
            warn!(worker = %name, %error, "failed to spawn worker thread");
            return Err(ExecutorError::RejectedExecution(format!(
                "failed to spawn worker thread '{name}': {error}"
            )));
        }
        Ok(())
    }

    /// Record a task in the tracking table, once per task (not per firing).
    pub(crate) fn track(&self, probe: &Arc<dyn TaskProbe>) {
        let mut tracked = self.shared.tracked.lock().unwrap();
        if tracked.len() >= TRACK_PRUNE_THRESHOLD {
            tracked.retain(|weak| weak.upgrade().is_some_and(|probe| !probe.is_done()));
        }
        tracked.push(Arc::downgrade(probe));
    }

    // --- lifecycle ------------------------------------------------------

    /// Stop accepting submissions; queued work still runs to completion.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(executor = %self.shared.config.name, "shutting down");
        self.shared.queue.close();
        self.wake_if_empty();
    }

    /// Stop accepting submissions, discard queued-but-unstarted work
    /// (resolving each discarded handle as cancelled), and cooperatively
    /// cancel running tracked tasks. Returns the probes of the discarded
    /// work.
    pub fn shutdown_now(&self) -> Vec<Arc<dyn TaskProbe>> {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        debug!(executor = %self.shared.config.name, "shutting down now");
        let discarded: Vec<Arc<dyn TaskProbe>> = self
            .shared
            .queue
            .close_and_drain()
            .into_iter()
            .map(Work::abort)
            .collect();
        let running: Vec<Arc<dyn TaskProbe>> = {
            let tracked = self.shared.tracked.lock().unwrap();
            tracked.iter().filter_map(Weak::upgrade).collect()
        };
        for probe in running {
            if probe.is_running() {
                probe.cancel(true);
            }
        }
        self.wake_if_empty();
        discarded
    }

    fn wake_if_empty(&self) {
        let pool = self.shared.pool.lock().unwrap();
        if pool.workers == 0 {
            self.shared.terminated.notify_all();
        }
    }

    /// Whether the executor no longer accepts submissions.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Whether shutdown completed: no submissions accepted and every worker
    /// has exited.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.shared.pool.lock().unwrap().workers == 0
    }

    /// Block until termination or the timeout; returns whether the executor
    /// terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pool = self.shared.pool.lock().unwrap();
        while !(self.is_shutdown() && pool.workers == 0) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            pool = self.shared.terminated.wait_timeout(pool, remaining).unwrap().0;
        }
        true
    }

    // --- management and observability -----------------------------------
    //
    // All read-only and approximate under concurrent load; callers must not
    // assume atomicity across two separate calls.

    /// The executor's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// The configuration record the executor was built from.
    #[must_use]
    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.config
    }

    /// The live context-service registry consulted at each submission.
    #[must_use]
    pub fn context_registry(&self) -> &Arc<ContextRegistry> {
        &self.shared.contexts
    }

    /// Number of workers currently executing work.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Configured core pool size.
    #[must_use]
    pub fn core_pool_size(&self) -> usize {
        self.shared.config.effective_core_size()
    }

    /// Configured maximum pool size.
    #[must_use]
    pub fn maximum_pool_size(&self) -> usize {
        self.shared.config.effective_max_size()
    }

    /// Largest number of workers the pool has reached.
    #[must_use]
    pub fn largest_pool_size(&self) -> usize {
        self.shared.largest.load(Ordering::Relaxed)
    }

    /// Current number of workers.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.shared.pool.lock().unwrap().workers
    }

    /// Best-effort count of completed task executions (every firing of a
    /// periodic task counts once).
    #[must_use]
    pub fn completed_task_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Best-effort count of accepted task submissions.
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    /// Configured keep-alive for workers beyond the core size.
    #[must_use]
    pub fn keep_alive_time(&self) -> Duration {
        self.shared.config.keep_alive
    }

    /// Number of buffered units of work.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Read-only snapshot of the probes of queued work, FIFO order.
    #[must_use]
    pub fn queued_tasks(&self) -> Vec<Arc<dyn TaskProbe>> {
        self.shared.queue.snapshot()
    }

    /// Snapshot of tracked, still-running tasks whose run time exceeds the
    /// configured hung-task threshold.
    ///
    /// Purely observational: hang detection never cancels or interrupts a
    /// task automatically.
    #[must_use]
    pub fn hung_tasks(&self) -> Vec<Arc<dyn TaskProbe>> {
        let tracked = self.shared.tracked.lock().unwrap();
        tracked
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|probe| probe.is_hung())
            .collect()
    }
}

impl Dispatcher for ManagedExecutor {
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) -> ExecutorResult<()> {
        self.submit(move || job()).map(|_| ())
    }
}

impl std::fmt::Debug for ManagedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedExecutor")
            .field("name", &self.shared.config.name)
            .field("pool_size", &self.pool_size())
            .field("queue_len", &self.queue_len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Wrap a unit of work with context bracketing, instrumentation, and handle
/// resolution. The returned closure is what workers actually run.
pub(crate) fn instrumented<R: Send + Sync + 'static>(
    shared: &Arc<Shared>,
    mut context: CapturedContext,
    completer: TaskCompleter<R>,
    body: Box<dyn FnOnce() -> R + Send>,
) -> Box<dyn FnOnce() + Send> {
    let shared = shared.clone();
    Box::new(move || {
        if !completer.begin() {
            // Cancelled before a worker picked it up; skip entirely.
            return;
        }
        shared.active.fetch_add(1, Ordering::Relaxed);
        context.apply_all();
        let outcome = catch_unwind(AssertUnwindSafe(body));
        context.unapply_all();
        shared.active.fetch_sub(1, Ordering::Relaxed);
        shared.completed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(value) => completer.complete(value),
            Err(payload) => completer.fail(TaskError::Failed(panic_message(&payload))),
        }
    })
}

/// Render a panic payload for capture on the task handle.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}

fn worker_loop(shared: &Arc<Shared>, first: Option<Work>) {
    apply_thread_priority(shared.config.priority);
    debug!(executor = %shared.config.name, "worker started");
    if let Some(work) = first {
        work.run();
    }
    loop {
        match shared.queue.take(Some(shared.config.keep_alive)) {
            Take::Work(work) => work.run(),
            Take::Closed => break,
            Take::TimedOut => {
                let mut pool = shared.pool.lock().unwrap();
                if pool.workers > shared.config.effective_core_size() {
                    pool.workers -= 1;
                    if pool.workers == 0 {
                        shared.terminated.notify_all();
                    }
                    debug!(executor = %shared.config.name, "idle worker retiring");
                    return;
                }
            }
        }
    }
    let mut pool = shared.pool.lock().unwrap();
    pool.workers -= 1;
    if pool.workers == 0 {
        shared.terminated.notify_all();
    }
    debug!(executor = %shared.config.name, "worker exiting");
}

#[cfg(target_os = "linux")]
fn apply_thread_priority(priority: i32) {
    if priority == 0 {
        return;
    }
    // SAFETY: adjusts the niceness of the calling thread only.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, priority) };
    if rc != 0 {
        debug!(priority, "unable to apply worker thread priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_thread_priority(_priority: i32) {}
