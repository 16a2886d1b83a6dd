//! Delayed and periodic scheduling on top of the managed executor.
//!
//! A dedicated timer thread orders entries in a binary heap by fire time
//! and hands due work to the wrapped pool, so firings run on pool workers
//! with the same context bracketing and instrumentation as direct
//! submissions. Periodic entries re-enqueue themselves after each firing;
//! firings of one task never overlap.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use ergane_core::{
    CapturedContext, ContextRegistry, ExecutorConfig, ExecutorError, ExecutorResult,
    TaskCompleter, TaskError, TaskHandle, TaskId, TaskProbe, TaskResult,
};

use crate::executor::{instrumented, panic_message, ManagedExecutor};
use crate::queue::Work;

/// How the gap between periodic firings is measured.
#[derive(Debug, Clone, Copy)]
enum PeriodKind {
    /// Start-to-start spacing
    Rate(Duration),
    /// Completion-to-start spacing
    Delay(Duration),
}

struct ScheduleState {
    periodic: bool,
    next_fire: Mutex<Instant>,
    runs: AtomicU64,
}

/// A task handle augmented with scheduling state.
///
/// For a periodic task the same handle is reused across firings: timestamps
/// reflect the latest firing, the run count grows by one per completed
/// firing, and the handle only becomes terminal through cancellation or a
/// failed firing.
pub struct ScheduledTaskHandle<T> {
    handle: TaskHandle<T>,
    sched: Arc<ScheduleState>,
}

impl<T> Clone for ScheduledTaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            sched: self.sched.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> ScheduledTaskHandle<T> {
    /// Whether this handle repeats at a fixed rate or delay.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.sched.periodic
    }

    /// Time remaining until the next firing, saturating at zero.
    ///
    /// Decreases monotonically toward zero between firings.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.sched
            .next_fire
            .lock()
            .unwrap()
            .saturating_duration_since(Instant::now())
    }

    /// Number of completed firings.
    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.sched.runs.load(Ordering::Relaxed)
    }

    /// The underlying task handle.
    #[must_use]
    pub fn handle(&self) -> &TaskHandle<T> {
        &self.handle
    }

    /// The task's unique identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.handle.id()
    }

    /// Stop future firings; a firing already in progress runs to
    /// completion. See [`TaskHandle::cancel`].
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.handle.cancel(may_interrupt)
    }

    /// Whether the series reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Whether the terminal state is cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// The captured failure, if a firing failed.
    #[must_use]
    pub fn cause(&self) -> Option<TaskError> {
        self.handle.cause()
    }

    /// Block until the handle is terminal and return the outcome.
    ///
    /// # Errors
    /// As [`TaskHandle::get`]; for a periodic task this only returns once
    /// the series is cancelled or fails.
    pub fn get(&self) -> TaskResult<T>
    where
        T: Clone,
    {
        self.handle.get()
    }

    /// Bounded wait for the outcome; see [`TaskHandle::get_timeout`].
    ///
    /// # Errors
    /// As [`TaskHandle::get_timeout`].
    pub fn get_timeout(&self, timeout: Duration) -> TaskResult<T>
    where
        T: Clone,
    {
        self.handle.get_timeout(timeout)
    }

    /// Register a success callback; see [`TaskHandle::on_success`].
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.handle.on_success(callback);
        self
    }

    /// Register a failure callback; see [`TaskHandle::on_failure`].
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.handle.on_failure(callback);
        self
    }
}

impl<T> std::fmt::Debug for ScheduledTaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTaskHandle")
            .field("periodic", &self.sched.periodic)
            .finish()
    }
}

struct PeriodicTask {
    kind: PeriodKind,
    body: Box<dyn Fn() + Send + Sync>,
    context: Mutex<CapturedContext>,
    completer: TaskCompleter<()>,
    probe: Arc<dyn TaskProbe>,
    sched: Arc<ScheduleState>,
    executor: ManagedExecutor,
    timer: Weak<TimerShared>,
}

enum Firing {
    Once {
        run: Box<dyn FnOnce() + Send>,
        probe: Arc<dyn TaskProbe>,
    },
    Periodic(Arc<PeriodicTask>),
}

impl Firing {
    fn probe(&self) -> &Arc<dyn TaskProbe> {
        match self {
            Self::Once { probe, .. } => probe,
            Self::Periodic(task) => &task.probe,
        }
    }
}

struct TimerEntry {
    fire_at: Instant,
    seq: u64,
    firing: Firing,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // BinaryHeap is a max-heap; reverse so the earliest deadline surfaces.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
    closed: bool,
}

struct TimerShared {
    executor: ManagedExecutor,
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

/// A managed executor extended with delayed and periodic scheduling.
pub struct ManagedScheduledExecutor {
    executor: ManagedExecutor,
    timer: Arc<TimerShared>,
}

impl ManagedScheduledExecutor {
    /// Build a scheduled executor from a configuration record and a live
    /// context-service registry.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the configuration fails validation.
    pub fn new(config: ExecutorConfig, contexts: Arc<ContextRegistry>) -> ExecutorResult<Self> {
        let executor = ManagedExecutor::new(config, contexts)?;
        let timer = Arc::new(TimerShared {
            executor: executor.clone(),
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                seq: 0,
                closed: false,
            }),
            wakeup: Condvar::new(),
        });
        let driver = timer.clone();
        let name = format!("{}-timer", executor.name());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&driver))
            .map_err(|error| {
                ExecutorError::RejectedExecution(format!(
                    "failed to spawn timer thread '{name}': {error}"
                ))
            })?;
        Ok(Self { executor, timer })
    }

    /// Build a scheduled executor with default configuration for the name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the name is empty.
    pub fn with_name(name: impl Into<String>) -> ExecutorResult<Self> {
        Self::new(ExecutorConfig::new(name), Arc::new(ContextRegistry::new()))
    }

    /// The wrapped managed executor and its management API.
    #[must_use]
    pub fn executor(&self) -> &ManagedExecutor {
        &self.executor
    }

    /// Submit for immediate execution; see [`ManagedExecutor::submit`].
    ///
    /// # Errors
    /// As [`ManagedExecutor::submit`].
    pub fn submit<F, R>(&self, work: F) -> ExecutorResult<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        self.executor.submit(work)
    }

    /// Schedule a one-shot unit of work after `delay`.
    ///
    /// Context is captured on this thread now; the handle's `delay()`
    /// decreases monotonically toward zero until the firing.
    ///
    /// # Errors
    /// Returns `RejectedExecution` after shutdown.
    pub fn schedule<F, R>(&self, work: F, delay: Duration) -> ExecutorResult<ScheduledTaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + Sync + 'static,
    {
        let (handle, completer) =
            TaskHandle::create(self.executor.config().hung_task_threshold);
        let context = self.executor.context_registry().capture();
        let run = instrumented(self.executor.shared_ref(), context, completer, Box::new(work));
        self.executor.track(&handle.probe());
        let fire_at = Instant::now() + delay;
        let sched = Arc::new(ScheduleState {
            periodic: false,
            next_fire: Mutex::new(fire_at),
            runs: AtomicU64::new(0),
        });
        self.push_entry(
            fire_at,
            Firing::Once {
                run,
                probe: handle.probe(),
            },
        )?;
        Ok(ScheduledTaskHandle { handle, sched })
    }

    /// Schedule a periodic unit of work with start-to-start spacing.
    ///
    /// A slow firing compresses the gap before the next one; two firings
    /// never run concurrently.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero period, `RejectedExecution`
    /// after shutdown.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        work: F,
        initial_delay: Duration,
        period: Duration,
    ) -> ExecutorResult<ScheduledTaskHandle<()>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(ExecutorError::InvalidArgument(
                "fixed-rate period must be positive".into(),
            ));
        }
        self.schedule_periodic(work, initial_delay, PeriodKind::Rate(period))
    }

    /// Schedule a periodic unit of work with completion-to-start spacing.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a zero delay, `RejectedExecution`
    /// after shutdown.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        work: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> ExecutorResult<ScheduledTaskHandle<()>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if delay.is_zero() {
            return Err(ExecutorError::InvalidArgument(
                "fixed-delay spacing must be positive".into(),
            ));
        }
        self.schedule_periodic(work, initial_delay, PeriodKind::Delay(delay))
    }

    fn schedule_periodic<F>(
        &self,
        work: F,
        initial_delay: Duration,
        kind: PeriodKind,
    ) -> ExecutorResult<ScheduledTaskHandle<()>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (handle, completer) =
            TaskHandle::create(self.executor.config().hung_task_threshold);
        let context = self.executor.context_registry().capture();
        let fire_at = Instant::now() + initial_delay;
        let sched = Arc::new(ScheduleState {
            periodic: true,
            next_fire: Mutex::new(fire_at),
            runs: AtomicU64::new(0),
        });
        let task = Arc::new(PeriodicTask {
            kind,
            body: Box::new(work),
            context: Mutex::new(context),
            completer,
            probe: handle.probe(),
            sched: sched.clone(),
            executor: self.executor.clone(),
            timer: Arc::downgrade(&self.timer),
        });
        self.executor.track(&handle.probe());
        self.push_entry(fire_at, Firing::Periodic(task))?;
        Ok(ScheduledTaskHandle { handle, sched })
    }

    fn push_entry(&self, fire_at: Instant, firing: Firing) -> ExecutorResult<()> {
        if self.executor.is_shutdown() {
            return Err(ExecutorError::RejectedExecution(format!(
                "executor '{}' is shut down",
                self.executor.name()
            )));
        }
        push_timer_entry(&self.timer, fire_at, firing)
    }

    /// Stop the timer and the pool; queued pool work still runs, while
    /// scheduled-but-unfired entries resolve cancelled.
    pub fn shutdown(&self) {
        self.close_timer();
        self.executor.shutdown();
    }

    /// Stop the timer and the pool, discarding queued work; see
    /// [`ManagedExecutor::shutdown_now`].
    pub fn shutdown_now(&self) -> Vec<Arc<dyn TaskProbe>> {
        self.close_timer();
        self.executor.shutdown_now()
    }

    /// Whether the executor no longer accepts work.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.executor.is_shutdown()
    }

    /// Block until termination or the timeout; see
    /// [`ManagedExecutor::await_termination`].
    pub fn await_termination(&self, timeout: Duration) -> bool {
        self.executor.await_termination(timeout)
    }

    fn close_timer(&self) {
        let mut state = self.timer.state.lock().unwrap();
        state.closed = true;
        self.timer.wakeup.notify_all();
    }
}

impl std::fmt::Debug for ManagedScheduledExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedScheduledExecutor")
            .field("executor", &self.executor)
            .finish()
    }
}

fn push_timer_entry(
    timer: &Arc<TimerShared>,
    fire_at: Instant,
    firing: Firing,
) -> ExecutorResult<()> {
    let mut state = timer.state.lock().unwrap();
    if state.closed {
        return Err(ExecutorError::RejectedExecution(format!(
            "timer for executor '{}' is shut down",
            timer.executor.name()
        )));
    }
    state.seq += 1;
    let seq = state.seq;
    state.heap.push(TimerEntry {
        fire_at,
        seq,
        firing,
    });
    timer.wakeup.notify_one();
    Ok(())
}

fn timer_loop(timer: &Arc<TimerShared>) {
    debug!(executor = %timer.executor.name(), "timer started");
    loop {
        let firing = {
            let mut state = timer.state.lock().unwrap();
            loop {
                if state.closed {
                    for entry in state.heap.drain() {
                        entry.firing.probe().cancel(true);
                    }
                    debug!(executor = %timer.executor.name(), "timer exiting");
                    return;
                }
                let now = Instant::now();
                let next_deadline = state.heap.peek().map(|entry| entry.fire_at);
                match next_deadline {
                    Some(fire_at) if fire_at <= now => {
                        break state.heap.pop().map(|entry| entry.firing);
                    }
                    Some(fire_at) => {
                        let pause = fire_at.saturating_duration_since(now);
                        state = timer.wakeup.wait_timeout(state, pause).unwrap().0;
                    }
                    None => {
                        state = timer.wakeup.wait(state).unwrap();
                    }
                }
            }
        };
        if let Some(firing) = firing {
            dispatch_firing(timer, firing);
        }
    }
}

fn dispatch_firing(timer: &Arc<TimerShared>, firing: Firing) {
    if firing.probe().is_done() {
        // Cancelled while waiting in the heap.
        return;
    }
    match firing {
        Firing::Once { run, probe } => {
            if let Err(error) = timer.executor.enqueue(Work::new(run, probe.clone())) {
                warn!(%error, "dropping due one-shot firing");
                probe.cancel(true);
            }
        }
        Firing::Periodic(task) => {
            let runner = task.clone();
            let run: Box<dyn FnOnce() + Send> = Box::new(move || run_periodic(&runner));
            if let Err(error) = timer.executor.enqueue(Work::new(run, task.probe.clone())) {
                warn!(%error, "dropping due periodic firing");
                task.probe.cancel(true);
            }
        }
    }
}

/// One firing of a periodic task, run on a pool worker.
fn run_periodic(task: &Arc<PeriodicTask>) {
    if !task.completer.begin() {
        return;
    }
    let shared = task.executor.shared_ref();
    let fire_start = Instant::now();
    shared.active.fetch_add(1, Ordering::Relaxed);
    let outcome = {
        let mut context = task.context.lock().unwrap();
        context.apply_all();
        let outcome = catch_unwind(AssertUnwindSafe(|| (task.body)()));
        context.unapply_all();
        outcome
    };
    shared.active.fetch_sub(1, Ordering::Relaxed);
    shared.completed.fetch_add(1, Ordering::Relaxed);

    match outcome {
        Err(payload) => {
            // A failed firing terminates the series.
            task.completer
                .fail(TaskError::Failed(panic_message(&*payload)));
        }
        Ok(()) => {
            task.sched.runs.fetch_add(1, Ordering::Relaxed);
            if !task.completer.end_cycle() {
                return;
            }
            let next = match task.kind {
                PeriodKind::Rate(period) => {
                    let target = fire_start + period;
                    let now = Instant::now();
                    if target > now {
                        target
                    } else {
                        now
                    }
                }
                PeriodKind::Delay(delay) => Instant::now() + delay,
            };
            *task.sched.next_fire.lock().unwrap() = next;
            match task.timer.upgrade() {
                Some(timer) => {
                    if push_timer_entry(&timer, next, Firing::Periodic(task.clone())).is_err() {
                        task.probe.cancel(true);
                    }
                }
                None => {
                    task.probe.cancel(true);
                }
            }
        }
    }
}
