//! Managed task handles.
//!
//! A [`TaskHandle`] is created once per submitted unit of work and tracks
//! its whole lifecycle: creation, start, completion, cancellation, the
//! result or captured failure, registered callbacks, and the hang check.
//! The write side is a single-use [`TaskCompleter`] held by the executor;
//! callers only ever observe the handle.
//!
//! ## Terminal states
//!
//! Exactly one of *resolved with a value*, *resolved with an error*, or
//! *cancelled* is the terminal state. A handle never transitions out of a
//! terminal state; a result computed after cancellation is discarded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{ExecutorResult, TaskError, TaskResult};
use crate::TaskId;

/// A sink that runs callback jobs on its own workers.
///
/// Implemented by the managed executor so callbacks can be dispatched to an
/// explicitly supplied executor instead of the resolving thread.
pub trait Dispatcher: Send + Sync {
    /// Hand a callback job to this dispatcher's workers.
    ///
    /// # Errors
    /// Returns `RejectedExecution` when the dispatcher no longer accepts
    /// work; the callback is then dropped.
    fn dispatch(&self, job: Box<dyn FnOnce() + Send>) -> ExecutorResult<()>;
}

/// Read-only, type-erased view of a tracked task.
///
/// The executor's tracking table and queue views hold probes so tasks of
/// heterogeneous result types can be observed uniformly.
pub trait TaskProbe: Send + Sync {
    /// The task's unique identifier.
    fn id(&self) -> TaskId;

    /// When the task was submitted.
    fn created_at(&self) -> Instant;

    /// When a worker began executing the task, if it has started.
    fn started_at(&self) -> Option<Instant>;

    /// When the task reached a terminal state (or, for a periodic task,
    /// when its latest firing completed).
    fn completed_at(&self) -> Option<Instant>;

    /// Elapsed run time: completion − start, or now − start while running.
    fn run_time(&self) -> Option<Duration>;

    /// Whether the task reached a terminal state.
    fn is_done(&self) -> bool;

    /// Whether the terminal state is cancellation.
    fn is_cancelled(&self) -> bool;

    /// Whether a worker is currently executing the task.
    fn is_running(&self) -> bool;

    /// Whether the task started, has not completed, and has been running
    /// longer than the configured hung-task threshold.
    fn is_hung(&self) -> bool;

    /// Attempt to cancel the task; see [`TaskHandle::cancel`].
    fn cancel(&self, may_interrupt: bool) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Terminal,
}

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type FailureCallback = Box<dyn FnOnce(&TaskError) + Send>;

struct StateCell<T> {
    phase: Phase,
    result: Option<Arc<TaskResult<T>>>,
    started_at: Option<Instant>,
    completed_at: Option<Instant>,
    on_success: Vec<SuccessCallback<T>>,
    on_failure: Vec<FailureCallback>,
}

/// Shared state behind a [`TaskHandle`] and its [`TaskCompleter`].
pub struct TaskCore<T> {
    id: TaskId,
    created_at: Instant,
    hung_threshold: Option<Duration>,
    state: Mutex<StateCell<T>>,
    done: Condvar,
}

impl<T: Send + Sync + 'static> TaskCore<T> {
    fn new(hung_threshold: Option<Duration>) -> Self {
        Self {
            id: TaskId::next(),
            created_at: Instant::now(),
            hung_threshold,
            state: Mutex::new(StateCell {
                phase: Phase::Pending,
                result: None,
                started_at: None,
                completed_at: None,
                on_success: Vec::new(),
                on_failure: Vec::new(),
            }),
            done: Condvar::new(),
        }
    }

    /// Move to the terminal state and fire callbacks, unless a terminal
    /// state was already reached (in which case `result` is discarded).
    fn resolve(&self, result: TaskResult<T>) {
        let (shared, success, failure) = {
            let mut cell = self.state.lock().unwrap();
            if cell.phase == Phase::Terminal {
                return;
            }
            let shared = Arc::new(result);
            cell.phase = Phase::Terminal;
            cell.result = Some(shared.clone());
            cell.completed_at = Some(Instant::now());
            let success = std::mem::take(&mut cell.on_success);
            let failure = std::mem::take(&mut cell.on_failure);
            self.done.notify_all();
            (shared, success, failure)
        };
        // The kind that does not match the outcome is dropped unfired.
        match shared.as_ref() {
            Ok(value) => {
                for callback in success {
                    run_callback(|| callback(value));
                }
            }
            Err(error) => {
                for callback in failure {
                    run_callback(|| callback(error));
                }
            }
        }
    }

    fn try_cancel(&self, may_interrupt: bool) -> bool {
        let (_success, failure) = {
            let mut cell = self.state.lock().unwrap();
            match cell.phase {
                Phase::Terminal => return false,
                Phase::Running if !may_interrupt => return false,
                Phase::Pending | Phase::Running => {
                    cell.phase = Phase::Terminal;
                    cell.result = Some(Arc::new(Err(TaskError::Cancelled)));
                    cell.completed_at = Some(Instant::now());
                    self.done.notify_all();
                    (
                        std::mem::take(&mut cell.on_success),
                        std::mem::take(&mut cell.on_failure),
                    )
                }
            }
        };
        let error = TaskError::Cancelled;
        for callback in failure {
            run_callback(|| callback(&error));
        }
        true
    }
}

/// Run a user callback, containing its panics so they cannot take down the
/// resolving worker thread.
fn run_callback(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("task callback panicked; continuing");
    }
}

impl<T: Send + Sync + 'static> TaskProbe for TaskCore<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn created_at(&self) -> Instant {
        self.created_at
    }

    fn started_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().started_at
    }

    fn completed_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().completed_at
    }

    fn run_time(&self) -> Option<Duration> {
        let cell = self.state.lock().unwrap();
        let started = cell.started_at?;
        match cell.completed_at {
            Some(completed) => Some(completed.saturating_duration_since(started)),
            None => Some(started.elapsed()),
        }
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Terminal
    }

    fn is_cancelled(&self) -> bool {
        matches!(
            self.state.lock().unwrap().result.as_deref(),
            Some(Err(TaskError::Cancelled))
        )
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Running
    }

    fn is_hung(&self) -> bool {
        let Some(threshold) = self.hung_threshold else {
            return false;
        };
        let cell = self.state.lock().unwrap();
        match (cell.phase, cell.started_at) {
            (Phase::Running, Some(started)) => started.elapsed() > threshold,
            _ => false,
        }
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        self.try_cancel(may_interrupt)
    }
}

/// The observable side of a submitted unit of work.
///
/// Handles are cheaply cloneable; every clone observes the same task.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> TaskHandle<T> {
    /// Create a pending handle and its single-use write side.
    ///
    /// `hung_threshold` is the executor's configured hung-task threshold,
    /// fixed for the lifetime of the task.
    #[must_use]
    pub fn create(hung_threshold: Option<Duration>) -> (Self, TaskCompleter<T>) {
        let core = Arc::new(TaskCore::new(hung_threshold));
        (
            Self { core: core.clone() },
            TaskCompleter { core },
        )
    }

    /// The task's unique identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// When the task was submitted.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.core.created_at
    }

    /// When a worker began executing the task. `None` until then.
    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        TaskProbe::started_at(self.core.as_ref())
    }

    /// When the task reached a terminal state. `None` until then.
    #[must_use]
    pub fn completed_at(&self) -> Option<Instant> {
        TaskProbe::completed_at(self.core.as_ref())
    }

    /// Elapsed run time: completion − start, or now − start while running.
    /// `None` before the task has started.
    #[must_use]
    pub fn run_time(&self) -> Option<Duration> {
        TaskProbe::run_time(self.core.as_ref())
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        TaskProbe::is_done(self.core.as_ref())
    }

    /// Whether the terminal state is cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        TaskProbe::is_cancelled(self.core.as_ref())
    }

    /// Whether the task started, has not completed, and has exceeded the
    /// executor's hung-task threshold.
    #[must_use]
    pub fn is_hung(&self) -> bool {
        TaskProbe::is_hung(self.core.as_ref())
    }

    /// The captured failure, if the task resolved with an error.
    #[must_use]
    pub fn cause(&self) -> Option<TaskError> {
        match self.core.state.lock().unwrap().result.as_deref() {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// Attempt to move the task to the cancelled terminal state.
    ///
    /// A pending task is cancelled outright and skipped when dequeued. A
    /// running task is cancelled only when `may_interrupt` is set;
    /// cancellation is cooperative, so the work in flight runs to its own
    /// end and its result is discarded. Returns `false` when the task is
    /// already terminal or running without `may_interrupt`.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.core.try_cancel(may_interrupt)
    }

    /// Block until the task reaches a terminal state.
    pub fn wait(&self) {
        let mut cell = self.core.state.lock().unwrap();
        while cell.phase != Phase::Terminal {
            cell = self.core.done.wait(cell).unwrap();
        }
    }

    /// Block until terminal or the timeout elapses; returns whether the
    /// task reached a terminal state.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.core.state.lock().unwrap();
        while cell.phase != Phase::Terminal {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            cell = self.core.done.wait_timeout(cell, remaining).unwrap().0;
        }
        true
    }

    /// Block until terminal and return the value or the captured failure.
    ///
    /// # Errors
    /// Returns the captured `TaskError` when the task failed or was
    /// cancelled.
    pub fn get(&self) -> TaskResult<T>
    where
        T: Clone,
    {
        self.wait();
        self.take_result()
    }

    /// Bounded wait for the result.
    ///
    /// A timeout never cancels the underlying task; cancel explicitly to
    /// stop the work.
    ///
    /// # Errors
    /// Returns `TaskError::Timeout` when the wait elapses, otherwise as
    /// [`TaskHandle::get`].
    pub fn get_timeout(&self, timeout: Duration) -> TaskResult<T>
    where
        T: Clone,
    {
        let deadline = Instant::now() + timeout;
        let mut cell = self.core.state.lock().unwrap();
        while cell.phase != Phase::Terminal {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TaskError::Timeout);
            }
            let (next, wait) = self.core.done.wait_timeout(cell, remaining).unwrap();
            cell = next;
            if wait.timed_out() && cell.phase != Phase::Terminal {
                return Err(TaskError::Timeout);
            }
        }
        drop(cell);
        self.take_result()
    }

    /// Non-blocking result read; `None` while the task is not terminal.
    #[must_use]
    pub fn try_get(&self) -> Option<TaskResult<T>>
    where
        T: Clone,
    {
        if self.is_done() {
            Some(self.take_result())
        } else {
            None
        }
    }

    fn take_result(&self) -> TaskResult<T>
    where
        T: Clone,
    {
        let cell = self.core.state.lock().unwrap();
        match cell.result.as_deref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(error)) => Err(error.clone()),
            // wait() returned, so the result is present.
            None => Err(TaskError::Failed("task resolved without a result".into())),
        }
    }

    /// Register a callback fired once with the value when the task
    /// resolves successfully.
    ///
    /// Callbacks registered before resolution run on the resolving thread,
    /// after resolution, in registration order. Callbacks registered after
    /// resolution run immediately on the registering thread. Returns the
    /// handle for fluent chaining.
    pub fn on_success<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.add_success(Box::new(callback))
    }

    /// Register a success callback dispatched to the supplied executor
    /// instead of the resolving thread.
    pub fn on_success_via<F>(&self, dispatcher: Arc<dyn Dispatcher>, callback: F) -> &Self
    where
        T: Clone,
        F: FnOnce(T) + Send + 'static,
    {
        self.add_success(Box::new(move |value: &T| {
            let value = value.clone();
            if dispatcher.dispatch(Box::new(move || callback(value))).is_err() {
                warn!("callback executor rejected success callback; dropping");
            }
        }))
    }

    /// Register a callback fired once with the error when the task fails
    /// or is cancelled.
    ///
    /// Ordering and immediate-fire semantics match [`TaskHandle::on_success`].
    pub fn on_failure<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.add_failure(Box::new(callback))
    }

    /// Register a failure callback dispatched to the supplied executor
    /// instead of the resolving thread.
    pub fn on_failure_via<F>(&self, dispatcher: Arc<dyn Dispatcher>, callback: F) -> &Self
    where
        F: FnOnce(TaskError) + Send + 'static,
    {
        self.add_failure(Box::new(move |error: &TaskError| {
            let error = error.clone();
            if dispatcher.dispatch(Box::new(move || callback(error))).is_err() {
                warn!("callback executor rejected failure callback; dropping");
            }
        }))
    }

    fn add_success(&self, callback: SuccessCallback<T>) -> &Self {
        let fire_now = {
            let mut cell = self.core.state.lock().unwrap();
            if cell.phase == Phase::Terminal {
                cell.result.clone()
            } else {
                cell.on_success.push(callback);
                return self;
            }
        };
        if let Some(result) = fire_now {
            if let Ok(value) = result.as_ref() {
                run_callback(|| callback(value));
            }
        }
        self
    }

    fn add_failure(&self, callback: FailureCallback) -> &Self {
        let fire_now = {
            let mut cell = self.core.state.lock().unwrap();
            if cell.phase == Phase::Terminal {
                cell.result.clone()
            } else {
                cell.on_failure.push(callback);
                return self;
            }
        };
        if let Some(result) = fire_now {
            if let Err(error) = result.as_ref() {
                run_callback(|| callback(error));
            }
        }
        self
    }

    /// A type-erased observational view of this task.
    #[must_use]
    pub fn probe(&self) -> Arc<dyn TaskProbe> {
        self.core.clone()
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .finish()
    }
}

/// The single-use write side of a [`TaskHandle`], held by the executor.
pub struct TaskCompleter<T> {
    core: Arc<TaskCore<T>>,
}

impl<T: Send + Sync + 'static> TaskCompleter<T> {
    /// Mark the task running and stamp its start time.
    ///
    /// Returns `false` when the task was cancelled before starting; the
    /// worker must then skip the body entirely.
    pub fn begin(&self) -> bool {
        let mut cell = self.core.state.lock().unwrap();
        if cell.phase == Phase::Terminal {
            return false;
        }
        cell.phase = Phase::Running;
        cell.started_at = Some(Instant::now());
        true
    }

    /// Resolve the task with a value; no-op if already terminal.
    pub fn complete(&self, value: T) {
        self.core.resolve(Ok(value));
    }

    /// Resolve the task with a captured failure; no-op if already terminal.
    pub fn fail(&self, error: TaskError) {
        self.core.resolve(Err(error));
    }

    /// Finish one firing of a periodic task without resolving the handle:
    /// stamps the completion time and returns the task to the pending
    /// phase for its next firing. Returns `false` when the task became
    /// terminal during the firing.
    pub fn end_cycle(&self) -> bool {
        let mut cell = self.core.state.lock().unwrap();
        if cell.phase == Phase::Terminal {
            return false;
        }
        cell.phase = Phase::Pending;
        cell.completed_at = Some(Instant::now());
        true
    }

    /// A type-erased observational view of this task.
    #[must_use]
    pub fn probe(&self) -> Arc<dyn TaskProbe> {
        self.core.clone()
    }
}

impl<T> std::fmt::Debug for TaskCompleter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCompleter")
            .field("id", &self.core.id)
            .finish()
    }
}
