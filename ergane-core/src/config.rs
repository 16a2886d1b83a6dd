//! Executor configuration records and queue policy selection.

use core::time::Duration;

use crate::error::{ExecutorError, ExecutorResult};

/// Sentinel queue capacity selecting an unbounded FIFO queue.
pub const UNBOUNDED: usize = usize::MAX;

/// The kind of thread resource an executor is built over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadKind {
    /// A pool sized between `core_size` and `max_size` workers
    #[default]
    Pooled,
    /// A single dedicated worker; sizing knobs collapse to one thread
    Single,
}

/// Queue discipline derived from the configured queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Zero-capacity direct hand-off; a submission must be picked up by an
    /// idle worker immediately or it is refused
    Handoff,
    /// Bounded FIFO of the given capacity
    Bounded(usize),
    /// Unbounded FIFO
    Unbounded,
}

/// Immutable sizing knobs for a managed executor.
///
/// The record is read at construction only; a running executor never
/// observes later mutations of the record it was built from.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Executor name, used for worker thread names and registry lookup
    pub name: String,
    /// Pool or single-thread execution
    pub thread_kind: ThreadKind,
    /// Workers kept alive regardless of idleness
    pub core_size: usize,
    /// Upper bound on transient workers created under load
    pub max_size: usize,
    /// Idle time after which workers beyond `core_size` retire
    pub keep_alive: Duration,
    /// `0` selects hand-off, [`UNBOUNDED`] an unbounded FIFO, any other
    /// value a bounded FIFO of that capacity
    pub queue_capacity: usize,
    /// Niceness-style worker priority, applied best-effort on Linux
    pub priority: i32,
    /// Run time beyond which a started, unfinished task is reported hung
    pub hung_task_threshold: Option<Duration>,
}

impl ExecutorConfig {
    /// Create a configuration with default sizing for the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Derive the queue discipline from the configured capacity.
    #[must_use]
    pub fn queue_policy(&self) -> QueuePolicy {
        match self.queue_capacity {
            0 => QueuePolicy::Handoff,
            UNBOUNDED => QueuePolicy::Unbounded,
            n => QueuePolicy::Bounded(n),
        }
    }

    /// Effective core pool size after the thread kind is applied.
    #[must_use]
    pub fn effective_core_size(&self) -> usize {
        match self.thread_kind {
            ThreadKind::Pooled => self.core_size,
            ThreadKind::Single => 1,
        }
    }

    /// Effective maximum pool size after the thread kind is applied.
    #[must_use]
    pub fn effective_max_size(&self) -> usize {
        match self.thread_kind {
            ThreadKind::Pooled => self.max_size,
            ThreadKind::Single => 1,
        }
    }

    /// Validate the record.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty name, a zero maximum size, or
    /// a core size exceeding the maximum.
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.name.trim().is_empty() {
            return Err(ExecutorError::InvalidArgument(
                "executor name must not be empty".into(),
            ));
        }
        if self.max_size == 0 {
            return Err(ExecutorError::InvalidArgument(
                "maximum pool size must be at least 1".into(),
            ));
        }
        if self.core_size > self.max_size {
            return Err(ExecutorError::InvalidArgument(format!(
                "core size {} exceeds maximum size {}",
                self.core_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "ergane".into(),
            thread_kind: ThreadKind::Pooled,
            core_size: 5,
            max_size: 25,
            keep_alive: Duration::from_millis(5000),
            queue_capacity: UNBOUNDED,
            priority: 0,
            hung_task_threshold: None,
        }
    }
}

/// Fluent builder for [`ExecutorConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: ExecutorConfig,
}

impl ConfigBuilder {
    /// Create a builder with default sizing for the given executor name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ExecutorConfig::new(name),
        }
    }

    /// Set the thread kind.
    #[must_use]
    pub fn thread_kind(mut self, kind: ThreadKind) -> Self {
        self.config.thread_kind = kind;
        self
    }

    /// Set the core pool size.
    #[must_use]
    pub fn core_size(mut self, size: usize) -> Self {
        self.config.core_size = size;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    /// Set the idle keep-alive for workers beyond the core size.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set the queue capacity (`0` hand-off, [`UNBOUNDED`], or bounded).
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the worker thread priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.config.priority = priority;
        self
    }

    /// Set the hung-task detection threshold.
    #[must_use]
    pub fn hung_task_threshold(mut self, threshold: Duration) -> Self {
        self.config.hung_task_threshold = Some(threshold);
        self
    }

    /// Validate and produce the configuration record.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the record fails [`ExecutorConfig::validate`].
    pub fn build(self) -> ExecutorResult<ExecutorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
