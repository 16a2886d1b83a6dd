//! # Ergane Core
//!
//! Core abstractions for the Ergane managed task-execution library.
//!
//! Named after Athena Ergane, patroness of craft and work, Ergane wraps a
//! pool of worker threads and turns raw units of work into observable,
//! cancellable, composable managed tasks.
//!
//! ## Design Principles
//!
//! - **Observable by construction**: every submission yields a handle with
//!   lifecycle timestamps, callbacks, and a hang check
//! - **Memory safety**: leverage Rust's ownership system for safe concurrency
//! - **Composability**: small, focused components that work together
//! - **No ambient leakage**: submitter-scoped context is bracketed around
//!   exactly one task execution on the worker thread

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod config;
pub mod context;
pub mod error;
pub mod task;

pub use config::{ConfigBuilder, ExecutorConfig, QueuePolicy, ThreadKind, UNBOUNDED};
pub use context::{CapturedContext, ContextRegistry, ContextService, ContextSnapshot};
pub use error::{ExecutorError, ExecutorResult, TaskError, TaskResult};
pub use task::{Dispatcher, TaskCompleter, TaskHandle, TaskProbe};

/// A unique identifier for tasks within the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Create a task ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-unique task ID.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}
