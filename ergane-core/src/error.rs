//! Error types and handling for the Ergane runtime.

use core::fmt;

/// Errors reported synchronously to the submitting thread.
///
/// Execution-time failures never surface here; they resolve the task handle
/// and are observed through `get`, `cause`, or failure callbacks.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// A supplied argument or configuration value is malformed
    InvalidArgument(String),
    /// The executor refused the submission (shut down, or saturated)
    RejectedExecution(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::RejectedExecution(msg) => write!(f, "execution rejected: {msg}"),
        }
    }
}

impl std::error::Error for ExecutorError {}

/// Errors observed through a task handle.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The unit of work panicked; the payload is captured on the handle
    Failed(String),
    /// The handle was cancelled before or during execution
    Cancelled,
    /// A bounded wait elapsed before the task reached a terminal state
    Timeout,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "task failed: {msg}"),
            Self::Cancelled => write!(f, "task was cancelled"),
            Self::Timeout => write!(f, "wait timed out before task completion"),
        }
    }
}

impl std::error::Error for TaskError {}

/// A result type for submission-time operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// A result type for task outcomes.
pub type TaskResult<T> = Result<T, TaskError>;
