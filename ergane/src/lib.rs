//! # Ergane - Managed Task Execution
//!
//! Ergane is a managed task-execution library for Rust. Named after Athena
//! Ergane, patroness of craft and work, it wraps a pool of worker threads
//! and turns raw units of work into observable, cancellable, composable
//! tasks: every submission returns a handle carrying lifecycle timestamps,
//! completion callbacks, and a hang check, and ambient context captured on
//! the submitting thread is reapplied on the worker for the duration of
//! exactly one task.
//!
//! ## Features
//!
//! - **Sized pools**: core/maximum worker counts with keep-alive retirement
//! - **Queue policies**: hand-off, bounded, or unbounded FIFO from one knob
//! - **Task handles**: timestamps, blocking/bounded waits, fluent callbacks
//! - **Context propagation**: pluggable snapshot services bracketing each run
//! - **Hang detection**: observational reporting of stuck work
//! - **Scheduling**: one-shot delays, fixed-rate and fixed-delay periods
//!
//! ## Example
//!
//! ```
//! use ergane::{ConfigBuilder, ExecutorRegistry};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), ergane::ExecutorError> {
//! let registry = ExecutorRegistry::new();
//! let config = ConfigBuilder::new("workers")
//!     .core_size(2)
//!     .max_size(8)
//!     .build()?;
//! let executor = registry.new_executor("workers", config, Vec::new())?;
//!
//! let handle = executor.submit(|| 6 * 7)?;
//! assert_eq!(handle.get(), Ok(42));
//!
//! registry.shutdown_all();
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

// Re-export core functionality
pub use ergane_core::{
    CapturedContext, ConfigBuilder, ContextRegistry, ContextService, ContextSnapshot, Dispatcher,
    ExecutorConfig, ExecutorError, ExecutorResult, QueuePolicy, TaskError, TaskHandle, TaskId,
    TaskProbe, TaskResult, ThreadKind, UNBOUNDED,
};

// Re-export executor functionality
pub use ergane_executor::{ManagedExecutor, ManagedScheduledExecutor, ScheduledTaskHandle};

/// A process-wide registry of named managed executors.
///
/// The surrounding framework obtains executors from here, keyed by name and
/// a configuration record; repeated lookups of a name return the instance
/// built first. Each executor owns a live per-executor context-service
/// registry seeded from the service list supplied at construction.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: Mutex<HashMap<String, ManagedExecutor>>,
    scheduled: Mutex<HashMap<String, Arc<ManagedScheduledExecutor>>>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the managed executor registered under `name`.
    ///
    /// The resolved `name` overrides the one carried in the configuration
    /// record. `services` seeds the executor's live context registry; more
    /// services can be registered or removed through
    /// [`ManagedExecutor::context_registry`] while the executor runs.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a malformed configuration or a
    /// duplicate context-service name.
    pub fn new_executor(
        &self,
        name: impl Into<String>,
        config: ExecutorConfig,
        services: Vec<Arc<dyn ContextService>>,
    ) -> ExecutorResult<ManagedExecutor> {
        let name = name.into();
        let mut executors = self.executors.lock().unwrap();
        if let Some(existing) = executors.get(&name) {
            return Ok(existing.clone());
        }
        let executor = ManagedExecutor::new(
            ExecutorConfig {
                name: name.clone(),
                ..config
            },
            seeded_registry(services)?,
        )?;
        debug!(executor = %name, "registered managed executor");
        executors.insert(name, executor.clone());
        Ok(executor)
    }

    /// Get or create the managed scheduled executor registered under `name`.
    ///
    /// # Errors
    /// As [`ExecutorRegistry::new_executor`].
    pub fn new_scheduled_executor(
        &self,
        name: impl Into<String>,
        config: ExecutorConfig,
        services: Vec<Arc<dyn ContextService>>,
    ) -> ExecutorResult<Arc<ManagedScheduledExecutor>> {
        let name = name.into();
        let mut scheduled = self.scheduled.lock().unwrap();
        if let Some(existing) = scheduled.get(&name) {
            return Ok(existing.clone());
        }
        let executor = Arc::new(ManagedScheduledExecutor::new(
            ExecutorConfig {
                name: name.clone(),
                ..config
            },
            seeded_registry(services)?,
        )?);
        debug!(executor = %name, "registered managed scheduled executor");
        scheduled.insert(name, executor.clone());
        Ok(executor)
    }

    /// Look up an executor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ManagedExecutor> {
        self.executors.lock().unwrap().get(name).cloned()
    }

    /// Look up a scheduled executor by name.
    #[must_use]
    pub fn get_scheduled(&self, name: &str) -> Option<Arc<ManagedScheduledExecutor>> {
        self.scheduled.lock().unwrap().get(name).cloned()
    }

    /// Names of every registered executor, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.lock().unwrap().keys().cloned().collect();
        names.extend(self.scheduled.lock().unwrap().keys().cloned());
        names
    }

    /// Shut down every registered executor gracefully.
    pub fn shutdown_all(&self) {
        for executor in self.executors.lock().unwrap().values() {
            executor.shutdown();
        }
        for executor in self.scheduled.lock().unwrap().values() {
            executor.shutdown();
        }
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.lock().unwrap().len())
            .field("scheduled", &self.scheduled.lock().unwrap().len())
            .finish()
    }
}

fn seeded_registry(
    services: Vec<Arc<dyn ContextService>>,
) -> ExecutorResult<Arc<ContextRegistry>> {
    let registry = Arc::new(ContextRegistry::new());
    for service in services {
        registry.register(service)?;
    }
    Ok(registry)
}
