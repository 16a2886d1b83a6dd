//! Execution-context capture and propagation across thread hops.
//!
//! A [`ContextService`] can snapshot ambient, submitter-thread-scoped state
//! at submission time and reapply it on whichever worker thread runs the
//! task, for the duration of that one task only. Services are registered in
//! a live [`ContextRegistry`]; each submission iterates a stable snapshot of
//! the service list so concurrent registration never produces a torn read.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::error::{ExecutorError, ExecutorResult};

/// A named provider of execution-context snapshots.
///
/// `prepare` is called on the *submitting* thread at submission time. The
/// service itself is stateless; it may read ambient thread-scoped state to
/// produce the snapshot.
pub trait ContextService: Send + Sync {
    /// Unique name identifying this service in a registry.
    fn name(&self) -> &str;

    /// Capture a snapshot of the current ambient context.
    fn prepare(&self) -> Box<dyn ContextSnapshot>;
}

/// A captured context snapshot, reapplied around one task execution.
///
/// `apply` runs on the worker thread immediately before the task body and
/// `unapply` immediately after it, whether the body succeeded, failed, or
/// was cancelled mid-run. Snapshots are never shared across tasks. A
/// periodic task reuses its snapshot set sequentially, one bracketed firing
/// at a time, so implementations must tolerate repeated apply/unapply pairs.
pub trait ContextSnapshot: Send {
    /// Install the captured context on the current (worker) thread.
    fn apply(&mut self);

    /// Remove the captured context from the current (worker) thread.
    fn unapply(&mut self);
}

/// The ordered snapshots captured for a single submission.
pub struct CapturedContext {
    snapshots: Vec<(String, Box<dyn ContextSnapshot>)>,
}

impl CapturedContext {
    /// A capture with no snapshots.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            snapshots: Vec::new(),
        }
    }

    /// Number of captured snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no context was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Apply every snapshot in registration order.
    ///
    /// A panicking `apply` is logged and swallowed; it must not abort the
    /// task or leak to the submitter.
    pub fn apply_all(&mut self) {
        for (name, snapshot) in &mut self.snapshots {
            if catch_unwind(AssertUnwindSafe(|| snapshot.apply())).is_err() {
                warn!(service = %name, "context apply panicked; continuing");
            }
        }
    }

    /// Unapply every snapshot, in the same order `apply_all` used.
    ///
    /// Runs after the task body regardless of its outcome. A panicking
    /// `unapply` is logged and swallowed.
    pub fn unapply_all(&mut self) {
        for (name, snapshot) in &mut self.snapshots {
            if catch_unwind(AssertUnwindSafe(|| snapshot.unapply())).is_err() {
                warn!(service = %name, "context unapply panicked; continuing");
            }
        }
    }
}

impl std::fmt::Debug for CapturedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedContext")
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

/// A dynamic, pluggable set of named context services.
///
/// The registry is live: services may be added or removed while executors
/// built over it keep running. Removal affects subsequent submissions only;
/// work already queued carries the snapshots captured at its submission.
#[derive(Default)]
pub struct ContextRegistry {
    services: RwLock<Vec<Arc<dyn ContextService>>>,
}

impl ContextRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its unique name.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when a service with the same name is
    /// already registered.
    pub fn register(&self, service: Arc<dyn ContextService>) -> ExecutorResult<()> {
        let mut services = self.services.write().unwrap();
        if services.iter().any(|s| s.name() == service.name()) {
            return Err(ExecutorError::InvalidArgument(format!(
                "context service '{}' is already registered",
                service.name()
            )));
        }
        services.push(service);
        Ok(())
    }

    /// Remove the service with the given name, if present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut services = self.services.write().unwrap();
        let before = services.len();
        services.retain(|s| s.name() != name);
        services.len() != before
    }

    /// Whether a service with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.read().unwrap().iter().any(|s| s.name() == name)
    }

    /// Number of registered services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.read().unwrap().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capture one snapshot per registered service, in registration order.
    ///
    /// Iterates a stable copy of the service list taken under the read lock,
    /// then calls `prepare` on the submitting thread outside the lock. A
    /// panicking `prepare` is logged and its service skipped for this
    /// submission.
    #[must_use]
    pub fn capture(&self) -> CapturedContext {
        let services: Vec<Arc<dyn ContextService>> = self.services.read().unwrap().clone();

        let mut snapshots = Vec::with_capacity(services.len());
        for service in services {
            match catch_unwind(AssertUnwindSafe(|| service.prepare())) {
                Ok(snapshot) => snapshots.push((service.name().to_owned(), snapshot)),
                Err(_) => warn!(service = %service.name(), "context prepare panicked; skipping"),
            }
        }
        CapturedContext { snapshots }
    }
}

impl std::fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("services", &self.len())
            .finish()
    }
}
