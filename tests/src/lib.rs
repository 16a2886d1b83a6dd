//! Shared fixtures for Ergane integration tests.

use std::cell::RefCell;
use std::sync::Arc;

use ergane::{ContextService, ContextSnapshot};

thread_local! {
    static REQUEST_TAG: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Set the ambient request tag on the current thread.
pub fn set_request_tag(tag: Option<&str>) {
    REQUEST_TAG.with(|cell| *cell.borrow_mut() = tag.map(str::to_owned));
}

/// Read the ambient request tag on the current thread.
#[must_use]
pub fn request_tag() -> Option<String> {
    REQUEST_TAG.with(|cell| cell.borrow().clone())
}

/// A context service that snapshots the submitter's request tag and makes
/// it visible on the worker thread for the duration of one task.
pub struct RequestTagService;

impl RequestTagService {
    /// Boxed service ready for registration.
    #[must_use]
    pub fn shared() -> Arc<dyn ContextService> {
        Arc::new(Self)
    }
}

impl ContextService for RequestTagService {
    fn name(&self) -> &str {
        "request-tag"
    }

    fn prepare(&self) -> Box<dyn ContextSnapshot> {
        Box::new(RequestTagSnapshot {
            captured: request_tag(),
            displaced: None,
        })
    }
}

struct RequestTagSnapshot {
    captured: Option<String>,
    displaced: Option<String>,
}

impl ContextSnapshot for RequestTagSnapshot {
    fn apply(&mut self) {
        self.displaced = REQUEST_TAG.with(|cell| cell.replace(self.captured.clone()));
    }

    fn unapply(&mut self) {
        let displaced = self.displaced.take();
        REQUEST_TAG.with(|cell| *cell.borrow_mut() = displaced);
    }
}
