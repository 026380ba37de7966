use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// The lock serializing event dispatch across the main state machine and every link state
/// machine.
///
/// Re-entrant: a handler running under the lock can dispatch into the other machine on the
/// same thread, e.g. the main machine forwarding an error to every link.
#[derive(Debug, Clone, Default)]
pub struct EventLock(Arc<ReentrantMutex<()>>);

impl EventLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.lock()
    }
}
