use std::sync::Arc;

use parking_lot::RwLock;

use crate::{upstream::NetHandle, Result, ShareError, SharingIfaceState, SharingType};

/// Receives sharing notifications.
pub trait SharingEventListener: Send + Sync {
    /// Global sharing turned on or off.
    fn on_sharing_state_changed(&self, sharing: bool);

    fn on_interface_sharing_state_changed(&self, ty: SharingType, iface: &str, state: SharingIfaceState);

    fn on_upstream_changed(&self, handle: Option<NetHandle>);

    /// A listener returning false is dropped at the next notification.
    fn is_alive(&self) -> bool {
        true
    }
}

fn same(a: &Arc<dyn SharingEventListener>, b: &Arc<dyn SharingEventListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Bounded set of listeners.
pub(crate) struct ListenerRegistry {
    max: usize,
    listeners: RwLock<Vec<Arc<dyn SharingEventListener>>>,
}

impl ListenerRegistry {
    pub(crate) fn new(max: usize) -> Self {
        Self { max, listeners: RwLock::new(Vec::new()) }
    }

    /// Adds `listener`. Registering the same listener twice is a no-op.
    pub(crate) fn register(&self, listener: Arc<dyn SharingEventListener>) -> Result<()> {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same(l, &listener)) {
            return Ok(());
        }
        if listeners.len() >= self.max {
            tracing::warn!(max = self.max, "listener limit reached");
            return Err(ShareError::ListenerLimit);
        }

        listeners.push(listener);
        Ok(())
    }

    pub(crate) fn unregister(&self, listener: &Arc<dyn SharingEventListener>) {
        self.listeners.write().retain(|l| !same(l, listener));
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub(crate) fn sharing_changed(&self, sharing: bool) {
        self.for_each(|l| l.on_sharing_state_changed(sharing));
    }

    pub(crate) fn interface_changed(&self, ty: SharingType, iface: &str, state: SharingIfaceState) {
        self.for_each(|l| l.on_interface_sharing_state_changed(ty, iface, state));
    }

    pub(crate) fn upstream_changed(&self, handle: Option<NetHandle>) {
        self.for_each(|l| l.on_upstream_changed(handle));
    }

    /// Calls `f` on every live listener without holding the lock, then prunes dead ones.
    fn for_each(&self, f: impl Fn(&dyn SharingEventListener)) {
        let snapshot = self.listeners.read().clone();

        let mut dead = false;
        for listener in &snapshot {
            if listener.is_alive() {
                f(listener.as_ref());
            } else {
                dead = true;
            }
        }

        if dead {
            let mut listeners = self.listeners.write();
            let before = listeners.len();
            listeners.retain(|l| l.is_alive());
            tracing::debug!(pruned = before - listeners.len(), "dropped dead listeners");
        }
    }
}
