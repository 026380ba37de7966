use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::{types::BackendState, SharingType};

#[derive(Debug, thiserror::Error)]
#[error("{technology} backend failed: {reason}")]
pub struct BackendError {
    pub technology: SharingType,
    pub reason: String,
}

impl BackendError {
    pub fn new(technology: SharingType, reason: impl Into<String>) -> Self {
        Self { technology, reason: reason.into() }
    }
}

/// A technology's hardware backend: the access point, USB function switch or Bluetooth PAN.
///
/// State changes are reported back through the tracker's `on_*_state` methods, possibly
/// from within `enable` or `disable`.
pub trait SharingBackend: Send + Sync {
    fn technology(&self) -> SharingType;

    fn enable(&self) -> Result<(), BackendError>;

    fn disable(&self) -> Result<(), BackendError>;
}

/// Installed backends and their last reported states. A missing backend means the
/// technology is not supported.
#[derive(Default)]
pub(crate) struct Backends {
    backends: RwLock<FxHashMap<SharingType, Arc<dyn SharingBackend>>>,
    states: Mutex<FxHashMap<SharingType, BackendState>>,
}

impl Backends {
    pub(crate) fn insert(&self, backend: Arc<dyn SharingBackend>) {
        let ty = backend.technology();
        if self.backends.write().insert(ty, backend).is_some() {
            tracing::warn!(%ty, "replaced sharing backend");
        }
    }

    pub(crate) fn get(&self, ty: SharingType) -> Option<Arc<dyn SharingBackend>> {
        self.backends.read().get(&ty).cloned()
    }

    pub(crate) fn state(&self, ty: SharingType) -> BackendState {
        self.states.lock().get(&ty).copied().unwrap_or_else(|| BackendState::initial(ty))
    }

    pub(crate) fn set_state(&self, state: BackendState) {
        let ty = state.technology();
        let prev = self.states.lock().insert(ty, state);
        tracing::debug!(%ty, ?prev, ?state, "backend state");
    }
}
