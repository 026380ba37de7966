//! The sharing orchestrator.
//!
//! [`Tracker`] owns the table of downstream links, gates technology enablement through the
//! registered [`SharingBackend`]s and fans state changes out to [`SharingEventListener`]s.
//!
//! Platform callbacks (interface and backend state changes, upstream events) return
//! immediately: the work they imply is queued on a single [`SerialWorker`], which is the only
//! place links are created, requested or torn down.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use tether_common::{kib_saturating, SerialWorker};
use tether_net::NetControl;

use crate::{
    config::{IfaceClassifier, ShareConfig},
    dispatch::EventLock,
    main_sm::{MainEvent, MainSmHost, MainState, MainStateMachine},
    sub_sm::{SubEvent, SubSmCallback, SubState, SubStateMachine},
    types::{BackendState, BtPanState, UsbFunctionState, WifiApState},
    upstream::{Upstream, UpstreamEvent, UpstreamMonitor, UpstreamNetworkInfo},
    Result, SessionError, ShareError, SharingIfaceState, SharingType, TrafficKind,
};

mod backend;
pub use backend::{BackendError, SharingBackend};
use backend::Backends;

mod listener;
pub use listener::SharingEventListener;
use listener::ListenerRegistry;

const WORKER_NAME: &str = "tether-tracker";

/// What listeners see for a link in `state` whose last attempt ended with `last_error`.
fn exported_state(state: SubState, last_error: Option<ShareError>) -> SharingIfaceState {
    match (state, last_error) {
        (SubState::Shared, _) => SharingIfaceState::Serving,
        (SubState::Unavailable, _) | (SubState::Init, Some(_)) => SharingIfaceState::Error,
        (SubState::Init, None) => SharingIfaceState::CanServe,
    }
}

/// A downstream interface known to the tracker.
struct DownstreamLink {
    sub: Arc<SubStateMachine>,
    technology: SharingType,
    /// Last state reported by the link.
    state: SharingIfaceState,
    shared: bool,
    last_error: Option<ShareError>,
}

struct TrackerInner {
    config: Arc<ShareConfig>,
    classifier: IfaceClassifier,
    net: Arc<dyn NetControl>,
    lock: EventLock,
    main: MainStateMachine,
    links: Mutex<BTreeMap<String, DownstreamLink>>,
    /// Technologies the caller asked to share.
    requests: Mutex<FxHashSet<SharingType>>,
    backends: Backends,
    listeners: ListenerRegistry,
    upstream: RwLock<Upstream>,
    dns_started: AtomicBool,
    sharing: AtomicBool,
    worker: SerialWorker,
    this: Weak<TrackerInner>,
}

/// Shared handle to the orchestrator. Cloning is cheap.
#[derive(Clone)]
pub struct Tracker(Arc<TrackerInner>);

/// A non-owning [`Tracker`] handle, for backends that report state back into it.
#[derive(Clone)]
pub struct WeakTracker(Weak<TrackerInner>);

impl WeakTracker {
    pub fn upgrade(&self) -> Option<Tracker> {
        self.0.upgrade().map(Tracker)
    }
}

impl Tracker {
    /// Creates the tracker and starts its worker thread.
    ///
    /// Fails with [`ShareError::InvalidParam`] if an interface pattern in `config` does not
    /// compile.
    pub fn new(config: ShareConfig, net: Arc<dyn NetControl>, monitor: Arc<dyn UpstreamMonitor>) -> Result<Self> {
        let classifier = config.classifier().map_err(|err| {
            tracing::error!(?err, "invalid interface pattern");
            ShareError::InvalidParam
        })?;
        let worker = SerialWorker::spawn(WORKER_NAME).map_err(|err| {
            tracing::error!(?err, "failed to start tracker worker");
            ShareError::InternalError
        })?;

        let lock = EventLock::new();
        let max_listeners = config.max_listeners;

        let inner = Arc::new_cyclic(|this: &Weak<TrackerInner>| TrackerInner {
            config: Arc::new(config),
            classifier,
            main: MainStateMachine::new(Arc::clone(&net), monitor, lock.clone(), this.clone() as Weak<dyn MainSmHost>),
            net,
            lock,
            links: Mutex::new(BTreeMap::new()),
            requests: Mutex::new(FxHashSet::default()),
            backends: Backends::default(),
            listeners: ListenerRegistry::new(max_listeners),
            upstream: RwLock::new(None),
            dns_started: AtomicBool::new(false),
            sharing: AtomicBool::new(false),
            worker,
            this: this.clone(),
        });

        Ok(Self(inner))
    }

    /// Installs the backend for its technology. A technology without a backend is not
    /// supported.
    pub fn with_backend(self, backend: Arc<dyn SharingBackend>) -> Self {
        self.register_backend(backend);
        self
    }

    pub fn register_backend(&self, backend: Arc<dyn SharingBackend>) {
        self.0.backends.insert(backend);
    }

    pub fn downgrade(&self) -> WeakTracker {
        WeakTracker(Arc::downgrade(&self.0))
    }

    pub fn config(&self) -> &ShareConfig {
        &self.0.config
    }

    pub fn is_sharing_supported(&self) -> bool {
        self.0.config.supported
    }

    /// Asks the backend of `ty` to start sharing. If `ty` is already requested its backend
    /// is stopped first and its links torn down, so sharing restarts from scratch.
    pub fn start_sharing(&self, ty: SharingType) -> Result<()> {
        let backend = self.0.backend(ty)?;

        if self.0.requests.lock().contains(&ty) {
            tracing::info!(%ty, "sharing already requested, restarting");
            backend.disable().map_err(|err| {
                tracing::error!(%ty, ?err, "failed to stop sharing backend");
                ty.sharing_error()
            })?;
            self.0.enqueue_stop_links(ty);
        }

        self.0.requests.lock().insert(ty);
        if let Err(err) = backend.enable() {
            tracing::error!(%ty, ?err, "failed to start sharing backend");
            self.0.requests.lock().remove(&ty);
            return Err(ty.sharing_error());
        }

        tracing::info!(%ty, "sharing started");
        Ok(())
    }

    /// Stops sharing `ty`. The request is dropped even if the backend fails to stop.
    pub fn stop_sharing(&self, ty: SharingType) -> Result<()> {
        if !self.0.config.supported {
            return Err(ShareError::NotSupported);
        }

        let requested = self.0.requests.lock().remove(&ty);
        if !requested && !self.0.has_links(ty) {
            tracing::debug!(%ty, "sharing not active");
            return Ok(());
        }

        let backend = self.0.backend(ty)?;
        backend.disable().map_err(|err| {
            tracing::error!(%ty, ?err, "failed to stop sharing backend");
            ty.sharing_error()
        })?;

        self.0.enqueue_stop_links(ty);
        tracing::info!(%ty, "sharing stopped");
        Ok(())
    }

    /// True if any link is shared. Reads the same reported view as [`Tracker::sharing_state`].
    pub fn is_sharing(&self) -> bool {
        self.0.links.lock().values().any(|link| link.shared)
    }

    /// The combined state of every link of `ty`: serving if any link serves, error if any
    /// link failed, can-serve otherwise.
    pub fn sharing_state(&self, ty: SharingType) -> Result<SharingIfaceState> {
        if !self.0.config.supported {
            return Err(ShareError::NotSupported);
        }

        let links = self.0.links.lock();
        let states = links.values().filter(|link| link.technology == ty).map(|link| link.state);

        let mut combined = SharingIfaceState::CanServe;
        for state in states {
            match state {
                SharingIfaceState::Serving => return Ok(SharingIfaceState::Serving),
                SharingIfaceState::Error => combined = SharingIfaceState::Error,
                SharingIfaceState::CanServe => {}
            }
        }
        Ok(combined)
    }

    /// Names of the links currently in `state`, sorted.
    pub fn sharing_ifaces(&self, state: SharingIfaceState) -> Result<Vec<String>> {
        if !self.0.config.supported {
            return Err(ShareError::NotSupported);
        }

        let links = self.0.links.lock();
        Ok(links.iter().filter(|(_, link)| link.state == state).map(|(name, _)| name.clone()).collect())
    }

    /// Interface name patterns that identify links of `ty`.
    pub fn sharable_regexes(&self, ty: SharingType) -> Result<Vec<String>> {
        if !self.0.config.supported {
            return Err(ShareError::NotSupported);
        }
        Ok(self.0.classifier.patterns(ty))
    }

    /// Traffic over all shared links in KiB, saturating at [`i32::MAX`].
    pub fn shared_traffic(&self, kind: TrafficKind) -> Result<i32> {
        if !self.0.config.supported {
            return Err(ShareError::NotSupported);
        }

        let mut total: u64 = 0;
        for iface in self.0.shared_ifaces() {
            let stats = match self.0.net.interface_stats(&iface) {
                Ok(stats) => stats,
                Err(err) => {
                    tracing::warn!(%iface, ?err, "failed to read traffic stats");
                    continue;
                }
            };

            let bytes = match kind {
                TrafficKind::Rx => stats.rx_bytes,
                TrafficKind::Tx => stats.tx_bytes,
                TrafficKind::All => stats.total(),
            };
            total = total.saturating_add(bytes);
        }

        Ok(kib_saturating(total))
    }

    /// Registers `listener`. Registering the same listener again is a no-op.
    pub fn register_listener(&self, listener: Arc<dyn SharingEventListener>) -> Result<()> {
        self.0.listeners.register(listener)
    }

    pub fn unregister_listener(&self, listener: &Arc<dyn SharingEventListener>) {
        self.0.listeners.unregister(listener);
    }

    pub fn interface_added(&self, iface: &str) {
        self.0.on_iface_up(iface, "added");
    }

    /// A removed interface cannot be shared, so its link is torn down whatever the backend
    /// state.
    pub fn interface_removed(&self, iface: &str) {
        if self.0.classifier.classify(iface).is_none() {
            return;
        }

        let name = iface.to_string();
        self.0.enqueue(move |inner| inner.stop_link(&name));
    }

    pub fn interface_status_changed(&self, iface: &str, up: bool) {
        if up {
            self.0.on_iface_up(iface, "up");
            return;
        }

        let Some(ty) = self.0.classifier.classify(iface) else {
            return;
        };
        let backend = self.0.backends.state(ty);
        if !backend.accepts_down() {
            tracing::debug!(%iface, ?backend, "ignoring interface down");
            return;
        }

        let name = iface.to_string();
        self.0.enqueue(move |inner| {
            if let Some(sub) = inner.link(&name) {
                sub.handle_event(SubEvent::InterfaceDown);
            }
        });
    }

    pub fn on_wifi_state(&self, state: WifiApState) {
        self.0.on_backend_state(BackendState::Wifi(state));
    }

    pub fn on_bluetooth_state(&self, state: BtPanState) {
        self.0.on_backend_state(BackendState::Bluetooth(state));
    }

    pub fn on_usb_state(&self, state: UsbFunctionState) {
        self.0.on_backend_state(BackendState::Usb(state));
    }

    /// Relays `event` to listeners and, while sharing, to the main state machine.
    pub fn on_upstream_event(&self, event: UpstreamEvent) {
        if let Some(handle) = event.handle() {
            self.0.listeners.upstream_changed(Some(handle));
        }

        self.0.enqueue(move |inner| {
            if inner.main.state() != MainState::Alive {
                tracing::debug!(kind = ?event.kind, "not sharing, upstream event dropped");
                return;
            }
            inner.main.handle_event(MainEvent::Upstream(event));
        });
    }

    pub fn main_state(&self) -> MainState {
        self.0.main.state()
    }

    pub fn session_error(&self) -> Option<SessionError> {
        self.0.main.error()
    }

    pub fn upstream(&self) -> Upstream {
        self.0.upstream.read().clone()
    }

    /// Names of every known link, sorted.
    pub fn links(&self) -> Vec<String> {
        self.0.links.lock().keys().cloned().collect()
    }

    pub fn link_state(&self, iface: &str) -> Option<SubState> {
        self.0.link(iface).map(|sub| sub.state())
    }

    pub fn link_error(&self, iface: &str) -> Option<ShareError> {
        self.0.link(iface).and_then(|sub| sub.last_error())
    }

    pub fn link(&self, iface: &str) -> Option<Arc<SubStateMachine>> {
        self.0.link(iface)
    }

    /// Blocks until all queued work has run.
    ///
    /// Parks the calling thread without touching any runtime, so it may be called from async
    /// code, though it should not be called from a listener or backend callback.
    pub fn flush(&self) -> Result<()> {
        self.0.worker.flush().map_err(|err| {
            tracing::warn!(?err, "failed to flush tracker worker");
            ShareError::InternalError
        })
    }

    /// Tears down every link and stops the worker. Blocks like [`Tracker::flush`].
    pub fn shutdown(&self) {
        self.0.enqueue(|inner| {
            let names: Vec<String> = inner.links.lock().keys().cloned().collect();
            for name in names {
                inner.stop_link(&name);
            }
        });
        let _ = self.flush();
        self.0.worker.shutdown();
        tracing::info!("tracker shut down");
    }
}

impl TrackerInner {
    fn backend(&self, ty: SharingType) -> Result<Arc<dyn SharingBackend>> {
        if !self.config.supported {
            return Err(ShareError::NotSupported);
        }
        self.backends.get(ty).ok_or_else(|| {
            tracing::warn!(%ty, "no backend for technology");
            ShareError::NotSupported
        })
    }

    fn enqueue<F>(&self, job: F)
    where
        F: FnOnce(&TrackerInner) + Send + 'static,
    {
        let this = self.this.clone();
        let submitted = self.worker.submit(move || {
            if let Some(inner) = this.upgrade() {
                job(&inner);
            }
        });

        if let Err(err) = submitted {
            tracing::warn!(?err, "tracker worker unavailable, job dropped");
        }
    }

    fn link(&self, iface: &str) -> Option<Arc<SubStateMachine>> {
        self.links.lock().get(iface).map(|link| Arc::clone(&link.sub))
    }

    fn has_links(&self, ty: SharingType) -> bool {
        self.links.lock().values().any(|link| link.technology == ty)
    }

    fn shared_ifaces(&self) -> Vec<String> {
        self.links
            .lock()
            .iter()
            .filter(|(_, link)| link.shared)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn on_iface_up(&self, iface: &str, what: &'static str) {
        let Some(ty) = self.classifier.classify(iface) else {
            return;
        };
        let backend = self.backends.state(ty);
        if !backend.accepts_up() {
            tracing::debug!(%iface, ?backend, what, "ignoring interface event");
            return;
        }

        tracing::debug!(%iface, %ty, what, "interface event");
        let name = iface.to_string();
        self.enqueue(move |inner| {
            let sub = inner.ensure_link(&name, ty);
            if sub.state() == SubState::Unavailable {
                sub.handle_event(SubEvent::InterfaceUp);
            }
            if inner.backends.state(ty).is_ready() {
                inner.request_link(&sub);
            }
        });
    }

    fn on_backend_state(&self, state: BackendState) {
        self.backends.set_state(state);
        let ty = state.technology();

        if state.is_stopped() {
            self.enqueue_stop_links(ty);
            return;
        }
        if !state.is_ready() {
            return;
        }

        // The USB link only exists once its interface shows up.
        if ty == SharingType::Usb {
            self.enqueue(move |inner| {
                let subs: Vec<_> = inner
                    .links
                    .lock()
                    .values()
                    .filter(|link| link.technology == ty)
                    .map(|link| Arc::clone(&link.sub))
                    .collect();
                for sub in subs {
                    inner.request_link(&sub);
                }
            });
            return;
        }

        let iface = self.config.link(ty).default_iface.clone();
        self.enqueue(move |inner| {
            let sub = inner.ensure_link(&iface, ty);
            inner.request_link(&sub);
        });
    }

    fn ensure_link(&self, iface: &str, ty: SharingType) -> Arc<SubStateMachine> {
        let mut links = self.links.lock();
        if let Some(link) = links.get(iface) {
            return Arc::clone(&link.sub);
        }

        let sub = SubStateMachine::new(
            iface,
            ty,
            Arc::clone(&self.config),
            Arc::clone(&self.net),
            self.lock.clone(),
            self.this.clone() as Weak<dyn SubSmCallback>,
        );
        links.insert(
            iface.to_string(),
            DownstreamLink {
                sub: Arc::clone(&sub),
                technology: ty,
                state: SharingIfaceState::CanServe,
                shared: false,
                last_error: None,
            },
        );

        tracing::info!(%iface, %ty, "link created");
        sub
    }

    /// Requests sharing on `sub`, clearing a pending session error first so it does not
    /// block the new request.
    fn request_link(&self, sub: &Arc<SubStateMachine>) {
        if sub.state() != SubState::Init {
            tracing::debug!(iface = %sub.iface(), state = ?sub.state(), "link not requestable");
            return;
        }

        if self.main.state() == MainState::Error {
            tracing::info!(error = ?self.main.error(), "clearing session error");
            self.main.handle_event(MainEvent::ClearError);
        }
        sub.handle_event(SubEvent::ShareRequested);
    }

    fn stop_link(&self, iface: &str) {
        let Some(sub) = self.link(iface) else {
            return;
        };
        if sub.state() == SubState::Shared {
            sub.handle_event(SubEvent::ShareUnrequested);
        }

        self.links.lock().remove(iface);
        tracing::info!(%iface, "link removed");
    }

    fn enqueue_stop_links(&self, ty: SharingType) {
        self.enqueue(move |inner| {
            let names: Vec<String> = inner
                .links
                .lock()
                .iter()
                .filter(|(_, link)| link.technology == ty)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                inner.stop_link(&name);
            }
        });
    }

    fn start_dns(&self, info: &UpstreamNetworkInfo) -> std::result::Result<(), SessionError> {
        if !self.dns_started.load(Ordering::SeqCst) {
            self.net.start_dns_proxy().map_err(|err| {
                tracing::error!(?err, "failed to start dns proxy");
                SessionError::StartSharing
            })?;
            self.dns_started.store(true, Ordering::SeqCst);
        }

        self.net.set_dns_proxy_network(info.handle.id()).map_err(|err| {
            tracing::error!(upstream = %info.iface(), ?err, "failed to set dns forwarders");
            SessionError::SetDnsForwarders
        })
    }

    fn stop_dns(&self) -> std::result::Result<(), SessionError> {
        if !self.dns_started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.net.stop_dns_proxy().map_err(|err| {
            tracing::error!(?err, "failed to stop dns proxy");
            SessionError::StopSharing
        })
    }
}

impl MainSmHost for TrackerInner {
    fn set_upstream(&self, upstream: Option<UpstreamNetworkInfo>) {
        let upstream = match upstream {
            Some(info) => {
                if let Err(err) = self.start_dns(&info) {
                    self.main.switch_to_error(err);
                    return;
                }
                Some(Arc::new(info))
            }
            None => {
                // Outside Alive the session is already ending.
                if let Err(err) = self.stop_dns() {
                    if self.main.state() == MainState::Alive {
                        self.main.switch_to_error(err);
                        return;
                    }
                }
                None
            }
        };

        tracing::info!(
            upstream = ?upstream.as_ref().map(|u| u.iface().to_string()),
            handle = ?upstream.as_ref().map(|u| u.handle),
            "upstream installed"
        );
        *self.upstream.write() = upstream.clone();

        let subs: Vec<_> = self
            .links
            .lock()
            .values()
            .filter(|link| link.sub.state() == SubState::Shared)
            .map(|link| Arc::clone(&link.sub))
            .collect();
        for sub in subs {
            sub.handle_event(SubEvent::ConnectionChanged(upstream.clone()));
        }
    }

    fn current_upstream(&self) -> Upstream {
        self.upstream.read().clone()
    }
}

impl SubSmCallback for TrackerInner {
    fn on_sub_state(&self, sub: &Arc<SubStateMachine>, state: SubState, last_error: Option<ShareError>) {
        let exported = exported_state(state, last_error);
        let shared = state == SubState::Shared;

        let (changed, was_shared, sharing) = {
            let mut links = self.links.lock();
            let Some(link) = links.get_mut(sub.iface()).filter(|link| Arc::ptr_eq(&link.sub, sub)) else {
                tracing::debug!(iface = %sub.iface(), ?state, "report from unknown link");
                return;
            };

            let changed = link.state != exported || link.last_error != last_error;
            let was_shared = std::mem::replace(&mut link.shared, shared);
            link.state = exported;
            link.last_error = last_error;

            (changed, was_shared, links.values().any(|link| link.shared))
        };

        if changed {
            self.listeners.interface_changed(sub.technology(), sub.iface(), exported);
        }
        if self.sharing.swap(sharing, Ordering::SeqCst) != sharing {
            tracing::info!(sharing, "sharing state changed");
            self.listeners.sharing_changed(sharing);
        }

        if shared {
            self.main.handle_event(MainEvent::IfaceActive(Arc::clone(sub)));
        } else if was_shared {
            self.main.handle_event(MainEvent::IfaceInactive(Arc::clone(sub)));
        }
    }
}
