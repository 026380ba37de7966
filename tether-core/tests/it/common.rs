use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tether_core::{
    BackendError, BtPanState, NetHandle, ShareConfig, SharingBackend, SharingEventListener, SharingIfaceState,
    SharingType, Tracker, UpstreamMonitor, UpstreamNetworkInfo, UsbFunctionState, WeakTracker, WifiApState,
};
use tether_net::{mock::MockNetControl, NetControl};

#[derive(Default)]
pub struct FakeMonitor {
    best: Mutex<Option<UpstreamNetworkInfo>>,
}

impl FakeMonitor {
    pub fn set(&self, best: Option<UpstreamNetworkInfo>) {
        *self.best.lock() = best;
    }
}

impl UpstreamMonitor for FakeMonitor {
    fn current_best_upstream(&self) -> Option<UpstreamNetworkInfo> {
        self.best.lock().clone()
    }
}

/// A backend that reports the same state sequence a real one would, synchronously.
pub struct FakeBackend {
    ty: SharingType,
    tracker: WeakTracker,
    pub fail_enable: AtomicBool,
    pub fail_disable: AtomicBool,
    pub enables: AtomicUsize,
    pub disables: AtomicUsize,
}

impl FakeBackend {
    pub fn new(ty: SharingType, tracker: WeakTracker) -> Self {
        Self {
            ty,
            tracker,
            fail_enable: AtomicBool::new(false),
            fail_disable: AtomicBool::new(false),
            enables: AtomicUsize::new(0),
            disables: AtomicUsize::new(0),
        }
    }
}

impl SharingBackend for FakeBackend {
    fn technology(&self) -> SharingType {
        self.ty
    }

    fn enable(&self) -> Result<(), BackendError> {
        self.enables.fetch_add(1, Ordering::SeqCst);
        if self.fail_enable.load(Ordering::SeqCst) {
            return Err(BackendError::new(self.ty, "enable refused"));
        }

        let Some(tracker) = self.tracker.upgrade() else {
            return Err(BackendError::new(self.ty, "tracker gone"));
        };
        match self.ty {
            SharingType::Wifi => {
                tracker.on_wifi_state(WifiApState::Starting);
                tracker.on_wifi_state(WifiApState::Started);
            }
            SharingType::Bluetooth => {
                tracker.on_bluetooth_state(BtPanState::Connecting);
                tracker.on_bluetooth_state(BtPanState::Connected);
            }
            SharingType::Usb => tracker.on_usb_state(UsbFunctionState::RndisEnabled),
        }
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        self.disables.fetch_add(1, Ordering::SeqCst);
        if self.fail_disable.load(Ordering::SeqCst) {
            return Err(BackendError::new(self.ty, "disable refused"));
        }

        let Some(tracker) = self.tracker.upgrade() else {
            return Err(BackendError::new(self.ty, "tracker gone"));
        };
        match self.ty {
            SharingType::Wifi => {
                tracker.on_wifi_state(WifiApState::Closing);
                tracker.on_wifi_state(WifiApState::Closed);
            }
            SharingType::Bluetooth => {
                tracker.on_bluetooth_state(BtPanState::Disconnecting);
                tracker.on_bluetooth_state(BtPanState::Disconnected);
            }
            SharingType::Usb => {
                tracker.on_usb_state(UsbFunctionState::Disabling);
                tracker.on_usb_state(UsbFunctionState::Disabled);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Sharing(bool),
    Iface(SharingType, String, SharingIfaceState),
    Upstream(Option<NetHandle>),
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    pub dead: AtomicBool,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl SharingEventListener for Recorder {
    fn on_sharing_state_changed(&self, sharing: bool) {
        self.events.lock().push(Event::Sharing(sharing));
    }

    fn on_interface_sharing_state_changed(&self, ty: SharingType, iface: &str, state: SharingIfaceState) {
        self.events.lock().push(Event::Iface(ty, iface.to_string(), state));
    }

    fn on_upstream_changed(&self, handle: Option<NetHandle>) {
        self.events.lock().push(Event::Upstream(handle));
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }
}

pub fn upstream(id: u32, iface: &str) -> UpstreamNetworkInfo {
    UpstreamNetworkInfo::new(NetHandle(id), iface)
}

/// A tracker wired to in-memory fakes, with a backend for every technology and one
/// registered listener.
pub struct Env {
    pub tracker: Tracker,
    pub net: Arc<MockNetControl>,
    pub monitor: Arc<FakeMonitor>,
    pub listener: Arc<Recorder>,
    pub wifi: Arc<FakeBackend>,
    pub usb: Arc<FakeBackend>,
    pub bluetooth: Arc<FakeBackend>,
}

impl Env {
    pub fn new() -> Self {
        Self::with_config(ShareConfig::default())
    }

    pub fn with_config(config: ShareConfig) -> Self {
        let _ = tracing_subscriber::fmt::try_init();

        let net = Arc::new(MockNetControl::new());
        let monitor = Arc::new(FakeMonitor::default());
        let tracker = Tracker::new(
            config,
            Arc::clone(&net) as Arc<dyn NetControl>,
            Arc::clone(&monitor) as Arc<dyn UpstreamMonitor>,
        )
        .unwrap();

        let backend = |ty| {
            let backend = Arc::new(FakeBackend::new(ty, tracker.downgrade()));
            tracker.register_backend(Arc::clone(&backend) as Arc<dyn SharingBackend>);
            backend
        };
        let wifi = backend(SharingType::Wifi);
        let usb = backend(SharingType::Usb);
        let bluetooth = backend(SharingType::Bluetooth);

        let listener = Arc::new(Recorder::default());
        tracker.register_listener(Arc::clone(&listener) as Arc<dyn SharingEventListener>).unwrap();

        Self { tracker, net, monitor, listener, wifi, usb, bluetooth }
    }

    /// Runs `f` against the tracker, then waits for queued work to settle.
    pub fn settle<T>(&self, f: impl FnOnce(&Tracker) -> T) -> T {
        let out = f(&self.tracker);
        self.tracker.flush().unwrap();
        out
    }

    /// Starts USB sharing and brings up `rndis0`.
    pub fn share_usb(&self) {
        self.settle(|t| t.start_sharing(SharingType::Usb)).unwrap();
        self.settle(|t| t.interface_added("rndis0"));
    }
}
