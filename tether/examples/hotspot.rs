//! Shares `eth0` over a simulated Wi-Fi access point.
//!
//! Runs against a recording control plane by default. Pass `--linux` to drive the host with
//! `ip`, `iptables` and `dnsmasq` instead (needs root and a `wlan0` interface).

use std::{net::IpAddr, sync::Arc};

use tether::{
    BackendError, LinuxNetControl, MockNetControl, NetControl, NetHandle, ShareConfig, SharingBackend,
    SharingEventListener, SharingIfaceState, SharingType, TrafficKind, Tracker, UpstreamEvent, UpstreamEventKind,
    UpstreamMonitor, UpstreamNetworkInfo, WeakTracker, WifiApState,
};

fn eth0() -> UpstreamNetworkInfo {
    let dns: IpAddr = "2001:4860:4860::8888".parse().unwrap();
    UpstreamNetworkInfo::new(NetHandle(100), "eth0").with_dnses(vec![dns])
}

struct StaticMonitor;

impl UpstreamMonitor for StaticMonitor {
    fn current_best_upstream(&self) -> Option<UpstreamNetworkInfo> {
        Some(eth0())
    }
}

/// An access point that comes up as soon as it is asked to.
struct AccessPoint(WeakTracker);

impl SharingBackend for AccessPoint {
    fn technology(&self) -> SharingType {
        SharingType::Wifi
    }

    fn enable(&self) -> Result<(), BackendError> {
        let tracker = self.0.upgrade().ok_or_else(|| BackendError::new(SharingType::Wifi, "tracker gone"))?;
        tracker.on_wifi_state(WifiApState::Starting);
        tracker.on_wifi_state(WifiApState::Started);
        Ok(())
    }

    fn disable(&self) -> Result<(), BackendError> {
        let tracker = self.0.upgrade().ok_or_else(|| BackendError::new(SharingType::Wifi, "tracker gone"))?;
        tracker.on_wifi_state(WifiApState::Closing);
        tracker.on_wifi_state(WifiApState::Closed);
        Ok(())
    }
}

struct Printer;

impl SharingEventListener for Printer {
    fn on_sharing_state_changed(&self, sharing: bool) {
        println!("sharing: {sharing}");
    }

    fn on_interface_sharing_state_changed(&self, ty: SharingType, iface: &str, state: SharingIfaceState) {
        println!("{ty} {iface}: {state:?}");
    }

    fn on_upstream_changed(&self, handle: Option<NetHandle>) {
        println!("upstream: {handle:?}");
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let linux = std::env::args().any(|arg| arg == "--linux");
    let net: Arc<dyn NetControl> =
        if linux { Arc::new(LinuxNetControl::new()) } else { Arc::new(MockNetControl::new()) };

    let tracker = Tracker::new(ShareConfig::default(), net, Arc::new(StaticMonitor)).unwrap();
    tracker.register_backend(Arc::new(AccessPoint(tracker.downgrade())));
    tracker.register_listener(Arc::new(Printer)).unwrap();

    tracker.start_sharing(SharingType::Wifi).unwrap();
    tracker.flush().unwrap();
    tracing::info!(state = ?tracker.main_state(), links = ?tracker.links(), "sharing");

    tracker.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(eth0())));
    tracker.flush().unwrap();

    if linux {
        println!("sharing eth0 over wlan0, ctrl-c to stop");
        tokio::signal::ctrl_c().await.unwrap();
    }

    println!("shared traffic: {} KiB", tracker.shared_traffic(TrafficKind::All).unwrap_or_default());
    tracker.stop_sharing(SharingType::Wifi).unwrap();
    tracker.shutdown();
}
