use std::sync::atomic::Ordering;

use tether_core::{
    MainState, SessionError, ShareConfig, ShareError, SharingIfaceState, SharingType, SubState, UpstreamEvent,
    UpstreamEventKind,
};
use tether_net::mock::NetCall;

use crate::common::{upstream, Env, Event};

/// Shares Wi-Fi, Bluetooth and USB without an upstream.
fn three_links(env: &Env) {
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();
    env.share_usb();

    for iface in ["wlan0", "bt-pan", "rndis0"] {
        assert_eq!(env.tracker.link_state(iface), Some(SubState::Shared), "{iface}");
    }
    assert_eq!(env.tracker.main_state(), MainState::Alive);
}

#[test]
fn dns_failure_tears_down_every_link() {
    let env = Env::new();
    three_links(&env);
    env.listener.take();

    env.net.fail_when(|c| matches!(c, NetCall::SetDnsProxyNetwork(_)));
    env.settle(|t| t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(upstream(7, "eth0")))));

    let tracker = &env.tracker;
    assert_eq!(tracker.main_state(), MainState::Error);
    assert_eq!(tracker.session_error(), Some(SessionError::SetDnsForwarders));
    for iface in ["wlan0", "bt-pan", "rndis0"] {
        assert_eq!(tracker.link_state(iface), Some(SubState::Init), "{iface}");
        assert_eq!(tracker.link_error(iface), Some(ShareError::InternalError), "{iface}");
    }
    assert!(!tracker.is_sharing());
    assert!(tracker.upstream().is_none());
    // No link was ever wired to the failed upstream.
    assert_eq!(env.net.count(|c| matches!(c, NetCall::AddInterfaceForward { .. })), 0);
    assert!(env.net.calls().contains(&NetCall::StopDnsProxy));

    let events = env.listener.events();
    assert_eq!(events.first(), Some(&Event::Upstream(Some(tether_core::NetHandle(7)))));
    assert_eq!(events.iter().filter(|e| matches!(e, Event::Iface(_, _, SharingIfaceState::Error))).count(), 3);
    assert_eq!(events.last(), Some(&Event::Sharing(false)));
}

#[test]
fn new_request_clears_session_error() {
    let env = Env::new();
    three_links(&env);
    env.net.fail_when(|c| matches!(c, NetCall::SetDnsProxyNetwork(_)));
    env.settle(|t| t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(upstream(7, "eth0")))));
    assert_eq!(env.tracker.main_state(), MainState::Error);

    env.net.clear_failures();
    env.monitor.set(Some(upstream(7, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.main_state(), MainState::Alive);
    assert_eq!(tracker.session_error(), None);
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Shared));
    assert_eq!(tracker.link_error("wlan0"), None);
    assert_eq!(tracker.upstream().map(|u| u.handle.id()), Some(7));
    // The other links stay down until requested again.
    assert_eq!(tracker.link_state("bt-pan"), Some(SubState::Init));
}

#[test]
fn dns_proxy_start_failure_fails_the_session() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.net.fail_when(|c| matches!(c, NetCall::StartDnsProxy));

    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.main_state(), MainState::Error);
    assert_eq!(tracker.session_error(), Some(SessionError::StartSharing));
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Init));
    assert_eq!(tracker.link_error("wlan0"), Some(ShareError::InternalError));
    assert!(tracker.upstream().is_none());
    // Never started, so never stopped.
    assert!(!env.net.calls().contains(&NetCall::StopDnsProxy));
}

#[test]
fn dns_proxy_stop_failure_while_sharing_fails_the_session() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    assert_eq!(env.tracker.main_state(), MainState::Alive);

    env.net.fail_when(|c| matches!(c, NetCall::StopDnsProxy));
    env.settle(|t| t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, None)));

    let tracker = &env.tracker;
    assert_eq!(tracker.main_state(), MainState::Error);
    assert_eq!(tracker.session_error(), Some(SessionError::StopSharing));
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Init));
    assert_eq!(tracker.link_error("wlan0"), Some(ShareError::InternalError));
    assert!(tracker.upstream().is_none());
    assert_eq!(env.net.count(|c| matches!(c, NetCall::StopDnsProxy)), 1);
}

#[test]
fn forwarding_failure_fails_the_session() {
    let env = Env::new();
    env.net.fail_when(|c| matches!(c, NetCall::EnableForwarding(_)));

    // The backend came up, so the request itself succeeds.
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.main_state(), MainState::Error);
    assert_eq!(tracker.session_error(), Some(SessionError::IpForwardingEnable));
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Init));
    assert_eq!(tracker.link_error("wlan0"), Some(ShareError::InternalError));
    assert_eq!(
        env.listener.events(),
        vec![
            Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Serving),
            Event::Sharing(true),
            Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Error),
            Event::Sharing(false),
        ]
    );
}

#[test]
fn backend_failures_map_to_technology_errors() {
    let env = Env::new();

    env.wifi.fail_enable.store(true, Ordering::SeqCst);
    assert_eq!(env.settle(|t| t.start_sharing(SharingType::Wifi)), Err(ShareError::WifiSharing));
    // The failed request is not remembered, so stopping has nothing to do.
    assert_eq!(env.settle(|t| t.stop_sharing(SharingType::Wifi)), Ok(()));
    assert_eq!(env.wifi.disables.load(Ordering::SeqCst), 0);

    env.settle(|t| t.start_sharing(SharingType::Usb)).unwrap();
    env.usb.fail_disable.store(true, Ordering::SeqCst);
    assert_eq!(env.settle(|t| t.stop_sharing(SharingType::Usb)), Err(ShareError::UsbSharing));
    // The request is dropped anyway.
    env.usb.fail_disable.store(false, Ordering::SeqCst);
    assert_eq!(env.settle(|t| t.stop_sharing(SharingType::Usb)), Ok(()));
    assert_eq!(env.usb.disables.load(Ordering::SeqCst), 1);

    // Other technologies are unaffected.
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();
    assert_eq!(env.tracker.link_state("bt-pan"), Some(SubState::Shared));
}

#[test]
fn restart_fails_if_backend_cannot_stop() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();

    env.bluetooth.fail_disable.store(true, Ordering::SeqCst);
    assert_eq!(env.settle(|t| t.start_sharing(SharingType::Bluetooth)), Err(ShareError::BluetoothSharing));
    assert_eq!(env.bluetooth.enables.load(Ordering::SeqCst), 1);
    assert_eq!(env.tracker.link_state("bt-pan"), Some(SubState::Shared));
}

#[test]
fn unsupported_sharing_is_refused() {
    let env = Env::with_config(ShareConfig::default().supported(false));

    assert!(!env.tracker.is_sharing_supported());
    assert_eq!(env.tracker.start_sharing(SharingType::Wifi), Err(ShareError::NotSupported));
    assert_eq!(env.tracker.stop_sharing(SharingType::Wifi), Err(ShareError::NotSupported));
    assert_eq!(env.tracker.sharing_state(SharingType::Wifi), Err(ShareError::NotSupported));
    assert_eq!(env.tracker.sharable_regexes(SharingType::Wifi), Err(ShareError::NotSupported));
    assert_eq!(env.wifi.enables.load(Ordering::SeqCst), 0);
}

#[test]
fn invalid_pattern_is_rejected() {
    let net = std::sync::Arc::new(tether_net::mock::MockNetControl::new());
    let monitor = std::sync::Arc::new(crate::common::FakeMonitor::default());

    let result = tether_core::Tracker::new(ShareConfig::default().wifi_patterns(["wlan("]), net, monitor);
    assert_eq!(result.err(), Some(ShareError::InvalidParam));
}
