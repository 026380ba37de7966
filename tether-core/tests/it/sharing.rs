use std::sync::atomic::Ordering;

use tether_core::{MainState, SharingIfaceState, SharingType, SubState, TrafficKind};
use tether_net::{mock::NetCall, TrafficStats};

use crate::common::{upstream, Env, Event};

#[test]
fn wifi_start_shares_wlan0() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));

    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.links(), vec!["wlan0".to_string()]);
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Shared));
    assert_eq!(tracker.main_state(), MainState::Alive);
    assert!(tracker.is_sharing());
    assert_eq!(tracker.upstream().map(|u| u.iface().to_string()), Some("eth0".to_string()));

    assert_eq!(
        env.listener.events(),
        vec![Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Serving), Event::Sharing(true)]
    );

    let calls = env.net.calls();
    assert_eq!(calls.first(), Some(&NetCall::EnableForwarding("tether".into())));
    assert!(calls.contains(&NetCall::StartDnsProxy));
    assert!(calls.contains(&NetCall::SetDnsProxyNetwork(100)));
    assert!(calls.contains(&NetCall::AddInterfaceForward { from: "wlan0".into(), to: "eth0".into() }));
    assert!(calls.contains(&NetCall::AddRoute {
        iface: "wlan0".into(),
        destination: "192.168.43.0/24".into(),
        next_hop: "0.0.0.0".into(),
    }));
    // The access point runs DHCP itself.
    assert_eq!(env.net.count(|c| matches!(c, NetCall::StartDhcp { .. })), 0);
}

#[test]
fn projections_follow_link_states() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.sharing_state(SharingType::Wifi), Ok(SharingIfaceState::Serving));
    assert_eq!(tracker.sharing_state(SharingType::Usb), Ok(SharingIfaceState::CanServe));
    assert_eq!(tracker.sharing_ifaces(SharingIfaceState::Serving), Ok(vec!["wlan0".to_string()]));
    assert_eq!(tracker.sharing_ifaces(SharingIfaceState::Error), Ok(vec![]));
    assert_eq!(tracker.sharable_regexes(SharingType::Usb).unwrap(), vec![r"^rndis\d+$", r"^usb\d+$"]);
    assert!(tracker.is_sharing_supported());
}

#[test]
fn restart_tears_down_then_reshares() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    let first = env.tracker.link("wlan0").unwrap();
    env.listener.take();

    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    let tracker = &env.tracker;
    assert_eq!(tracker.links(), vec!["wlan0".to_string()]);
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Shared));
    assert_eq!(tracker.main_state(), MainState::Alive);
    assert_eq!(first.state(), SubState::Init);

    assert_eq!(env.wifi.enables.load(Ordering::SeqCst), 2);
    assert_eq!(env.wifi.disables.load(Ordering::SeqCst), 1);
    assert_eq!(env.net.count(|c| matches!(c, NetCall::EnableForwarding(_))), 2);
    assert_eq!(env.net.count(|c| matches!(c, NetCall::DisableForwarding(_))), 1);

    assert_eq!(
        env.listener.events(),
        vec![
            Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::CanServe),
            Event::Sharing(false),
            Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Serving),
            Event::Sharing(true),
        ]
    );
}

#[test]
fn stop_when_not_requested_is_noop() {
    let env = Env::new();

    assert_eq!(env.settle(|t| t.stop_sharing(SharingType::Usb)), Ok(()));

    assert_eq!(env.usb.disables.load(Ordering::SeqCst), 0);
    assert!(env.tracker.links().is_empty());
    assert!(env.net.calls().is_empty());
    assert!(env.listener.events().is_empty());
    assert_eq!(env.tracker.main_state(), MainState::Init);
}

#[test]
fn stop_tears_down_links() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();
    assert_eq!(env.tracker.link_state("bt-pan"), Some(SubState::Shared));

    env.settle(|t| t.stop_sharing(SharingType::Bluetooth)).unwrap();

    assert!(env.tracker.links().is_empty());
    assert!(!env.tracker.is_sharing());
    assert_eq!(env.tracker.main_state(), MainState::Init);
    assert!(env.net.calls().contains(&NetCall::StopDhcp("bt-pan".into())));
    assert_eq!(env.net.calls().last(), Some(&NetCall::DisableForwarding("tether".into())));

    // A second stop has nothing left to do.
    env.settle(|t| t.stop_sharing(SharingType::Bluetooth)).unwrap();
    assert_eq!(env.bluetooth.disables.load(Ordering::SeqCst), 1);
}

#[test]
fn usb_link_comes_from_interface_events() {
    let env = Env::new();

    // Not enabled yet: interface churn is ignored.
    env.settle(|t| t.interface_added("rndis0"));
    assert!(env.tracker.links().is_empty());

    env.share_usb();
    assert_eq!(env.tracker.link_state("rndis0"), Some(SubState::Shared));

    let dhcp = env.net.calls().into_iter().find_map(|c| match c {
        NetCall::StartDhcp { iface, range } => Some((iface, range)),
        _ => None,
    });
    let (iface, range) = dhcp.unwrap();
    assert_eq!(iface, "rndis0");
    assert_eq!(range.gateway.to_string(), "192.168.42.1");

    // Down events only matter while the function is being disabled.
    env.settle(|t| t.interface_status_changed("rndis0", false));
    assert_eq!(env.tracker.link_state("rndis0"), Some(SubState::Shared));

    env.settle(|t| t.stop_sharing(SharingType::Usb)).unwrap();
    assert!(env.tracker.links().is_empty());
    assert_eq!(env.tracker.main_state(), MainState::Init);
}

#[test]
fn unrelated_interfaces_are_ignored() {
    let env = Env::new();

    env.settle(|t| {
        t.interface_added("eth0");
        t.interface_added("wlan1");
        t.interface_status_changed("bt-pan", true);
        t.interface_removed("rmnet0");
    });

    assert!(env.tracker.links().is_empty());
    assert!(env.net.calls().is_empty());
}

#[test]
fn closing_access_point_makes_link_unavailable() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.listener.take();

    env.settle(|t| {
        t.on_wifi_state(tether_core::WifiApState::Closing);
        t.interface_status_changed("wlan0", false);
    });

    assert_eq!(env.tracker.link_state("wlan0"), Some(SubState::Unavailable));
    assert_eq!(env.tracker.main_state(), MainState::Init);
    assert_eq!(env.tracker.sharing_state(SharingType::Wifi), Ok(SharingIfaceState::Error));
    assert_eq!(
        env.listener.take(),
        vec![Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Error), Event::Sharing(false)]
    );

    env.settle(|t| t.on_wifi_state(tether_core::WifiApState::Closed));
    assert!(env.tracker.links().is_empty());
}

#[test]
fn traffic_sums_shared_links() {
    let env = Env::new();
    env.net.set_stats("wlan0", TrafficStats { rx_bytes: 2048, tx_bytes: 1024 });
    env.net.set_stats("bt-pan", TrafficStats { rx_bytes: 1024, tx_bytes: 4096 });
    // Not a link, never counted.
    env.net.set_stats("rndis0", TrafficStats { rx_bytes: 1 << 30, tx_bytes: 1 << 30 });

    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();

    assert_eq!(env.tracker.shared_traffic(TrafficKind::Rx), Ok(3));
    assert_eq!(env.tracker.shared_traffic(TrafficKind::Tx), Ok(5));
    assert_eq!(env.tracker.shared_traffic(TrafficKind::All), Ok(8));
}

#[test]
fn traffic_saturates() {
    let env = Env::new();
    env.net.set_stats("wlan0", TrafficStats { rx_bytes: u64::MAX - 1, tx_bytes: 1 << 42 });
    env.net.set_stats("bt-pan", TrafficStats { rx_bytes: u64::MAX - 1, tx_bytes: 0 });

    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();

    assert_eq!(env.tracker.shared_traffic(TrafficKind::Rx), Ok(i32::MAX));
    assert_eq!(env.tracker.shared_traffic(TrafficKind::Tx), Ok(i32::MAX));
    assert_eq!(env.tracker.shared_traffic(TrafficKind::All), Ok(i32::MAX));
}

#[test]
fn shutdown_stops_everything() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.settle(|t| t.start_sharing(SharingType::Bluetooth)).unwrap();
    assert_eq!(env.tracker.main_state(), MainState::Alive);

    env.tracker.shutdown();

    assert!(env.tracker.links().is_empty());
    assert_eq!(env.tracker.main_state(), MainState::Init);
    assert_eq!(env.net.count(|c| matches!(c, NetCall::DisableForwarding(_))), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_and_shutdown_from_async_context() {
    let env = Env::new();
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    assert!(env.tracker.is_sharing());

    env.tracker.shutdown();

    assert!(env.tracker.links().is_empty());
    assert_eq!(env.tracker.main_state(), MainState::Init);
}
