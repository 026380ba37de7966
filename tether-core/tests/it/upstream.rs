use tether_core::{
    MainState, NetHandle, ShareError, SharingIfaceState, SharingType, SubState, UpstreamEvent, UpstreamEventKind,
};
use tether_net::mock::NetCall;

use crate::common::{upstream, Env, Event};

fn wlan0_forward(to: &str) -> NetCall {
    NetCall::AddInterfaceForward { from: "wlan0".into(), to: to.into() }
}

fn position(calls: &[NetCall], call: &NetCall) -> usize {
    calls.iter().position(|c| c == call).unwrap_or_else(|| panic!("{call:?} not in {calls:?}"))
}

#[test]
fn switch_rewires_shared_links() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.net.take_calls();
    env.listener.take();

    env.settle(|t| {
        t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(upstream(101, "rmnet0"))))
    });

    let calls = env.net.calls();
    let removed = position(&calls, &NetCall::RemoveInterfaceForward { from: "wlan0".into(), to: "eth0".into() });
    let added = position(&calls, &wlan0_forward("rmnet0"));
    assert!(removed < added);
    assert!(calls.contains(&NetCall::SetDnsProxyNetwork(101)));
    assert!(calls[added..].contains(&NetCall::AddRoute {
        iface: "wlan0".into(),
        destination: "192.168.43.0/24".into(),
        next_hop: "0.0.0.0".into(),
    }));

    assert_eq!(env.tracker.upstream().map(|u| u.handle), Some(NetHandle(101)));
    assert_eq!(env.tracker.link("wlan0").unwrap().upstream_iface().as_deref(), Some("rmnet0"));
    assert_eq!(env.listener.events(), vec![Event::Upstream(Some(NetHandle(101)))]);
}

#[test]
fn failed_install_returns_link_to_init() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.listener.take();

    env.net.fail_when(|c| *c == NetCall::AddInterfaceForward { from: "wlan0".into(), to: "rmnet0".into() });
    env.settle(|t| {
        t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(upstream(101, "rmnet0"))))
    });

    let tracker = &env.tracker;
    assert_eq!(tracker.link_state("wlan0"), Some(SubState::Init));
    assert_eq!(tracker.link_error("wlan0"), Some(ShareError::EnableForwarding));
    assert_eq!(tracker.main_state(), MainState::Init);
    assert!(tracker.upstream().is_none());

    // The partial install is undone.
    assert!(env.net.calls().contains(&NetCall::DisableNat { downstream: "wlan0".into(), upstream: "rmnet0".into() }));
    assert_eq!(
        env.listener.events(),
        vec![
            Event::Upstream(Some(NetHandle(101))),
            Event::Iface(SharingType::Wifi, "wlan0".into(), SharingIfaceState::Error),
            Event::Sharing(false),
        ]
    );
}

#[test]
fn link_properties_change_reselects_best() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    env.monitor.set(Some(upstream(102, "wwan0")));
    env.settle(|t| t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::LinkPropertiesChanged, None)));

    assert_eq!(env.tracker.upstream().map(|u| u.iface().to_string()), Some("wwan0".to_string()));
    assert!(env.net.calls().contains(&wlan0_forward("wwan0")));
    // Nothing to relay without a network handle.
    assert!(!env.listener.events().iter().any(|e| matches!(e, Event::Upstream(_))));
}

#[test]
fn lost_network_is_only_reported() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();
    env.net.take_calls();

    env.settle(|t| t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::Lost, Some(upstream(100, "eth0")))));

    assert!(env.net.calls().is_empty());
    assert_eq!(env.tracker.link("wlan0").unwrap().upstream_iface().as_deref(), Some("eth0"));
    assert_eq!(env.listener.events().last(), Some(&Event::Upstream(Some(NetHandle(100)))));
}

#[test]
fn events_while_idle_only_reach_listeners() {
    let env = Env::new();

    env.settle(|t| {
        t.on_upstream_event(UpstreamEvent::new(UpstreamEventKind::DefaultSwitched, Some(upstream(100, "eth0"))))
    });

    assert_eq!(env.tracker.main_state(), MainState::Init);
    assert!(env.tracker.upstream().is_none());
    assert!(env.net.calls().is_empty());
    assert_eq!(env.listener.events(), vec![Event::Upstream(Some(NetHandle(100)))]);
}

#[test]
fn upstream_is_dropped_when_sharing_ends() {
    let env = Env::new();
    env.monitor.set(Some(upstream(100, "eth0")));
    env.settle(|t| t.start_sharing(SharingType::Wifi)).unwrap();

    env.settle(|t| t.stop_sharing(SharingType::Wifi)).unwrap();

    assert!(env.tracker.upstream().is_none());
    let calls = env.net.calls();
    assert!(calls.contains(&NetCall::RemoveInterfaceForward { from: "wlan0".into(), to: "eth0".into() }));
    assert_eq!(calls.last(), Some(&NetCall::StopDnsProxy));
}
