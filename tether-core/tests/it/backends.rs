use std::sync::Arc;

use tether_core::{
    BtPanState, MainState, ShareConfig, ShareError, SharingType, SubState, Tracker, UsbFunctionState,
};
use tether_net::mock::MockNetControl;

use crate::common::{Env, FakeMonitor};

#[test]
fn pan_state_drives_bluetooth_link() {
    let env = Env::new();
    let tracker = &env.tracker;

    env.settle(|t| t.on_bluetooth_state(BtPanState::Connected));
    assert_eq!(tracker.link_state("bt-pan"), Some(SubState::Shared));

    env.settle(|t| {
        t.on_bluetooth_state(BtPanState::Disconnecting);
        t.interface_status_changed("bt-pan", false);
    });
    assert_eq!(tracker.link_state("bt-pan"), Some(SubState::Unavailable));
    assert_eq!(tracker.main_state(), MainState::Init);

    // Back up, but not requested until the PAN is connected.
    env.settle(|t| {
        t.on_bluetooth_state(BtPanState::Connecting);
        t.interface_status_changed("bt-pan", true);
    });
    assert_eq!(tracker.link_state("bt-pan"), Some(SubState::Init));

    env.settle(|t| t.on_bluetooth_state(BtPanState::Connected));
    assert_eq!(tracker.link_state("bt-pan"), Some(SubState::Shared));
    assert_eq!(tracker.links(), vec!["bt-pan".to_string()]);

    env.settle(|t| t.on_bluetooth_state(BtPanState::Disconnected));
    assert!(tracker.links().is_empty());
}

#[test]
fn removed_usb_interface_drops_its_link() {
    let env = Env::new();
    let tracker = &env.tracker;

    env.settle(|t| {
        t.on_usb_state(UsbFunctionState::RndisEnabling);
        t.interface_added("usb0");
    });
    assert_eq!(tracker.link_state("usb0"), Some(SubState::Shared));

    env.settle(|t| t.interface_removed("usb0"));
    assert!(tracker.links().is_empty());
    assert_eq!(tracker.main_state(), MainState::Init);
}

#[test]
fn missing_backend_is_unsupported() {
    let tracker = Tracker::new(
        ShareConfig::default(),
        Arc::new(MockNetControl::new()),
        Arc::new(FakeMonitor::default()),
    )
    .unwrap();

    assert_eq!(tracker.start_sharing(SharingType::Usb), Err(ShareError::NotSupported));
    // Nothing requested, nothing to stop.
    assert_eq!(tracker.stop_sharing(SharingType::Usb), Ok(()));
}
