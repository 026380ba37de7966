//! The tethering engine.
//!
//! A [`Tracker`] shares the device's upstream network over Wi-Fi, USB and Bluetooth links.
//! Each downstream interface is driven by a [`SubStateMachine`]; a single [`MainStateMachine`]
//! owns global IP forwarding and upstream selection. Both dispatch under one re-entrant
//! [`EventLock`]. Shared links advertise IPv6 prefixes with an [`RaDaemon`].

pub mod config;
pub mod dispatch;
mod error;
pub mod main_sm;
pub mod ra;
pub mod sub_sm;
pub mod tracker;
mod types;
pub mod upstream;

pub use config::{IfaceClassifier, LinkConfig, RaConfig, ShareConfig};
pub use dispatch::EventLock;
pub use error::{Result, SessionError, ShareError};
pub use main_sm::{MainEvent, MainSmHost, MainState, MainStateMachine};
pub use ra::{RaDaemon, RaError};
pub use sub_sm::{SubEvent, SubSmCallback, SubState, SubStateMachine};
pub use tracker::{BackendError, SharingBackend, SharingEventListener, Tracker, WeakTracker};
pub use types::{BackendState, BtPanState, SharingIfaceState, SharingType, TrafficKind, UsbFunctionState, WifiApState};
pub use upstream::{
    LinkProperties, NetCapabilities, NetHandle, Upstream, UpstreamEvent, UpstreamEventKind, UpstreamMonitor,
    UpstreamNetworkInfo,
};
