#![doc(issue_tracker_base_url = "https://github.com/chainbound/tether-rs/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use tether_core::*;
pub use tether_net::{linux::LinuxNetControl, mock::MockNetControl, DhcpRange, NetControl, TrafficStats};
pub use tether_wire::{DeprecatedInfo, IpPrefix, MacAddr, RaParams};

pub mod net {
    pub use tether_net::*;
}

pub mod wire {
    pub use tether_wire::*;
}
