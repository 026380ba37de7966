//! Host networking operations needed to share an upstream connection with downstream links.
//!
//! [`NetControl`] is the seam between the sharing state machines and the kernel. The
//! [`linux::LinuxNetControl`] implementation drives `ip`, `iptables`, `dnsmasq` and sysctl;
//! [`mock::MockNetControl`] records every call for tests.

use std::num::NonZeroU32;

pub mod command;
mod control;
pub mod linux;
pub mod mock;
pub mod sysctl;

pub use control::{DhcpRange, Error, NetControl, Result, TrafficStats};

/// Returns the index of the network interface with the given name, if it exists.
pub fn if_nametoindex(name: &str) -> Option<NonZeroU32> {
    nix::net::if_::if_nametoindex(name).ok().and_then(NonZeroU32::new)
}
