use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tether_wire::MacAddr;

use crate::command;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("invalid interface name: {0:?}")]
    InvalidInterface(String),
    #[error("failed to parse {what}: {value:?}")]
    Parse { what: &'static str, value: String },
    #[error("rejected: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An IPv4 DHCP address pool served on a downstream link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpRange {
    /// Name of the DHCP server instance, per technology.
    pub server_name: String,
    pub gateway: Ipv4Addr,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub mask: Ipv4Addr,
}

/// Byte counters of one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl TrafficStats {
    pub fn total(&self) -> u64 {
        self.rx_bytes.saturating_add(self.tx_bytes)
    }
}

/// Kernel networking operations used while sharing.
///
/// Every call is synchronous and may block on the kernel or a helper process.
pub trait NetControl: Send + Sync + 'static {
    /// Turns on IP forwarding on behalf of `requester`. Enabling twice is not an error.
    fn enable_forwarding(&self, requester: &str) -> Result<()>;
    /// Drops `requester`'s claim on IP forwarding.
    fn disable_forwarding(&self, requester: &str) -> Result<()>;

    fn add_interface_forward(&self, from: &str, to: &str) -> Result<()>;
    fn remove_interface_forward(&self, from: &str, to: &str) -> Result<()>;

    /// Masquerades traffic from `downstream` leaving through `upstream`.
    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<()>;
    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<()>;

    fn add_interface_to_local_network(&self, iface: &str) -> Result<()>;
    fn remove_interface_from_local_network(&self, iface: &str) -> Result<()>;

    /// Adds a route to `destination` (CIDR) through `iface` in the local network table. An
    /// unspecified `next_hop` means directly connected.
    fn add_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()>;
    fn remove_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()>;

    fn add_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;
    fn remove_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()>;

    fn start_dhcp_server(&self, iface: &str, range: &DhcpRange) -> Result<()>;
    fn stop_dhcp_server(&self, iface: &str) -> Result<()>;

    fn start_dns_proxy(&self) -> Result<()>;
    fn stop_dns_proxy(&self) -> Result<()>;
    /// Binds the DNS proxy to the network identified by `net_id`.
    fn set_dns_proxy_network(&self, net_id: u32) -> Result<()>;

    fn interface_mtu(&self, iface: &str) -> Result<u32>;
    fn interface_mac(&self, iface: &str) -> Result<MacAddr>;
    /// Global unicast IPv6 addresses configured on `iface`.
    fn interface_ipv6_addrs(&self, iface: &str) -> Result<Vec<Ipv6Addr>>;
    fn interface_stats(&self, iface: &str) -> Result<TrafficStats>;
}
