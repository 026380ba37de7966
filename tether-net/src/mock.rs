//! A [`NetControl`] that records calls instead of touching the host.

use std::net::{IpAddr, Ipv6Addr};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_wire::MacAddr;

use crate::{DhcpRange, Error, NetControl, Result, TrafficStats};

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCall {
    EnableForwarding(String),
    DisableForwarding(String),
    AddInterfaceForward { from: String, to: String },
    RemoveInterfaceForward { from: String, to: String },
    EnableNat { downstream: String, upstream: String },
    DisableNat { downstream: String, upstream: String },
    AddLocalNetwork(String),
    RemoveLocalNetwork(String),
    AddRoute { iface: String, destination: String, next_hop: String },
    RemoveRoute { iface: String, destination: String, next_hop: String },
    AddAddress { iface: String, addr: IpAddr, prefix_len: u8 },
    RemoveAddress { iface: String, addr: IpAddr, prefix_len: u8 },
    StartDhcp { iface: String, range: DhcpRange },
    StopDhcp(String),
    StartDnsProxy,
    StopDnsProxy,
    SetDnsProxyNetwork(u32),
}

type FailWhen = Box<dyn Fn(&NetCall) -> bool + Send + Sync>;

#[derive(Default)]
struct Interface {
    mtu: Option<u32>,
    mac: Option<MacAddr>,
    ipv6: Vec<Ipv6Addr>,
    stats: TrafficStats,
}

/// Records every mutating call and answers queries from configured interfaces.
///
/// Mutations succeed unless a failure rule added with [`MockNetControl::fail_when`] matches.
/// Failing calls are still recorded.
#[derive(Default)]
pub struct MockNetControl {
    calls: Mutex<Vec<NetCall>>,
    rules: Mutex<Vec<FailWhen>>,
    ifaces: Mutex<FxHashMap<String, Interface>>,
}

impl MockNetControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call matching `f` fail.
    pub fn fail_when<F>(&self, f: F)
    where
        F: Fn(&NetCall) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().push(Box::new(f));
    }

    pub fn clear_failures(&self) {
        self.rules.lock().clear();
    }

    pub fn set_mtu(&self, iface: &str, mtu: u32) {
        self.ifaces.lock().entry(iface.to_string()).or_default().mtu = Some(mtu);
    }

    pub fn set_mac(&self, iface: &str, mac: MacAddr) {
        self.ifaces.lock().entry(iface.to_string()).or_default().mac = Some(mac);
    }

    pub fn set_ipv6_addrs(&self, iface: &str, addrs: Vec<Ipv6Addr>) {
        self.ifaces.lock().entry(iface.to_string()).or_default().ipv6 = addrs;
    }

    pub fn set_stats(&self, iface: &str, stats: TrafficStats) {
        self.ifaces.lock().entry(iface.to_string()).or_default().stats = stats;
    }

    /// Forgets everything configured for `iface`, so its queries fail again.
    pub fn forget(&self, iface: &str) {
        self.ifaces.lock().remove(iface);
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<NetCall> {
        self.calls.lock().clone()
    }

    /// Returns and forgets the recorded calls.
    pub fn take_calls(&self) -> Vec<NetCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    pub fn count(&self, f: impl Fn(&NetCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: NetCall) -> Result<()> {
        let fail = self.rules.lock().iter().any(|rule| rule(&call));
        let err = fail.then(|| Error::Rejected(format!("{call:?}")));
        self.calls.lock().push(call);

        match err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn missing(iface: &str) -> Error {
        Error::InvalidInterface(iface.to_string())
    }
}

impl NetControl for MockNetControl {
    fn enable_forwarding(&self, requester: &str) -> Result<()> {
        self.record(NetCall::EnableForwarding(requester.to_string()))
    }

    fn disable_forwarding(&self, requester: &str) -> Result<()> {
        self.record(NetCall::DisableForwarding(requester.to_string()))
    }

    fn add_interface_forward(&self, from: &str, to: &str) -> Result<()> {
        self.record(NetCall::AddInterfaceForward { from: from.to_string(), to: to.to_string() })
    }

    fn remove_interface_forward(&self, from: &str, to: &str) -> Result<()> {
        self.record(NetCall::RemoveInterfaceForward { from: from.to_string(), to: to.to_string() })
    }

    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<()> {
        self.record(NetCall::EnableNat { downstream: downstream.to_string(), upstream: upstream.to_string() })
    }

    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<()> {
        self.record(NetCall::DisableNat { downstream: downstream.to_string(), upstream: upstream.to_string() })
    }

    fn add_interface_to_local_network(&self, iface: &str) -> Result<()> {
        self.record(NetCall::AddLocalNetwork(iface.to_string()))
    }

    fn remove_interface_from_local_network(&self, iface: &str) -> Result<()> {
        self.record(NetCall::RemoveLocalNetwork(iface.to_string()))
    }

    fn add_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()> {
        self.record(NetCall::AddRoute {
            iface: iface.to_string(),
            destination: destination.to_string(),
            next_hop: next_hop.to_string(),
        })
    }

    fn remove_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()> {
        self.record(NetCall::RemoveRoute {
            iface: iface.to_string(),
            destination: destination.to_string(),
            next_hop: next_hop.to_string(),
        })
    }

    fn add_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        self.record(NetCall::AddAddress { iface: iface.to_string(), addr, prefix_len })
    }

    fn remove_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        self.record(NetCall::RemoveAddress { iface: iface.to_string(), addr, prefix_len })
    }

    fn start_dhcp_server(&self, iface: &str, range: &DhcpRange) -> Result<()> {
        self.record(NetCall::StartDhcp { iface: iface.to_string(), range: range.clone() })
    }

    fn stop_dhcp_server(&self, iface: &str) -> Result<()> {
        self.record(NetCall::StopDhcp(iface.to_string()))
    }

    fn start_dns_proxy(&self) -> Result<()> {
        self.record(NetCall::StartDnsProxy)
    }

    fn stop_dns_proxy(&self) -> Result<()> {
        self.record(NetCall::StopDnsProxy)
    }

    fn set_dns_proxy_network(&self, net_id: u32) -> Result<()> {
        self.record(NetCall::SetDnsProxyNetwork(net_id))
    }

    fn interface_mtu(&self, iface: &str) -> Result<u32> {
        self.ifaces.lock().get(iface).and_then(|i| i.mtu).ok_or_else(|| Self::missing(iface))
    }

    fn interface_mac(&self, iface: &str) -> Result<MacAddr> {
        self.ifaces.lock().get(iface).and_then(|i| i.mac).ok_or_else(|| Self::missing(iface))
    }

    fn interface_ipv6_addrs(&self, iface: &str) -> Result<Vec<Ipv6Addr>> {
        Ok(self.ifaces.lock().get(iface).map(|i| i.ipv6.clone()).unwrap_or_default())
    }

    fn interface_stats(&self, iface: &str) -> Result<TrafficStats> {
        self.ifaces.lock().get(iface).map(|i| i.stats).ok_or_else(|| Self::missing(iface))
    }
}
