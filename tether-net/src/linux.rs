use std::{
    fs,
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
    process::Child,
};

use nix::ifaddrs::getifaddrs;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tether_wire::MacAddr;

use crate::{
    command::Runner,
    sysctl::{self, Ip, Protocol},
    DhcpRange, Error, NetControl, Result, TrafficStats,
};

/// Routing table holding the routes to downstream subnets.
pub const LOCAL_NETWORK_TABLE: u32 = 97;
/// Priority of the policy rules sending downstream traffic to [`LOCAL_NETWORK_TABLE`].
pub const LOCAL_NETWORK_RULE_PRIORITY: u32 = 17000;

const DHCP_LEASE_TIME: &str = "1h";

/// [`NetControl`] for a Linux host, driving sysctl, `ip`, `iptables` and `dnsmasq`.
///
/// Requires `CAP_NET_ADMIN`.
pub struct LinuxNetControl {
    sys_class_net: PathBuf,
    /// Who asked for IP forwarding. Forwarding stays on while this is non-empty.
    forwarding: Mutex<FxHashSet<String>>,
    /// Downstreams masqueraded per upstream.
    nat: Mutex<FxHashMap<String, FxHashSet<String>>>,
    dhcp_servers: Mutex<FxHashMap<String, Child>>,
    dns_proxy: Mutex<Option<Child>>,
}

impl LinuxNetControl {
    pub fn new() -> Self {
        Self::with_sys_class_net("/sys/class/net")
    }

    /// Reads interface attributes from `root` instead of `/sys/class/net`.
    pub fn with_sys_class_net(root: impl Into<PathBuf>) -> Self {
        Self {
            sys_class_net: root.into(),
            forwarding: Mutex::default(),
            nat: Mutex::default(),
            dhcp_servers: Mutex::default(),
            dns_proxy: Mutex::default(),
        }
    }

    fn set_forwarding(enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        sysctl::write(Ip::Forwarding, Protocol::V4, value)?;
        sysctl::write(Ip::Forwarding, Protocol::V6, value)?;
        tracing::info!(enabled, "set ip forwarding");
        Ok(())
    }

    fn read_attr(&self, iface: &str, attr: &str) -> Result<String> {
        let iface = checked(iface)?;
        let path = self.sys_class_net.join(iface).join(attr);
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    fn read_counter(&self, iface: &str, attr: &str) -> Result<u64> {
        let value = self.read_attr(iface, attr)?;
        value.parse().map_err(|_| Error::Parse { what: "interface counter", value })
    }

    fn route_args(op: &str, iface: &str, destination: &str, next_hop: &str) -> Vec<String> {
        let mut args = Vec::new();
        if destination.contains(':') {
            args.push("-6".to_string());
        }
        args.extend(["route", op, destination].map(String::from));
        if !is_unspecified(next_hop) {
            args.extend(["via".to_string(), next_hop.to_string()]);
        }
        args.extend(["dev".to_string(), iface.to_string()]);
        args.extend(["table".to_string(), LOCAL_NETWORK_TABLE.to_string()]);
        args
    }
}

impl NetControl for LinuxNetControl {
    fn enable_forwarding(&self, requester: &str) -> Result<()> {
        let mut requesters = self.forwarding.lock();
        if requesters.is_empty() {
            Self::set_forwarding(true)?;
        }
        requesters.insert(requester.to_string());
        Ok(())
    }

    fn disable_forwarding(&self, requester: &str) -> Result<()> {
        let mut requesters = self.forwarding.lock();
        if !requesters.remove(requester) {
            tracing::debug!(requester, "forwarding was not requested");
        }
        if requesters.is_empty() {
            Self::set_forwarding(false)?;
        }
        Ok(())
    }

    fn add_interface_forward(&self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (checked(from)?, checked(to)?);
        Runner::run("iptables", ["-A", "FORWARD", "-i", from, "-o", to, "-j", "ACCEPT"])?;
        Runner::run(
            "iptables",
            ["-A", "FORWARD", "-i", to, "-o", from, "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        )?;
        Ok(())
    }

    fn remove_interface_forward(&self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (checked(from)?, checked(to)?);
        Runner::run("iptables", ["-D", "FORWARD", "-i", from, "-o", to, "-j", "ACCEPT"])?;
        Runner::run(
            "iptables",
            ["-D", "FORWARD", "-i", to, "-o", from, "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
        )?;
        Ok(())
    }

    fn enable_nat(&self, downstream: &str, upstream: &str) -> Result<()> {
        let (downstream, upstream) = (checked(downstream)?, checked(upstream)?);
        let mut nat = self.nat.lock();
        let users = nat.entry(upstream.to_string()).or_default();
        if users.is_empty() {
            Runner::run("iptables", ["-t", "nat", "-A", "POSTROUTING", "-o", upstream, "-j", "MASQUERADE"])?;
        }
        users.insert(downstream.to_string());
        Ok(())
    }

    fn disable_nat(&self, downstream: &str, upstream: &str) -> Result<()> {
        let mut nat = self.nat.lock();
        let Some(users) = nat.get_mut(upstream) else {
            return Ok(());
        };
        users.remove(downstream);
        if users.is_empty() {
            nat.remove(upstream);
            Runner::run("iptables", ["-t", "nat", "-D", "POSTROUTING", "-o", checked(upstream)?, "-j", "MASQUERADE"])?;
        }
        Ok(())
    }

    fn add_interface_to_local_network(&self, iface: &str) -> Result<()> {
        let table = LOCAL_NETWORK_TABLE.to_string();
        let priority = LOCAL_NETWORK_RULE_PRIORITY.to_string();
        for family in ["-4", "-6"] {
            Runner::run("ip", [family, "rule", "add", "iif", checked(iface)?, "table", &table, "priority", &priority])?;
        }
        Ok(())
    }

    fn remove_interface_from_local_network(&self, iface: &str) -> Result<()> {
        let table = LOCAL_NETWORK_TABLE.to_string();
        let priority = LOCAL_NETWORK_RULE_PRIORITY.to_string();
        for family in ["-4", "-6"] {
            Runner::run("ip", [family, "rule", "del", "iif", checked(iface)?, "table", &table, "priority", &priority])?;
        }
        Ok(())
    }

    fn add_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()> {
        Runner::run("ip", Self::route_args("add", checked(iface)?, destination, next_hop))?;
        Ok(())
    }

    fn remove_route(&self, iface: &str, destination: &str, next_hop: &str) -> Result<()> {
        Runner::run("ip", Self::route_args("del", checked(iface)?, destination, next_hop))?;
        Ok(())
    }

    fn add_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{addr}/{prefix_len}");
        Runner::run("ip", ["addr", "add", &cidr, "dev", checked(iface)?])?;
        Ok(())
    }

    fn remove_interface_address(&self, iface: &str, addr: IpAddr, prefix_len: u8) -> Result<()> {
        let cidr = format!("{addr}/{prefix_len}");
        Runner::run("ip", ["addr", "del", &cidr, "dev", checked(iface)?])?;
        Ok(())
    }

    fn start_dhcp_server(&self, iface: &str, range: &DhcpRange) -> Result<()> {
        let iface = checked(iface)?;
        let mut servers = self.dhcp_servers.lock();
        if servers.contains_key(iface) {
            tracing::debug!(iface, "dhcp server already running");
            return Ok(());
        }

        let child = Runner::spawn(
            "dnsmasq",
            [
                "--keep-in-foreground".to_string(),
                "--conf-file=/dev/null".to_string(),
                "--port=0".to_string(),
                "--bind-interfaces".to_string(),
                format!("--interface={iface}"),
                format!("--pid-file=/run/{}.pid", range.server_name),
                format!("--dhcp-range={},{},{},{DHCP_LEASE_TIME}", range.start, range.end, range.mask),
                format!("--dhcp-option=option:router,{}", range.gateway),
                format!("--dhcp-option=option:dns-server,{}", range.gateway),
            ],
        )?;

        tracing::info!(iface, server = %range.server_name, pid = child.id(), "started dhcp server");
        servers.insert(iface.to_string(), child);
        Ok(())
    }

    fn stop_dhcp_server(&self, iface: &str) -> Result<()> {
        let Some(mut child) = self.dhcp_servers.lock().remove(iface) else {
            return Ok(());
        };

        child.kill()?;
        child.wait()?;
        tracing::info!(iface, "stopped dhcp server");
        Ok(())
    }

    fn start_dns_proxy(&self) -> Result<()> {
        let mut proxy = self.dns_proxy.lock();
        if proxy.is_some() {
            return Ok(());
        }

        let child = Runner::spawn(
            "dnsmasq",
            ["--keep-in-foreground", "--conf-file=/dev/null", "--no-dhcp-interface=", "--pid-file=/run/dns-proxy.pid"],
        )?;
        tracing::info!(pid = child.id(), "started dns proxy");
        *proxy = Some(child);
        Ok(())
    }

    fn stop_dns_proxy(&self) -> Result<()> {
        let Some(mut child) = self.dns_proxy.lock().take() else {
            return Ok(());
        };

        child.kill()?;
        child.wait()?;
        tracing::info!("stopped dns proxy");
        Ok(())
    }

    fn set_dns_proxy_network(&self, net_id: u32) -> Result<()> {
        // The proxy resolves through the main table, there is nothing to rebind.
        tracing::debug!(net_id, "dns proxy network changed");
        Ok(())
    }

    fn interface_mtu(&self, iface: &str) -> Result<u32> {
        let value = self.read_attr(iface, "mtu")?;
        value.parse().map_err(|_| Error::Parse { what: "mtu", value })
    }

    fn interface_mac(&self, iface: &str) -> Result<MacAddr> {
        let value = self.read_attr(iface, "address")?;
        value.parse().map_err(|_| Error::Parse { what: "mac address", value })
    }

    fn interface_ipv6_addrs(&self, iface: &str) -> Result<Vec<Ipv6Addr>> {
        let iface = checked(iface)?;
        let addrs = getifaddrs().map_err(std::io::Error::from)?.filter_map(|ifa| {
            let addr = ifa.address.as_ref()?.as_sockaddr_in6()?.ip();
            Some((ifa.interface_name, addr))
        });
        Ok(global_ipv6_addrs(iface, addrs))
    }

    fn interface_stats(&self, iface: &str) -> Result<TrafficStats> {
        Ok(TrafficStats {
            rx_bytes: self.read_counter(iface, "statistics/rx_bytes")?,
            tx_bytes: self.read_counter(iface, "statistics/tx_bytes")?,
        })
    }
}

impl Default for LinuxNetControl {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinuxNetControl {
    fn drop(&mut self) {
        for (iface, mut child) in self.dhcp_servers.lock().drain() {
            if let Err(e) = child.kill() {
                tracing::warn!(iface, ?e, "failed to kill dhcp server");
            }
        }
        if let Some(mut child) = self.dns_proxy.lock().take() {
            let _ = child.kill();
        }
    }
}

/// Rejects names that can't be a kernel interface name.
fn checked(iface: &str) -> Result<&str> {
    let valid = !iface.is_empty()
        && iface.len() < 16
        && !iface.starts_with('-')
        && iface.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));
    if valid {
        Ok(iface)
    } else {
        Err(Error::InvalidInterface(iface.to_string()))
    }
}

fn is_unspecified(next_hop: &str) -> bool {
    next_hop.is_empty() || next_hop.parse::<IpAddr>().map(|a| a.is_unspecified()).unwrap_or(false)
}

/// Keeps the global unicast addresses of `iface`, in order, without duplicates.
fn global_ipv6_addrs(iface: &str, addrs: impl IntoIterator<Item = (String, Ipv6Addr)>) -> Vec<Ipv6Addr> {
    let mut out = Vec::new();
    for (name, addr) in addrs {
        let link_local = (addr.segments()[0] & 0xffc0) == 0xfe80;
        if name != iface || addr.is_loopback() || addr.is_multicast() || addr.is_unspecified() || link_local {
            continue;
        }
        if !out.contains(&addr) {
            out.push(addr);
        }
    }
    out
}
