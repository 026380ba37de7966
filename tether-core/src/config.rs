use std::{net::Ipv4Addr, time::Duration};

use regex::Regex;
use tether_net::DhcpRange;

use crate::SharingType;

/// Settings of one downstream technology.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Interface name patterns identifying this technology.
    pub patterns: Vec<String>,
    /// Interface created when the backend reports it is up.
    pub default_iface: String,
    /// IPv4 address of the device on this link.
    pub gateway: Ipv4Addr,
    pub dhcp_server: String,
}

impl LinkConfig {
    fn new(patterns: &[&str], default_iface: &str, gateway: Ipv4Addr, dhcp_server: &str) -> Self {
        Self {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
            default_iface: default_iface.to_string(),
            gateway,
            dhcp_server: dhcp_server.to_string(),
        }
    }
}

/// Router advertisement timing.
#[derive(Debug, Clone)]
pub struct RaConfig {
    /// Number of quick advertisements after a change.
    pub urgent_count: u32,
    pub urgent_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub send_timeout: Duration,
    /// How often the receive loop wakes up to check for shutdown.
    pub recv_timeout: Duration,
}

impl Default for RaConfig {
    fn default() -> Self {
        Self {
            urgent_count: 10,
            urgent_interval: Duration::from_secs(3),
            min_interval: Duration::from_secs(300),
            max_interval: Duration::from_secs(600),
            send_timeout: Duration::from_millis(300),
            recv_timeout: Duration::from_secs(1),
        }
    }
}

impl RaConfig {
    pub fn urgent(mut self, count: u32, interval: Duration) -> Self {
        self.urgent_count = count;
        self.urgent_interval = interval;
        self
    }

    /// Sets the bounds of the randomized unsolicited interval.
    pub fn interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_interval = min;
        self.max_interval = max.max(min);
        self
    }

    pub fn timeouts(mut self, send: Duration, recv: Duration) -> Self {
        self.send_timeout = send;
        self.recv_timeout = recv;
        self
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Answer of `is_sharing_supported`. When false every start request is refused.
    pub supported: bool,
    pub wifi: LinkConfig,
    pub usb: LinkConfig,
    pub bluetooth: LinkConfig,
    /// Prefix length of every downstream IPv4 subnet.
    pub prefix_len: u8,
    /// Last host handed out by DHCP. Clamped below the subnet broadcast address.
    pub dhcp_end_host: u8,
    /// The access point serves DHCP itself, so none is started for Wi-Fi links.
    pub wifi_ap_runs_dhcp: bool,
    pub max_listeners: usize,
    pub ra: RaConfig,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            supported: true,
            wifi: LinkConfig::new(&[r"^wlan\d+$"], "wlan0", Ipv4Addr::new(192, 168, 43, 1), "wifi-dhcp"),
            usb: LinkConfig::new(&[r"^rndis\d+$", r"^usb\d+$"], "rndis0", Ipv4Addr::new(192, 168, 42, 1), "usb-dhcp"),
            bluetooth: LinkConfig::new(&[r"^bt-pan$"], "bt-pan", Ipv4Addr::new(192, 168, 44, 1), "bt-dhcp"),
            prefix_len: 24,
            dhcp_end_host: 254,
            wifi_ap_runs_dhcp: true,
            max_listeners: 100,
            ra: RaConfig::default(),
        }
    }
}

impl ShareConfig {
    pub fn supported(mut self, supported: bool) -> Self {
        self.supported = supported;
        self
    }

    pub fn wifi_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wifi.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn usb_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.usb.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn bluetooth_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bluetooth.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn default_iface(mut self, ty: SharingType, iface: impl Into<String>) -> Self {
        self.link_mut(ty).default_iface = iface.into();
        self
    }

    pub fn gateway(mut self, ty: SharingType, gateway: Ipv4Addr) -> Self {
        self.link_mut(ty).gateway = gateway;
        self
    }

    pub fn dhcp_end_host(mut self, host: u8) -> Self {
        self.dhcp_end_host = host;
        self
    }

    pub fn wifi_ap_runs_dhcp(mut self, runs_dhcp: bool) -> Self {
        self.wifi_ap_runs_dhcp = runs_dhcp;
        self
    }

    pub fn max_listeners(mut self, max: usize) -> Self {
        self.max_listeners = max;
        self
    }

    pub fn ra(mut self, ra: RaConfig) -> Self {
        self.ra = ra;
        self
    }

    pub fn link(&self, ty: SharingType) -> &LinkConfig {
        match ty {
            SharingType::Wifi => &self.wifi,
            SharingType::Usb => &self.usb,
            SharingType::Bluetooth => &self.bluetooth,
        }
    }

    fn link_mut(&mut self, ty: SharingType) -> &mut LinkConfig {
        match ty {
            SharingType::Wifi => &mut self.wifi,
            SharingType::Usb => &mut self.usb,
            SharingType::Bluetooth => &mut self.bluetooth,
        }
    }

    fn netmask(&self) -> Ipv4Addr {
        let len = u32::from(self.prefix_len.min(32));
        let bits = if len == 0 { 0 } else { u32::MAX << (32 - len) };
        Ipv4Addr::from(bits)
    }

    /// The DHCP pool of a link: from the host after the gateway up to `dhcp_end_host`, never
    /// reaching the broadcast address.
    pub fn dhcp_range(&self, ty: SharingType) -> DhcpRange {
        let link = self.link(ty);
        let mask = self.netmask();
        let network = u32::from(link.gateway) & u32::from(mask);
        let last_host = u32::from(self.dhcp_end_host).min((!u32::from(mask)).saturating_sub(1));

        DhcpRange {
            server_name: link.dhcp_server.clone(),
            gateway: link.gateway,
            start: Ipv4Addr::from(u32::from(link.gateway).saturating_add(1)),
            end: Ipv4Addr::from(network | last_host),
            mask,
        }
    }

    /// Destination of the route to a link's subnet, e.g. `192.168.43.0/24`.
    pub fn subnet_route(&self, ty: SharingType) -> String {
        let network = u32::from(self.link(ty).gateway) & u32::from(self.netmask());
        format!("{}/{}", Ipv4Addr::from(network), self.prefix_len)
    }

    /// Compiles the interface name patterns.
    pub fn classifier(&self) -> Result<IfaceClassifier, regex::Error> {
        let mut entries = Vec::new();
        for ty in SharingType::ALL {
            for pattern in &self.link(ty).patterns {
                entries.push((ty, Regex::new(pattern)?));
            }
        }
        Ok(IfaceClassifier { entries })
    }
}

/// Maps interface names to the technology they belong to.
#[derive(Debug, Clone)]
pub struct IfaceClassifier {
    entries: Vec<(SharingType, Regex)>,
}

impl IfaceClassifier {
    pub fn classify(&self, iface: &str) -> Option<SharingType> {
        self.entries.iter().find(|(_, re)| re.is_match(iface)).map(|(ty, _)| *ty)
    }

    pub fn patterns(&self, ty: SharingType) -> Vec<String> {
        self.entries.iter().filter(|(t, _)| *t == ty).map(|(_, re)| re.as_str().to_string()).collect()
    }
}
