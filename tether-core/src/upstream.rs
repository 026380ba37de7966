use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
};

/// Opaque identifier of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetHandle(pub u32);

impl NetHandle {
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetCapabilities {
    pub internet: bool,
    pub validated: bool,
    pub not_metered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkProperties {
    pub iface: String,
    pub addrs: Vec<IpAddr>,
    pub dnses: Vec<IpAddr>,
    pub mtu: Option<u32>,
}

/// The network currently providing internet access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamNetworkInfo {
    pub handle: NetHandle,
    pub capabilities: NetCapabilities,
    pub link: LinkProperties,
}

impl UpstreamNetworkInfo {
    pub fn new(handle: NetHandle, iface: impl Into<String>) -> Self {
        Self {
            handle,
            capabilities: NetCapabilities { internet: true, validated: true, not_metered: false },
            link: LinkProperties { iface: iface.into(), ..Default::default() },
        }
    }

    pub fn with_dnses(mut self, dnses: Vec<IpAddr>) -> Self {
        self.link.dnses = dnses;
        self
    }

    pub fn iface(&self) -> &str {
        &self.link.iface
    }

    pub fn ipv6_dnses(&self) -> Vec<Ipv6Addr> {
        self.link
            .dnses
            .iter()
            .filter_map(|d| match d {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .collect()
    }
}

/// Upstream snapshot shared read-only by every link during one dispatch.
pub type Upstream = Option<Arc<UpstreamNetworkInfo>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamEventKind {
    LinkPropertiesChanged,
    Lost,
    CapabilitiesChanged,
    DefaultSwitched,
}

/// A change reported by the platform's network monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub kind: UpstreamEventKind,
    pub info: Option<UpstreamNetworkInfo>,
}

impl UpstreamEvent {
    pub fn new(kind: UpstreamEventKind, info: Option<UpstreamNetworkInfo>) -> Self {
        Self { kind, info }
    }

    pub fn handle(&self) -> Option<NetHandle> {
        self.info.as_ref().map(|i| i.handle)
    }
}

/// The platform's view of available networks.
pub trait UpstreamMonitor: Send + Sync + 'static {
    /// The network that should carry shared traffic right now, if any.
    fn current_best_upstream(&self) -> Option<UpstreamNetworkInfo>;
}
