use std::net::Ipv6Addr;

use crate::MacAddr;

/// Hop limit advertised to clients.
pub const DEFAULT_HOP_LIMIT: u8 = 255;
/// Smallest link MTU permitted by IPv6.
pub const IPV6_MIN_MTU: u32 = 1280;
/// MTU used when the interface MTU cannot be read.
pub const DEFAULT_MTU: u32 = 1500;
/// Router, valid and preferred lifetime in seconds (6 * 600s).
pub const DEFAULT_LIFETIME: u32 = 3600;
/// Length of every prefix derived from an upstream address.
pub const DEFAULT_PREFIX_LEN: u8 = 64;

/// A prefix to advertise on a downstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    /// Address assigned to the downstream interface inside this prefix.
    pub address: Ipv6Addr,
    /// The network part, host bits zeroed.
    pub prefix: Ipv6Addr,
    /// Prefix length in bits.
    pub len: u8,
}

impl IpPrefix {
    pub fn new(prefix: Ipv6Addr, len: u8, address: Ipv6Addr) -> Self {
        Self { address, prefix: mask(prefix, len), len }
    }

    /// Derives a `/64` from an upstream address, with the downstream address built from the
    /// EUI-64 identifier of `mac`.
    pub fn from_upstream(upstream: Ipv6Addr, mac: MacAddr) -> Self {
        let prefix = mask(upstream, DEFAULT_PREFIX_LEN);
        Self { address: mac.eui64_address(prefix), prefix, len: DEFAULT_PREFIX_LEN }
    }

    /// Returns the prefix as `<network>/<len>`.
    pub fn to_cidr(&self) -> String {
        format!("{}/{}", self.prefix, self.len)
    }
}

/// Zeroes every bit of `addr` past `len`.
pub fn mask(addr: Ipv6Addr, len: u8) -> Ipv6Addr {
    let len = u32::from(len.min(128));
    let bits = u128::from(addr);
    let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
    Ipv6Addr::from(bits & mask)
}

/// What a downstream link currently advertises over IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaParams {
    pub name: String,
    pub mac: Option<MacAddr>,
    pub mtu: u32,
    pub hop_limit: u8,
    pub has_default_route: bool,
    pub prefixes: Vec<IpPrefix>,
    pub dnses: Vec<Ipv6Addr>,
}

impl Default for RaParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            mac: None,
            mtu: DEFAULT_MTU,
            hop_limit: DEFAULT_HOP_LIMIT,
            has_default_route: false,
            prefixes: Vec::new(),
            dnses: Vec::new(),
        }
    }
}

impl RaParams {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Clamps `mtu` to the range a link may advertise.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu.clamp(IPV6_MIN_MTU, DEFAULT_MTU);
        self
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_default_route(mut self, has_default_route: bool) -> Self {
        self.has_default_route = has_default_route;
        self
    }

    pub fn with_prefixes(mut self, prefixes: Vec<IpPrefix>) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub fn with_dnses(mut self, dnses: Vec<Ipv6Addr>) -> Self {
        self.dnses = dnses;
        self
    }

    pub fn router_lifetime(&self) -> u16 {
        if self.has_default_route {
            DEFAULT_LIFETIME as u16
        } else {
            0
        }
    }
}

/// Entries advertised by a previous [`RaParams`] that the current one no longer carries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeprecatedInfo {
    pub prefixes: Vec<IpPrefix>,
    pub dnses: Vec<Ipv6Addr>,
}

impl DeprecatedInfo {
    /// Computes what `old` advertised that `new` withdraws.
    pub fn between(old: &RaParams, new: &RaParams) -> Self {
        let prefixes = old
            .prefixes
            .iter()
            .filter(|p| !new.prefixes.iter().any(|n| n.prefix == p.prefix && n.len == p.len))
            .copied()
            .collect();
        let dnses = old.dnses.iter().filter(|d| !new.dnses.contains(d)).copied().collect();

        Self { prefixes, dnses }
    }

    /// Folds a newer diff into this one. Entries that reappear in `current` are dropped.
    pub fn merge(&mut self, newer: DeprecatedInfo, current: &RaParams) {
        for p in newer.prefixes {
            if !self.prefixes.contains(&p) {
                self.prefixes.push(p);
            }
        }
        for d in newer.dnses {
            if !self.dnses.contains(&d) {
                self.dnses.push(d);
            }
        }

        self.prefixes.retain(|p| !current.prefixes.iter().any(|c| c.prefix == p.prefix && c.len == p.len));
        self.dnses.retain(|d| !current.dnses.contains(d));
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.dnses.is_empty()
    }
}
