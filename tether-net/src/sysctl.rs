//! Access to the `/proc/sys/net/*` parameters touched while sharing.

use std::{fs, io};

/// Address family of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    #[default]
    V4,
    V6,
}

/// A kernel parameter with a per-family file under `/proc/sys/net`.
pub trait SysctlParam {
    fn path(&self, protocol: Protocol) -> &'static str;
}

/// Reads `param`, without the trailing newline.
pub fn read<P: SysctlParam>(param: P, protocol: Protocol) -> io::Result<String> {
    fs::read_to_string(param.path(protocol)).map(|s| s.trim().to_string())
}

/// Fails if the parameter doesn't exist or the process lacks the privilege to change it.
pub fn write<P: SysctlParam>(param: P, protocol: Protocol, value: &str) -> io::Result<()> {
    fs::write(param.path(protocol), value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ip {
    /// Routes packets between interfaces. Shared links need it on for both families.
    Forwarding,
}

impl SysctlParam for Ip {
    fn path(&self, protocol: Protocol) -> &'static str {
        match (self, protocol) {
            (Self::Forwarding, Protocol::V4) => "/proc/sys/net/ipv4/ip_forward",
            (Self::Forwarding, Protocol::V6) => "/proc/sys/net/ipv6/conf/all/forwarding",
        }
    }
}
