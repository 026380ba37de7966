use std::{
    io,
    net::{Ipv6Addr, Shutdown, UdpSocket},
};

use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::config::RaConfig;

/// Link-local all-routers group, where clients send solicitations.
const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Opens a blocking raw ICMPv6 socket bound to `iface`.
///
/// The kernel fills in the ICMPv6 checksum. The socket is handed back as a [`UdpSocket`]
/// so both loops can use the plain datagram API.
pub(super) fn open(iface: &str, index: u32, config: &RaConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))?;

    // RFC 4861 requires a hop limit of 255 on every ND message.
    socket.set_multicast_hops_v6(255)?;
    socket.set_unicast_hops_v6(255)?;
    socket.set_multicast_loop_v6(false)?;
    socket.set_multicast_if_v6(index)?;
    socket.bind_device(Some(iface.as_bytes()))?;
    socket.join_multicast_v6(&ALL_ROUTERS, index)?;

    socket.set_write_timeout(Some(config.send_timeout))?;
    socket.set_read_timeout(Some(config.recv_timeout))?;

    Ok(socket.into())
}

/// Shuts `socket` down so a receiver blocked on it returns at once.
pub(super) fn close(socket: &UdpSocket) {
    match SockRef::from(socket).shutdown(Shutdown::Both) {
        Ok(()) => {}
        // Unconnected sockets report this, blocked readers are woken anyway.
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => tracing::warn!(?e, "failed to shut down ra socket"),
    }
}
