//! ICMPv6 neighbor discovery messages used by the router advertisement daemon.
//!
//! Only the subset of RFC 4861 needed to advertise a downstream link is covered: Router
//! Solicitations are recognized and Router Advertisements are assembled and parsed with the
//! source link-layer address, MTU, prefix information and recursive DNS server options.
//!
//! Each call to [`Decoder::decode`] treats the whole buffer as one datagram.

use std::net::Ipv6Addr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    ra::{RaParams, DEFAULT_LIFETIME},
    MacAddr,
};

pub const ICMPV6_ROUTER_SOLICIT: u8 = 133;
pub const ICMPV6_ROUTER_ADVERT: u8 = 134;

pub const ND_OPT_SOURCE_LINK_ADDR: u8 = 1;
pub const ND_OPT_PREFIX_INFO: u8 = 3;
pub const ND_OPT_MTU: u8 = 5;
pub const ND_OPT_RDNSS: u8 = 25;

/// Fixed part of a router advertisement.
pub const RA_HEADER_LEN: usize = 16;
/// Fixed part of a router solicitation.
pub const RS_HEADER_LEN: usize = 8;

pub const SLLA_OPT_LEN: usize = 8;
pub const MTU_OPT_LEN: usize = 8;
pub const PIO_OPT_LEN: usize = 32;

/// Default router preference bits of the RA flags byte.
pub const DEFAULT_ROUTER_PREF: u8 = 0x08;
/// On-link and autonomous address-configuration flags.
pub const PREFIX_INFO_FLAGS: u8 = 0xc0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("truncated message: {0} bytes")]
    Truncated(usize),
    #[error("malformed option of type {0}")]
    MalformedOption(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NdMessage {
    RouterSolicit { source_mac: Option<MacAddr> },
    RouterAdvert(RouterAdvert),
    /// Any other ICMPv6 type.
    Other(u8),
}

impl NdMessage {
    pub fn is_router_solicit(&self) -> bool {
        matches!(self, Self::RouterSolicit { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixInfo {
    pub prefix: Ipv6Addr,
    pub len: u8,
    pub flags: u8,
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
}

/// A parsed router advertisement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterAdvert {
    pub hop_limit: u8,
    pub flags: u8,
    pub router_lifetime: u16,
    pub reachable_time: u32,
    pub retrans_timer: u32,
    pub source_mac: Option<MacAddr>,
    pub mtu: Option<u32>,
    pub prefixes: Vec<PrefixInfo>,
    pub dnses: Vec<Ipv6Addr>,
}

/// Returns the number of bytes [`NdCodec`] writes for `params`.
pub fn encoded_len(params: &RaParams) -> usize {
    let mut len = RA_HEADER_LEN + MTU_OPT_LEN + params.prefixes.len() * PIO_OPT_LEN;
    if params.mac.is_some() {
        len += SLLA_OPT_LEN;
    }
    if !params.dnses.is_empty() {
        len += 8 + params.dnses.len() * 16;
    }
    len
}

#[derive(Debug, Default)]
pub struct NdCodec;

impl NdCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for NdCodec {
    type Item = NdMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut datagram = src.split_to(src.len());
        let len = datagram.len();

        match datagram[0] {
            ICMPV6_ROUTER_SOLICIT => {
                if len < RS_HEADER_LEN {
                    return Err(Error::Truncated(len));
                }
                datagram.advance(RS_HEADER_LEN);

                let mut source_mac = None;
                parse_options(&mut datagram, |kind, body| {
                    if kind == ND_OPT_SOURCE_LINK_ADDR {
                        source_mac = Some(read_mac(kind, body)?);
                    }
                    Ok(())
                })?;

                Ok(Some(NdMessage::RouterSolicit { source_mac }))
            }
            ICMPV6_ROUTER_ADVERT => {
                if len < RA_HEADER_LEN {
                    return Err(Error::Truncated(len));
                }

                // type, code, checksum
                datagram.advance(4);
                let mut ra = RouterAdvert {
                    hop_limit: datagram.get_u8(),
                    flags: datagram.get_u8(),
                    router_lifetime: datagram.get_u16(),
                    reachable_time: datagram.get_u32(),
                    retrans_timer: datagram.get_u32(),
                    ..Default::default()
                };

                parse_options(&mut datagram, |kind, mut body| {
                    match kind {
                        ND_OPT_SOURCE_LINK_ADDR => ra.source_mac = Some(read_mac(kind, body)?),
                        ND_OPT_MTU => {
                            if body.len() < 6 {
                                return Err(Error::MalformedOption(kind));
                            }
                            body.advance(2);
                            ra.mtu = Some(body.get_u32());
                        }
                        ND_OPT_PREFIX_INFO => {
                            if body.len() < PIO_OPT_LEN - 2 {
                                return Err(Error::MalformedOption(kind));
                            }
                            let len = body.get_u8();
                            let flags = body.get_u8();
                            let valid_lifetime = body.get_u32();
                            let preferred_lifetime = body.get_u32();
                            body.advance(4);
                            let prefix = read_ipv6(&mut body);
                            ra.prefixes.push(PrefixInfo {
                                prefix,
                                len,
                                flags,
                                valid_lifetime,
                                preferred_lifetime,
                            });
                        }
                        ND_OPT_RDNSS => {
                            if body.len() < 6 {
                                return Err(Error::MalformedOption(kind));
                            }
                            body.advance(6);
                            while body.len() >= 16 {
                                ra.dnses.push(read_ipv6(&mut body));
                            }
                        }
                        _ => tracing::trace!(kind, "skipping unknown nd option"),
                    }
                    Ok(())
                })?;

                Ok(Some(NdMessage::RouterAdvert(ra)))
            }
            other => Ok(Some(NdMessage::Other(other))),
        }
    }
}

impl<'a> Encoder<&'a RaParams> for NdCodec {
    type Error = Error;

    fn encode(&mut self, params: &'a RaParams, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(encoded_len(params));

        // Header. The checksum is filled in by the kernel for raw ICMPv6 sockets.
        dst.put_u8(ICMPV6_ROUTER_ADVERT);
        dst.put_u8(0);
        dst.put_u16(0);
        dst.put_u8(params.hop_limit);
        dst.put_u8(DEFAULT_ROUTER_PREF);
        dst.put_u16(params.router_lifetime());
        dst.put_u32(0);
        dst.put_u32(0);

        if let Some(mac) = params.mac {
            dst.put_u8(ND_OPT_SOURCE_LINK_ADDR);
            dst.put_u8((SLLA_OPT_LEN / 8) as u8);
            dst.put_slice(&mac.octets());
        }

        dst.put_u8(ND_OPT_MTU);
        dst.put_u8((MTU_OPT_LEN / 8) as u8);
        dst.put_u16(0);
        dst.put_u32(params.mtu);

        for prefix in &params.prefixes {
            dst.put_u8(ND_OPT_PREFIX_INFO);
            dst.put_u8((PIO_OPT_LEN / 8) as u8);
            dst.put_u8(prefix.len);
            dst.put_u8(PREFIX_INFO_FLAGS);
            dst.put_u32(DEFAULT_LIFETIME);
            dst.put_u32(DEFAULT_LIFETIME);
            dst.put_u32(0);
            dst.put_slice(&prefix.prefix.octets());
        }

        if !params.dnses.is_empty() {
            dst.put_u8(ND_OPT_RDNSS);
            dst.put_u8((1 + 2 * params.dnses.len()) as u8);
            dst.put_u16(0);
            dst.put_u32(DEFAULT_LIFETIME);
            for dns in &params.dnses {
                dst.put_slice(&dns.octets());
            }
        }

        Ok(())
    }
}

/// Walks the TLV options in `buf`, handing each body (without type and length) to `f`.
fn parse_options<F>(buf: &mut BytesMut, mut f: F) -> Result<(), Error>
where
    F: FnMut(u8, BytesMut) -> Result<(), Error>,
{
    while buf.remaining() >= 2 {
        let kind = buf.get_u8();
        let len = buf.get_u8() as usize * 8;
        if len == 0 {
            return Err(Error::MalformedOption(kind));
        }
        if buf.remaining() < len - 2 {
            return Err(Error::Truncated(buf.remaining()));
        }

        let body = buf.split_to(len - 2);
        f(kind, body)?;
    }

    Ok(())
}

fn read_mac(kind: u8, body: BytesMut) -> Result<MacAddr, Error> {
    let octets: [u8; 6] = body.get(..6).and_then(|b| b.try_into().ok()).ok_or(Error::MalformedOption(kind))?;
    Ok(MacAddr(octets))
}

fn read_ipv6(buf: &mut BytesMut) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ipv6Addr::from(octets)
}
