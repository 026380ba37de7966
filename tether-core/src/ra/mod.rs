//! Router advertisement daemon for one downstream link.
//!
//! While running, two threads share one raw ICMPv6 socket. The sender multicasts the current
//! advertisement to `ff02::1`, quickly after a parameter change and then at a randomized
//! interval (RFC 4861 section 6.2.1). The receiver answers router solicitations with a
//! unicast advertisement.

use std::{
    io,
    net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use tether_wire::{
    nd::{NdCodec, RA_HEADER_LEN},
    DeprecatedInfo, RaParams,
};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::RaConfig;

mod socket;

/// Link-local all-nodes group.
pub const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// How long the sender sleeps when there is nothing to advertise.
const IDLE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

const RECV_BUFFER_SIZE: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum RaError {
    #[error("interface {0} not found")]
    NoInterface(String),
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("daemon already running")]
    AlreadyRunning,
}

/// State shared by the daemon handle and its loops.
#[derive(Debug, Default)]
struct Shared {
    state: Mutex<AdvertState>,
    wake: Condvar,
    stop: AtomicBool,
}

#[derive(Debug, Default)]
struct AdvertState {
    params: Option<RaParams>,
    deprecated: DeprecatedInfo,
    /// Quick advertisements left before falling back to the random interval.
    urgent_left: u32,
}

impl AdvertState {
    /// Encodes the current advertisement, or returns `None` if there is nothing to send.
    fn assemble(&self, buf: &mut BytesMut) -> Option<()> {
        buf.clear();
        let params = self.params.as_ref()?;
        NdCodec::new().encode(params, buf).ok()?;
        (buf.len() >= RA_HEADER_LEN).then_some(())
    }

    /// Consumes one urgent slot if any are left and returns the wait before the next send.
    fn next_wait(&mut self, config: &RaConfig) -> Duration {
        if self.urgent_left > 0 {
            self.urgent_left -= 1;
            return config.urgent_interval;
        }

        random_interval(config)
    }
}

fn random_interval(config: &RaConfig) -> Duration {
    let min = config.min_interval.as_millis() as u64;
    let max = (config.max_interval.as_millis() as u64).max(min);
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}

/// Advertises IPv6 parameters on one interface.
#[derive(Debug)]
pub struct RaDaemon {
    iface: String,
    index: u32,
    dst: SocketAddrV6,
    config: RaConfig,
    shared: Arc<Shared>,
    socket: Option<Arc<UdpSocket>>,
    running: bool,
}

impl RaDaemon {
    /// Resolves the interface. Fails if it doesn't exist.
    pub fn new(iface: impl Into<String>, config: RaConfig) -> Result<Self, RaError> {
        let iface = iface.into();
        let index = tether_net::if_nametoindex(&iface).ok_or_else(|| RaError::NoInterface(iface.clone()))?.get();

        Ok(Self {
            dst: SocketAddrV6::new(ALL_NODES, 0, 0, index),
            iface,
            index,
            config,
            shared: Arc::default(),
            socket: None,
            running: false,
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Opens the socket and starts the send and receive loops.
    pub fn start(&mut self) -> Result<(), RaError> {
        if self.running {
            return Err(RaError::AlreadyRunning);
        }

        let socket = Arc::new(socket::open(&self.iface, self.index, &self.config)?);
        self.shared.state.lock().urgent_left = self.config.urgent_count;

        let (shared, sock, dst, config) =
            (Arc::clone(&self.shared), Arc::clone(&socket), self.dst, self.config.clone());
        thread::Builder::new()
            .name(format!("ra-send-{}", self.iface))
            .spawn(move || send_loop(&shared, &sock, dst, &config))?;

        let (shared, sock, dst) = (Arc::clone(&self.shared), Arc::clone(&socket), self.dst);
        if let Err(e) = thread::Builder::new()
            .name(format!("ra-recv-{}", self.iface))
            .spawn(move || recv_loop(&shared, &sock, dst))
        {
            self.signal_stop();
            socket::close(&socket);
            return Err(e.into());
        }

        self.socket = Some(socket);
        self.running = true;
        tracing::info!(iface = %self.iface, index = self.index, "ra daemon started");
        Ok(())
    }

    /// Stops both loops, closes the socket and forgets the advertised parameters.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        self.signal_stop();
        if let Some(socket) = self.socket.take() {
            socket::close(&socket);
        }
        self.shared = Arc::default();
        self.running = false;
        tracing::info!(iface = %self.iface, "ra daemon stopped");
    }

    fn signal_stop(&self) {
        let _state = self.shared.state.lock();
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake.notify_all();
    }

    /// Replaces the advertised parameters and schedules a burst of quick advertisements.
    ///
    /// Entries the previous parameters carried and these don't are kept as deprecated.
    pub fn build_new_ra(&self, params: RaParams) {
        let mut state = self.shared.state.lock();

        if let Some(old) = &state.params {
            let withdrawn = DeprecatedInfo::between(old, &params);
            state.deprecated.merge(withdrawn, &params);
        }

        tracing::debug!(
            iface = %self.iface,
            prefixes = params.prefixes.len(),
            deprecated = state.deprecated.prefixes.len(),
            "new ra parameters"
        );

        state.params = Some(params);
        state.urgent_left = self.config.urgent_count;
        self.shared.wake.notify_all();
    }

    pub fn params(&self) -> Option<RaParams> {
        self.shared.state.lock().params.clone()
    }

    pub fn deprecated(&self) -> DeprecatedInfo {
        self.shared.state.lock().deprecated.clone()
    }
}

impl Drop for RaDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_loop(shared: &Shared, socket: &UdpSocket, dst: SocketAddrV6, config: &RaConfig) {
    let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
    let mut state = shared.state.lock();

    while !shared.stop.load(Ordering::Acquire) {
        let wait = match state.assemble(&mut buf) {
            Some(()) => {
                let wait = state.next_wait(config);
                MutexGuard::unlocked(&mut state, || {
                    match socket.send_to(&buf, SocketAddr::V6(dst)) {
                        Ok(n) => tracing::debug!(bytes = n, ?dst, "sent unsolicited ra"),
                        Err(e) => tracing::warn!(?e, ?dst, "failed to send ra"),
                    }
                });
                wait
            }
            None => IDLE_WAIT,
        };

        // Checked under the lock, so a stop signalled while sending isn't missed.
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.wake.wait_for(&mut state, wait);
    }

    tracing::debug!(?dst, "ra send loop exited");
}

fn recv_loop(shared: &Shared, socket: &UdpSocket, multicast: SocketAddrV6) {
    let mut codec = NdCodec::new();
    let mut recv_buf = [0u8; RECV_BUFFER_SIZE];
    let mut send_buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);

    while !shared.stop.load(Ordering::Acquire) {
        let (n, from) = match socket.recv_from(&mut recv_buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            // A closed socket fails or returns nothing.
            Err(_) if shared.stop.load(Ordering::Acquire) => break,
            Err(e) => {
                tracing::warn!(?e, "failed to receive on ra socket");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let mut packet = BytesMut::from(&recv_buf[..n]);
        match codec.decode(&mut packet) {
            Ok(Some(msg)) if msg.is_router_solicit() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(?e, ?from, "dropping malformed nd message");
                continue;
            }
        }

        if shared.state.lock().assemble(&mut send_buf).is_none() {
            continue;
        }

        let to = match from {
            SocketAddr::V6(addr) if !addr.ip().is_unspecified() => SocketAddr::V6(addr),
            _ => SocketAddr::V6(multicast),
        };
        match socket.send_to(&send_buf, to) {
            Ok(_) => tracing::debug!(?to, "answered router solicitation"),
            Err(e) => tracing::warn!(?e, ?to, "failed to answer router solicitation"),
        }
    }

    tracing::debug!("ra recv loop exited");
}
