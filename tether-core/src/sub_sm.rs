//! Per-link sharing lifecycle.
//!
//! A link starts in [`SubState::Init`]. Requesting it moves it to `Shared`, which serves DHCP,
//! forwards to the current upstream and advertises IPv6 prefixes. Every state entered is
//! reported to the owner through [`SubSmCallback`].

use std::{
    net::IpAddr,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tether_net::NetControl;
use tether_wire::{ra::DEFAULT_MTU, IpPrefix, RaParams};

use crate::{
    config::ShareConfig,
    dispatch::EventLock,
    ra::RaDaemon,
    upstream::{Upstream, UpstreamNetworkInfo},
    SessionError, ShareError, SharingType,
};

/// Next hop of a directly connected IPv4 route.
const V4_DIRECT: &str = "0.0.0.0";
/// Next hop of a directly connected IPv6 route.
const V6_DIRECT: &str = "::";
const LINK_LOCAL_ROUTE: &str = "fe80::/64";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubState {
    Init,
    Shared,
    Unavailable,
}

#[derive(Debug, Clone)]
pub enum SubEvent {
    ShareRequested,
    ShareUnrequested,
    InterfaceUp,
    InterfaceDown,
    /// The upstream network changed. `None` means there is none.
    ConnectionChanged(Upstream),
    /// A session-wide failure forwarded by the main state machine.
    SessionError(SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubEventKind {
    ShareRequested,
    ShareUnrequested,
    InterfaceUp,
    InterfaceDown,
    ConnectionChanged,
    SessionError,
}

impl SubEvent {
    pub fn kind(&self) -> SubEventKind {
        match self {
            Self::ShareRequested => SubEventKind::ShareRequested,
            Self::ShareUnrequested => SubEventKind::ShareUnrequested,
            Self::InterfaceUp => SubEventKind::InterfaceUp,
            Self::InterfaceDown => SubEventKind::InterfaceDown,
            Self::ConnectionChanged(_) => SubEventKind::ConnectionChanged,
            Self::SessionError(_) => SubEventKind::SessionError,
        }
    }
}

/// Receives the state a link machine has just entered.
pub trait SubSmCallback: Send + Sync {
    fn on_sub_state(&self, sub: &Arc<SubStateMachine>, state: SubState, last_error: Option<ShareError>);
}

type Handler = fn(&SubStateMachine, &SubEvent);

struct Transition {
    state: SubState,
    event: SubEventKind,
    handler: Option<Handler>,
    next: Option<SubState>,
}

fn transitions() -> Vec<Transition> {
    use SubEventKind as E;
    use SubState as S;

    let row = |state, event, handler: Option<Handler>, next| Transition { state, event, handler, next };
    vec![
        row(S::Init, E::ShareRequested, Some(SubStateMachine::on_share_requested), Some(S::Shared)),
        row(S::Init, E::InterfaceDown, None, Some(S::Unavailable)),
        row(S::Shared, E::ShareUnrequested, None, Some(S::Init)),
        row(S::Shared, E::InterfaceDown, None, Some(S::Unavailable)),
        row(S::Shared, E::ConnectionChanged, Some(SubStateMachine::on_connection_changed), None),
        row(S::Shared, E::SessionError, Some(SubStateMachine::on_session_error), Some(S::Init)),
        row(S::Unavailable, E::InterfaceUp, None, Some(S::Init)),
    ]
}

#[derive(Debug, Default)]
struct Ipv6Setup {
    /// Prefixes whose address and route are installed on the link.
    prefixes: Vec<IpPrefix>,
    link_local_route: bool,
    params: Option<RaParams>,
}

#[derive(Debug)]
struct Inner {
    state: SubState,
    upstream: Upstream,
    last_error: Option<ShareError>,
    dhcp_started: bool,
    ipv6: Ipv6Setup,
}

/// The state machine of one downstream link.
pub struct SubStateMachine {
    iface: String,
    technology: SharingType,
    config: Arc<ShareConfig>,
    net: Arc<dyn NetControl>,
    lock: EventLock,
    callback: Weak<dyn SubSmCallback>,
    table: Vec<Transition>,
    inner: Mutex<Inner>,
    ra: Mutex<Option<RaDaemon>>,
    this: Weak<SubStateMachine>,
}

impl SubStateMachine {
    pub fn new(
        iface: impl Into<String>,
        technology: SharingType,
        config: Arc<ShareConfig>,
        net: Arc<dyn NetControl>,
        lock: EventLock,
        callback: Weak<dyn SubSmCallback>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            iface: iface.into(),
            technology,
            config,
            net,
            lock,
            callback,
            table: transitions(),
            inner: Mutex::new(Inner {
                state: SubState::Init,
                upstream: None,
                last_error: None,
                dhcp_started: false,
                ipv6: Ipv6Setup::default(),
            }),
            ra: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn technology(&self) -> SharingType {
        self.technology
    }

    pub fn state(&self) -> SubState {
        self.inner.lock().state
    }

    pub fn last_error(&self) -> Option<ShareError> {
        self.inner.lock().last_error
    }

    /// Name of the upstream interface currently forwarded to.
    pub fn upstream_iface(&self) -> Option<String> {
        self.inner.lock().upstream.as_ref().map(|u| u.iface().to_string())
    }

    /// The parameters currently advertised over IPv6.
    pub fn ra_params(&self) -> Option<RaParams> {
        self.inner.lock().ipv6.params.clone()
    }

    /// Dispatches `event` against the current state. Events without a transition are logged
    /// and dropped.
    pub fn handle_event(&self, event: SubEvent) {
        let _guard = self.lock.enter();

        let state = self.state();
        let kind = event.kind();
        let Some(transition) = self.table.iter().find(|t| t.state == state && t.event == kind) else {
            tracing::warn!(iface = %self.iface, ?state, event = ?kind, "no transition for event");
            return;
        };

        tracing::debug!(iface = %self.iface, ?state, event = ?kind, "handling event");

        if let Some(handler) = transition.handler {
            handler(self, &event);
        }
        if let Some(next) = transition.next {
            self.switch_to(next);
        }
    }

    fn switch_to(&self, next: SubState) {
        let prev = {
            let mut inner = self.inner.lock();
            if inner.state == next {
                return;
            }
            std::mem::replace(&mut inner.state, next)
        };

        tracing::info!(iface = %self.iface, from = ?prev, to = ?next, "link state changed");

        if prev == SubState::Shared {
            self.shared_exit();
        }

        match next {
            SubState::Init => self.report(SubState::Init),
            SubState::Shared => self.shared_enter(),
            SubState::Unavailable => self.report(SubState::Unavailable),
        }
    }

    fn report(&self, state: SubState) {
        let last_error = self.last_error();
        let (Some(callback), Some(this)) = (self.callback.upgrade(), self.this.upgrade()) else {
            return;
        };
        callback.on_sub_state(&this, state, last_error);
    }

    fn on_share_requested(&self, _event: &SubEvent) {
        self.inner.lock().last_error = None;
    }

    fn on_session_error(&self, event: &SubEvent) {
        if let SubEvent::SessionError(err) = event {
            tracing::warn!(iface = %self.iface, ?err, "session error, leaving shared state");
        }
        self.inner.lock().last_error = Some(ShareError::InternalError);
    }

    fn on_connection_changed(&self, event: &SubEvent) {
        let SubEvent::ConnectionChanged(upstream) = event else {
            return;
        };

        let new_iface = upstream.as_ref().map(|u| u.iface()).filter(|name| !name.is_empty());
        let old_iface = self.upstream_iface();
        if old_iface.as_deref() == new_iface {
            tracing::debug!(iface = %self.iface, upstream = ?new_iface, "upstream interface unchanged");
            return;
        }

        self.cleanup_upstream();

        let Some(upstream) = upstream.as_ref().filter(|_| new_iface.is_some()) else {
            tracing::info!(iface = %self.iface, "no upstream, forwarding removed");
            self.stop_ipv6();
            return;
        };

        if let Err(err) = self.install_forward(upstream) {
            tracing::error!(iface = %self.iface, upstream = %upstream.iface(), ?err, "failed to forward to upstream");
            self.inner.lock().last_error = Some(ShareError::EnableForwarding);
            self.switch_to(SubState::Init);
            return;
        }

        if self.technology != SharingType::Usb {
            let route = self.config.subnet_route(self.technology);
            if let Err(err) = self.net.add_route(&self.iface, &route, V4_DIRECT) {
                tracing::error!(iface = %self.iface, route = %route, ?err, "failed to add local route");
            }
        }

        tracing::info!(iface = %self.iface, upstream = %upstream.iface(), "forwarding to upstream");
        self.refresh_ipv6(upstream);
    }

    /// Masquerades and forwards this link's traffic to `upstream`. The upstream is recorded
    /// first so a partial install is undone when the link leaves `Shared`.
    fn install_forward(&self, upstream: &Arc<UpstreamNetworkInfo>) -> tether_net::Result<()> {
        self.inner.lock().upstream = Some(Arc::clone(upstream));

        let up = upstream.iface();
        self.net.enable_nat(&self.iface, up)?;
        self.net.add_interface_forward(&self.iface, up)?;
        self.net.add_interface_to_local_network(&self.iface)?;
        Ok(())
    }

    /// Removes everything installed toward the current upstream.
    fn cleanup_upstream(&self) {
        let Some(upstream) = self.inner.lock().upstream.take() else {
            return;
        };
        let up = upstream.iface();

        if self.technology != SharingType::Usb {
            let route = self.config.subnet_route(self.technology);
            if let Err(err) = self.net.remove_route(&self.iface, &route, V4_DIRECT) {
                tracing::warn!(iface = %self.iface, route = %route, ?err, "failed to remove local route");
            }
        }
        if let Err(err) = self.net.remove_interface_from_local_network(&self.iface) {
            tracing::warn!(iface = %self.iface, ?err, "failed to remove interface from local network");
        }
        if let Err(err) = self.net.remove_interface_forward(&self.iface, up) {
            tracing::warn!(iface = %self.iface, upstream = up, ?err, "failed to remove forward");
        }
        if let Err(err) = self.net.disable_nat(&self.iface, up) {
            tracing::warn!(iface = %self.iface, upstream = up, ?err, "failed to disable nat");
        }

        self.remove_ipv6_addrs();
    }

    fn shared_enter(&self) {
        // The report may wire the upstream, or fail the session, before returning.
        self.report(SubState::Shared);
        if self.state() != SubState::Shared {
            return;
        }

        if !self.start_dhcp() {
            self.inner.lock().last_error = Some(ShareError::IfaceCfg);
        }

        let upstream = self.inner.lock().upstream.clone();
        if let Some(upstream) = upstream {
            self.refresh_ipv6(&upstream);
        }
    }

    fn shared_exit(&self) {
        self.cleanup_upstream();
        self.stop_dhcp();
        self.stop_ipv6();
    }

    fn start_dhcp(&self) -> bool {
        if self.technology == SharingType::Wifi && self.config.wifi_ap_runs_dhcp {
            tracing::debug!(iface = %self.iface, "access point serves dhcp");
            return true;
        }

        let range = self.config.dhcp_range(self.technology);
        match self.net.start_dhcp_server(&self.iface, &range) {
            Ok(()) => {
                tracing::info!(iface = %self.iface, start = %range.start, end = %range.end, "dhcp started");
                self.inner.lock().dhcp_started = true;
                true
            }
            Err(err) => {
                tracing::error!(iface = %self.iface, ?err, "failed to start dhcp");
                false
            }
        }
    }

    fn stop_dhcp(&self) {
        if !std::mem::take(&mut self.inner.lock().dhcp_started) {
            return;
        }
        if let Err(err) = self.net.stop_dhcp_server(&self.iface) {
            tracing::warn!(iface = %self.iface, ?err, "failed to stop dhcp");
        }
    }

    /// Advertises prefixes derived from the upstream's global IPv6 addresses. Failures are
    /// logged and leave IPv4 sharing untouched.
    fn refresh_ipv6(&self, upstream: &UpstreamNetworkInfo) {
        let addrs = match self.net.interface_ipv6_addrs(upstream.iface()) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            Ok(_) => {
                tracing::debug!(iface = %self.iface, upstream = %upstream.iface(), "upstream has no global ipv6");
                self.stop_ipv6();
                return;
            }
            Err(err) => {
                tracing::warn!(iface = %self.iface, ?err, "failed to read upstream ipv6 addresses");
                self.stop_ipv6();
                return;
            }
        };

        let mac = match self.net.interface_mac(&self.iface) {
            Ok(mac) => mac,
            Err(err) => {
                tracing::warn!(iface = %self.iface, ?err, "no mac address, ipv6 sharing disabled");
                self.stop_ipv6();
                return;
            }
        };
        let mtu = self.net.interface_mtu(&self.iface).unwrap_or(DEFAULT_MTU);

        let mut prefixes: Vec<IpPrefix> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let prefix = IpPrefix::from_upstream(addr, mac);
            if !prefixes.iter().any(|p| p.prefix == prefix.prefix) {
                prefixes.push(prefix);
            }
        }

        let params = RaParams::new(self.iface.clone())
            .with_mac(mac)
            .with_mtu(mtu)
            .with_default_route(true)
            .with_prefixes(prefixes)
            .with_dnses(upstream.ipv6_dnses());

        if self.inner.lock().ipv6.params.as_ref() == Some(&params) {
            return;
        }

        self.remove_ipv6_addrs();
        self.add_ipv6_addrs(&params.prefixes);
        self.inner.lock().ipv6.params = Some(params.clone());

        let mut ra = self.ra.lock();
        if ra.is_none() {
            match RaDaemon::new(self.iface.clone(), self.config.ra.clone()).and_then(|mut daemon| {
                daemon.start()?;
                Ok(daemon)
            }) {
                Ok(daemon) => *ra = Some(daemon),
                Err(err) => {
                    tracing::warn!(iface = %self.iface, ?err, "failed to start ra daemon");
                    return;
                }
            }
        }
        if let Some(daemon) = ra.as_ref() {
            daemon.build_new_ra(params);
        }
    }

    fn add_ipv6_addrs(&self, prefixes: &[IpPrefix]) {
        let mut installed = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            if let Err(err) = self.net.add_interface_address(&self.iface, IpAddr::V6(prefix.address), prefix.len) {
                tracing::warn!(iface = %self.iface, address = %prefix.address, ?err, "failed to add ipv6 address");
                continue;
            }
            if let Err(err) = self.net.add_route(&self.iface, &prefix.to_cidr(), V6_DIRECT) {
                tracing::warn!(iface = %self.iface, prefix = %prefix.to_cidr(), ?err, "failed to add ipv6 route");
            }
            installed.push(*prefix);
        }

        let needs_link_local = !self.inner.lock().ipv6.link_local_route;
        let link_local = if needs_link_local && !installed.is_empty() {
            match self.net.add_route(&self.iface, LINK_LOCAL_ROUTE, V6_DIRECT) {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(iface = %self.iface, ?err, "failed to add link-local route");
                    false
                }
            }
        } else {
            false
        };

        let mut inner = self.inner.lock();
        inner.ipv6.prefixes = installed;
        inner.ipv6.link_local_route |= link_local;
    }

    fn remove_ipv6_addrs(&self) {
        let (prefixes, link_local) = {
            let mut inner = self.inner.lock();
            (std::mem::take(&mut inner.ipv6.prefixes), std::mem::take(&mut inner.ipv6.link_local_route))
        };

        for prefix in prefixes {
            if let Err(err) = self.net.remove_route(&self.iface, &prefix.to_cidr(), V6_DIRECT) {
                tracing::warn!(iface = %self.iface, prefix = %prefix.to_cidr(), ?err, "failed to remove ipv6 route");
            }
            if let Err(err) = self.net.remove_interface_address(&self.iface, IpAddr::V6(prefix.address), prefix.len) {
                tracing::warn!(iface = %self.iface, address = %prefix.address, ?err, "failed to remove ipv6 address");
            }
        }
        if link_local {
            if let Err(err) = self.net.remove_route(&self.iface, LINK_LOCAL_ROUTE, V6_DIRECT) {
                tracing::warn!(iface = %self.iface, ?err, "failed to remove link-local route");
            }
        }
    }

    fn stop_ipv6(&self) {
        if let Some(mut daemon) = self.ra.lock().take() {
            daemon.stop();
        }
        self.remove_ipv6_addrs();
        self.inner.lock().ipv6.params = None;
    }
}

impl std::fmt::Debug for SubStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStateMachine")
            .field("iface", &self.iface)
            .field("technology", &self.technology)
            .field("state", &self.state())
            .finish()
    }
}
