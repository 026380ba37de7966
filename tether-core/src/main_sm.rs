//! Session-wide sharing lifecycle.
//!
//! `Alive` while at least one link is shared. Owns global IP forwarding and upstream
//! selection. A session failure moves it to `Error`, which forwards the failure to every
//! known link so none keeps forwarding.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tether_net::NetControl;

use crate::{
    dispatch::EventLock,
    sub_sm::{SubEvent, SubState, SubStateMachine},
    upstream::{Upstream, UpstreamEvent, UpstreamEventKind, UpstreamMonitor, UpstreamNetworkInfo},
    SessionError,
};

/// Name under which forwarding is requested from the control plane.
pub const FORWARDING_REQUESTER: &str = "tether";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainState {
    Init,
    Alive,
    Error,
}

#[derive(Debug, Clone)]
pub enum MainEvent {
    /// A link entered `Shared`.
    IfaceActive(Arc<SubStateMachine>),
    /// A link left `Shared`.
    IfaceInactive(Arc<SubStateMachine>),
    Upstream(UpstreamEvent),
    ClearError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MainEventKind {
    IfaceActive,
    IfaceInactive,
    Upstream,
    ClearError,
}

impl MainEvent {
    pub fn kind(&self) -> MainEventKind {
        match self {
            Self::IfaceActive(_) => MainEventKind::IfaceActive,
            Self::IfaceInactive(_) => MainEventKind::IfaceInactive,
            Self::Upstream(_) => MainEventKind::Upstream,
            Self::ClearError => MainEventKind::ClearError,
        }
    }
}

/// What the main machine needs from its owner.
pub trait MainSmHost: Send + Sync {
    /// Installs `upstream` as the current upstream and hands it to every shared link.
    fn set_upstream(&self, upstream: Option<UpstreamNetworkInfo>);

    fn current_upstream(&self) -> Upstream;
}

type Handler = fn(&MainStateMachine, &MainEvent);

struct Transition {
    state: MainState,
    event: MainEventKind,
    handler: Handler,
    next: Option<MainState>,
}

fn transitions() -> Vec<Transition> {
    use MainEventKind as E;
    use MainState as S;

    let row = |state, event, handler: Handler, next| Transition { state, event, handler, next };
    vec![
        row(S::Init, E::IfaceActive, MainStateMachine::on_first_active, Some(S::Alive)),
        row(S::Init, E::IfaceInactive, MainStateMachine::on_inactive_idle, None),
        row(S::Alive, E::IfaceActive, MainStateMachine::on_active, None),
        row(S::Alive, E::IfaceInactive, MainStateMachine::on_inactive, None),
        row(S::Alive, E::Upstream, MainStateMachine::on_upstream, None),
        row(S::Error, E::IfaceInactive, MainStateMachine::on_inactive_error, None),
        row(S::Error, E::ClearError, MainStateMachine::on_clear_error, Some(S::Init)),
    ]
}

#[derive(Debug)]
struct Inner {
    state: MainState,
    error: Option<SessionError>,
    /// Links currently shared.
    subs: Vec<Arc<SubStateMachine>>,
    forwarding: bool,
}

pub struct MainStateMachine {
    net: Arc<dyn NetControl>,
    monitor: Arc<dyn UpstreamMonitor>,
    lock: EventLock,
    host: Weak<dyn MainSmHost>,
    table: Vec<Transition>,
    inner: Mutex<Inner>,
}

impl MainStateMachine {
    pub fn new(
        net: Arc<dyn NetControl>,
        monitor: Arc<dyn UpstreamMonitor>,
        lock: EventLock,
        host: Weak<dyn MainSmHost>,
    ) -> Self {
        Self {
            net,
            monitor,
            lock,
            host,
            table: transitions(),
            inner: Mutex::new(Inner { state: MainState::Init, error: None, subs: Vec::new(), forwarding: false }),
        }
    }

    pub fn state(&self) -> MainState {
        self.inner.lock().state
    }

    pub fn error(&self) -> Option<SessionError> {
        self.inner.lock().error
    }

    pub fn is_forwarding(&self) -> bool {
        self.inner.lock().forwarding
    }

    /// Number of links the machine considers shared.
    pub fn shared_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    pub fn handle_event(&self, event: MainEvent) {
        let _guard = self.lock.enter();

        let state = self.state();
        let kind = event.kind();
        let Some(transition) = self.table.iter().find(|t| t.state == state && t.event == kind) else {
            tracing::warn!(?state, event = ?kind, "no main transition for event");
            return;
        };

        (transition.handler)(self, &event);
        if let Some(next) = transition.next {
            self.switch_to(next);
        }
    }

    /// Records `err` and moves to `Error`, tearing down every known link.
    pub fn switch_to_error(&self, err: SessionError) {
        let _guard = self.lock.enter();

        tracing::error!(?err, "session error");
        self.inner.lock().error = Some(err);
        self.switch_to(MainState::Error);
    }

    fn switch_to(&self, next: MainState) {
        let prev = {
            let mut inner = self.inner.lock();
            if inner.state == next {
                return;
            }
            std::mem::replace(&mut inner.state, next)
        };

        tracing::info!(from = ?prev, to = ?next, "session state changed");

        if prev == MainState::Alive {
            self.alive_exit();
        }
        match next {
            MainState::Alive => self.alive_enter(),
            MainState::Error => self.error_enter(),
            MainState::Init => {}
        }
    }

    fn alive_enter(&self) {
        if let Err(err) = self.net.enable_forwarding(FORWARDING_REQUESTER) {
            tracing::error!(?err, "failed to enable ip forwarding");
            self.switch_to_error(SessionError::IpForwardingEnable);
            return;
        }
        self.inner.lock().forwarding = true;

        if self.shared_count() > 0 {
            self.choose_upstream();
        }
    }

    fn alive_exit(&self) {
        if let Some(host) = self.host.upgrade() {
            host.set_upstream(None);
        }
    }

    fn error_enter(&self) {
        let (err, subs) = {
            let inner = self.inner.lock();
            (inner.error, inner.subs.clone())
        };
        let Some(err) = err else {
            return;
        };

        for sub in subs {
            sub.handle_event(SubEvent::SessionError(err));
        }
    }

    fn choose_upstream(&self) {
        let best = self.monitor.current_best_upstream();
        tracing::info!(upstream = ?best.as_ref().map(|u| u.iface().to_string()), "selected upstream");

        if let Some(host) = self.host.upgrade() {
            host.set_upstream(best);
        }
    }

    fn add_sub(&self, sub: &Arc<SubStateMachine>) {
        let mut inner = self.inner.lock();
        if !inner.subs.iter().any(|s| Arc::ptr_eq(s, sub)) {
            inner.subs.push(Arc::clone(sub));
        }
    }

    /// Returns true if no links remain.
    fn remove_sub(&self, sub: &Arc<SubStateMachine>) -> bool {
        let mut inner = self.inner.lock();
        inner.subs.retain(|s| !Arc::ptr_eq(s, sub));
        inner.subs.is_empty()
    }

    fn on_first_active(&self, event: &MainEvent) {
        if let MainEvent::IfaceActive(sub) = event {
            self.add_sub(sub);
        }
    }

    fn on_inactive_idle(&self, event: &MainEvent) {
        if let MainEvent::IfaceInactive(sub) = event {
            self.remove_sub(sub);
        }
    }

    fn on_active(&self, event: &MainEvent) {
        let MainEvent::IfaceActive(sub) = event else {
            return;
        };
        self.add_sub(sub);

        let Some(host) = self.host.upgrade() else {
            return;
        };
        match host.current_upstream() {
            Some(upstream) => sub.handle_event(SubEvent::ConnectionChanged(Some(upstream))),
            None => self.choose_upstream(),
        }
    }

    fn on_inactive(&self, event: &MainEvent) {
        let MainEvent::IfaceInactive(sub) = event else {
            return;
        };
        if !self.remove_sub(sub) {
            return;
        }

        match self.net.disable_forwarding(FORWARDING_REQUESTER) {
            Ok(()) => {
                self.inner.lock().forwarding = false;
                self.switch_to(MainState::Init);
            }
            Err(err) => {
                tracing::error!(?err, "failed to disable ip forwarding");
                self.switch_to_error(SessionError::IpForwardingDisable);
            }
        }
    }

    fn on_upstream(&self, event: &MainEvent) {
        let MainEvent::Upstream(upstream) = event else {
            return;
        };

        match upstream.kind {
            UpstreamEventKind::LinkPropertiesChanged => self.choose_upstream(),
            UpstreamEventKind::DefaultSwitched => {
                if let Some(host) = self.host.upgrade() {
                    host.set_upstream(upstream.info.clone());
                }
            }
            UpstreamEventKind::Lost | UpstreamEventKind::CapabilitiesChanged => {
                tracing::info!(kind = ?upstream.kind, handle = ?upstream.handle(), "upstream event");
            }
        }
    }

    fn on_inactive_error(&self, event: &MainEvent) {
        let MainEvent::IfaceInactive(sub) = event else {
            return;
        };
        self.remove_sub(sub);

        let err = self.error();
        if let (Some(err), SubState::Shared) = (err, sub.state()) {
            sub.handle_event(SubEvent::SessionError(err));
        }
    }

    fn on_clear_error(&self, _event: &MainEvent) {
        let forwarding = {
            let mut inner = self.inner.lock();
            inner.error = None;
            inner.subs.clear();
            inner.forwarding
        };

        if forwarding {
            match self.net.disable_forwarding(FORWARDING_REQUESTER) {
                Ok(()) => self.inner.lock().forwarding = false,
                Err(err) => tracing::warn!(?err, "failed to disable ip forwarding after error"),
            }
        }
    }
}

impl std::fmt::Debug for MainStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainStateMachine").field("inner", &*self.inner.lock()).finish()
    }
}
