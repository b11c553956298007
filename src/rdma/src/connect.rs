//! Connection establishment state machines for both roles. The event
//! source is abstracted behind [`CmEvent`] so the state transitions are
//! unit-testable without a real `rdma_cm_id`, the same way [`crate::verbs`]
//! isolates the data path behind [`crate::verbs::VerbsContext`].

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    ConnectRequest,
    Established,
    Disconnected,
    RejectedOrUnreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    ResolveAddr,
    ResolveRoute,
    AllocPdCq,
    AllocQp,
    InitRam,
    RegCtrl,
    Connect,
    Established,
    Error,
}

impl SourceState {
    pub fn new() -> Self {
        SourceState::ResolveAddr
    }

    /// Advances on a CM event; `ram_and_ctrl_ready` gates the
    /// `AllocQp -> InitRam -> RegCtrl` steps that happen locally between
    /// `RouteResolved` and posting the `CONNECT` request, not on a CM
    /// callback.
    pub fn on_event(self, event: CmEvent) -> Self {
        use CmEvent::*;
        use SourceState::*;
        match (self, event) {
            (ResolveAddr, AddrResolved) => ResolveRoute,
            (ResolveRoute, RouteResolved) => AllocPdCq,
            (Connect, Established) => Established,
            (_, RejectedOrUnreachable) => Error,
            (_, Disconnected) if self == Established => Error,
            (other, _) => other,
        }
    }

    /// Local (non-CM-event) progression through the setup steps once the
    /// route is resolved: PD/CQ, QP, RAM block table, control buffers, then
    /// the actual `rdma_connect` call.
    pub fn advance_local(self) -> Self {
        use SourceState::*;
        match self {
            AllocPdCq => AllocQp,
            AllocQp => InitRam,
            InitRam => RegCtrl,
            RegCtrl => Connect,
            other => other,
        }
    }

    pub fn is_terminal_error(self) -> bool {
        self == SourceState::Error
    }

    pub fn is_established(self) -> bool {
        self == SourceState::Established
    }
}

impl Default for SourceState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestState {
    Bind,
    Listen,
    WaitReq,
    Alloc,
    Accept,
    Established,
    Error,
}

impl DestState {
    pub fn new() -> Self {
        DestState::Bind
    }

    pub fn on_event(self, event: CmEvent) -> Self {
        use CmEvent::*;
        use DestState::*;
        match (self, event) {
            (WaitReq, ConnectRequest) => Alloc,
            (Accept, Established) => Established,
            (_, RejectedOrUnreachable) => Error,
            (_, Disconnected) if self == Established => Error,
            (other, _) => other,
        }
    }

    /// `BIND -> LISTEN -> WAIT_REQ` and, after a connect request arrives,
    /// `ALLOC -> ACCEPT` are local transitions driven by this crate's own
    /// setup calls rather than CM events.
    pub fn advance_local(self) -> Self {
        use DestState::*;
        match self {
            Bind => Listen,
            Listen => WaitReq,
            Alloc => Accept,
            other => other,
        }
    }

    pub fn is_terminal_error(self) -> bool {
        self == DestState::Error
    }

    pub fn is_established(self) -> bool {
        self == DestState::Established
    }
}

impl Default for DestState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a connect state machine to completion by alternating local setup
/// steps with waiting on the next CM event, bailing out as soon as the
/// machine reaches an established or error state.
pub fn drive_source(mut state: SourceState, mut next_event: impl FnMut(SourceState) -> Result<CmEvent, Error>) -> Result<SourceState, Error> {
    loop {
        if state.is_established() || state.is_terminal_error() {
            return Ok(state);
        }
        let advanced = state.advance_local();
        if advanced != state {
            state = advanced;
            continue;
        }
        let event = next_event(state)?;
        state = state.on_event(event);
    }
}

pub fn drive_dest(mut state: DestState, mut next_event: impl FnMut(DestState) -> Result<CmEvent, Error>) -> Result<DestState, Error> {
    loop {
        if state.is_established() || state.is_terminal_error() {
            return Ok(state);
        }
        let advanced = state.advance_local();
        if advanced != state {
            state = advanced;
            continue;
        }
        let event = next_event(state)?;
        state = state.on_event(event);
    }
}
