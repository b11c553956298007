//! Liveness subprotocol: two pinned counters, each side writing into the
//! peer's cell by one-sided RDMA WRITE and comparing the locally-observed
//! counter against the last seen value on a timer.

use std::time::Duration;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(300);
pub const MAX_STARTUP_MISSED: u32 = 100;
pub const MAX_LOST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveState {
    Startup,
    Steady,
    Unreachable,
}

/// Pure state machine; the caller supplies the observed peer counter on
/// every tick so this is testable without real RDMA writes or a clock.
pub struct Keepalive {
    state: KeepaliveState,
    last_seen: u64,
    missed: u32,
}

impl Keepalive {
    pub fn new() -> Self {
        Self {
            state: KeepaliveState::Startup,
            last_seen: 0,
            missed: 0,
        }
    }

    pub fn state(&self) -> KeepaliveState {
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// One timer tick: compare `observed` (the current value of our own
    /// pinned cell, as last written by the peer) to the previously observed
    /// value.
    pub fn tick(&mut self, observed: u64) {
        if self.state == KeepaliveState::Unreachable {
            return;
        }
        if observed != self.last_seen {
            self.last_seen = observed;
            self.missed = 0;
            self.state = KeepaliveState::Steady;
            return;
        }
        self.missed += 1;
        let threshold = match self.state {
            KeepaliveState::Startup => MAX_STARTUP_MISSED,
            KeepaliveState::Steady | KeepaliveState::Unreachable => MAX_LOST,
        };
        if self.missed > threshold {
            self.state = KeepaliveState::Unreachable;
        }
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new()
    }
}
