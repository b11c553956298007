//! Packet-buffer controller: a thin state machine over a Linux `sch_plug`
//! queueing discipline, attached to a shadow `ifb` device sitting in front of
//! the VM's virtual NIC.
//!
//! The netlink plumbing is isolated behind [`QdiscBackend`] so the barrier
//! bookkeeping — the part this crate is actually responsible for getting
//! right — is unit-testable without a real kernel qdisc.

use std::collections::VecDeque;

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("packet buffer already enabled on a different interface: {0}")]
    MultiNicUnsupported(String),
    #[error("peer descriptor is missing an ifname= field")]
    MissingIfname,
    #[error("packet buffer is not enabled")]
    NotEnabled,
    #[error("qdisc backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Starter limit: one second of buffering at 1 Gbit/s.
pub const DEFAULT_LIMIT_BYTES: u64 = 1_000_000_000 / 8;

/// Netlink-facing half of the controller. A real implementation issues
/// `NLM_F_CREATE | NLM_F_EXCL` on `first == true` and `NLM_F_CREATE` alone
/// otherwise — this asymmetry is load-bearing, not a bug, and must not be
/// refactored into symmetric create/update calls.
pub trait QdiscBackend: Send {
    fn deliver(&mut self, ifb_name: &str, limit_bytes: u64, first: bool) -> Result<(), Error>;
    fn release_one(&mut self, ifb_name: &str) -> Result<(), Error>;
    fn release_indefinite(&mut self, ifb_name: &str) -> Result<(), Error>;
    fn detach(&mut self, ifb_name: &str) -> Result<(), Error>;
}

/// Derives the shadow buffering interface name from a NIC peer descriptor
/// containing an `ifname=<name>` field.
pub fn ifb_name_from_peer_descriptor(descriptor: &str) -> Result<String, Error> {
    let ifname = descriptor
        .split(',')
        .find_map(|field| field.strip_prefix("ifname="))
        .ok_or(Error::MissingIfname)?;
    Ok(format!("ifb{ifname}"))
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Disabled,
    Enabled,
    Bypass,
}

/// Drives exactly one virtual NIC's buffer; multi-NIC is a hard error
/// rather than the warn-and-continue behavior an earlier version allowed.
pub struct PacketBuffer<B: QdiscBackend> {
    backend: B,
    state: State,
    ifb_name: Option<String>,
    limit_bytes: u64,
    ever_delivered: bool,
    pending_barriers: VecDeque<()>,
}

impl<B: QdiscBackend> PacketBuffer<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: State::Disabled,
            ifb_name: None,
            limit_bytes: DEFAULT_LIMIT_BYTES,
            ever_delivered: false,
            pending_barriers: VecDeque::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, State::Enabled)
    }

    pub fn pending_barriers(&self) -> usize {
        self.pending_barriers.len()
    }

    pub fn enable(&mut self, peer_descriptor: &str) -> Result<(), Error> {
        let ifb_name = ifb_name_from_peer_descriptor(peer_descriptor)?;
        if let Some(existing) = &self.ifb_name {
            if existing != &ifb_name {
                return Err(Error::MultiNicUnsupported(ifb_name));
            }
        }
        self.ifb_name = Some(ifb_name);
        self.state = State::Enabled;
        info!(ifb = %self.ifb_name.as_ref().unwrap(), "packet buffer enabled");
        Ok(())
    }

    pub fn set_limit(&mut self, bytes: u64) {
        self.limit_bytes = bytes;
    }

    /// Insert a new barrier; subsequent packets accumulate behind it until
    /// the next `release_one`.
    pub fn plug(&mut self) -> Result<(), Error> {
        let ifb_name = self.require_enabled()?.to_owned();
        match self.backend.deliver(&ifb_name, self.limit_bytes, !self.ever_delivered) {
            Ok(()) => {
                self.ever_delivered = true;
                self.pending_barriers.push_back(());
                Ok(())
            }
            Err(e) => {
                self.downgrade_to_bypass(&ifb_name);
                Err(e)
            }
        }
    }

    /// Release exactly one trailing barrier's buffered packets.
    pub fn release_one(&mut self) -> Result<(), Error> {
        let ifb_name = self.require_enabled()?.to_owned();
        if self.pending_barriers.is_empty() {
            return Ok(());
        }
        self.backend.release_one(&ifb_name)?;
        self.pending_barriers.pop_front();
        Ok(())
    }

    /// Bypass mode: stop buffering and flush everything outstanding.
    pub fn release_indefinite(&mut self) -> Result<(), Error> {
        let ifb_name = self.require_enabled()?.to_owned();
        self.backend.release_indefinite(&ifb_name)?;
        self.pending_barriers.clear();
        self.state = State::Bypass;
        Ok(())
    }

    /// Idempotent: calling `disable` on an already-disabled buffer is a no-op.
    pub fn disable(&mut self) {
        if self.state == State::Disabled {
            return;
        }
        if let Some(ifb_name) = &self.ifb_name {
            if let Err(e) = self.backend.detach(ifb_name) {
                warn!(error = %e, "error detaching packet buffer qdisc during disable");
            }
        }
        self.pending_barriers.clear();
        self.ever_delivered = false;
        self.state = State::Disabled;
    }

    fn downgrade_to_bypass(&mut self, ifb_name: &str) {
        warn!(ifb = ifb_name, "qdisc error, downgrading packet buffer to bypass");
        let _ = self.backend.release_indefinite(ifb_name);
        self.pending_barriers.clear();
        self.state = State::Bypass;
    }

    fn require_enabled(&self) -> Result<&str, Error> {
        if self.state == State::Disabled {
            return Err(Error::NotEnabled);
        }
        self.ifb_name.as_deref().ok_or(Error::NotEnabled)
    }
}

/// Object-safe view of [`PacketBuffer`], so collaborators that don't care
/// which [`QdiscBackend`] is behind it (the checkpoint pipeline) can hold
/// one behind `Box<dyn PacketBufferLike>`.
pub trait PacketBufferLike: Send {
    fn plug(&mut self) -> Result<(), Error>;
    fn release_one(&mut self) -> Result<(), Error>;
    fn release_indefinite(&mut self) -> Result<(), Error>;
    fn disable(&mut self);
}

impl<B: QdiscBackend> PacketBufferLike for PacketBuffer<B> {
    fn plug(&mut self) -> Result<(), Error> {
        PacketBuffer::plug(self)
    }
    fn release_one(&mut self) -> Result<(), Error> {
        PacketBuffer::release_one(self)
    }
    fn release_indefinite(&mut self) -> Result<(), Error> {
        PacketBuffer::release_indefinite(self)
    }
    fn disable(&mut self) {
        PacketBuffer::disable(self)
    }
}

/// Real Linux backend: manipulates `sch_plug` on the shadow `ifb` device over
/// netlink. Owns a dedicated current-thread runtime since the pipeline's
/// migration thread talks to this synchronously.
pub mod linux {
    use super::*;
    use futures::TryStreamExt;
    use rtnetlink::Handle;

    pub struct RtNetlinkBackend {
        runtime: tokio::runtime::Runtime,
        handle: Handle,
    }

    impl RtNetlinkBackend {
        pub fn new() -> Result<Self, Error> {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
                .map_err(|e| Error::Backend(Box::new(e)))?;
            let (connection, handle, _messages) =
                rtnetlink::new_connection().map_err(|e| Error::Backend(Box::new(e)))?;
            runtime.spawn(connection);
            Ok(Self { runtime, handle })
        }
    }

    impl QdiscBackend for RtNetlinkBackend {
        fn deliver(&mut self, ifb_name: &str, limit_bytes: u64, first: bool) -> Result<(), Error> {
            let handle = self.handle.clone();
            let ifb_name = ifb_name.to_owned();
            self.runtime.block_on(async move {
                let mut links = handle.link().get().match_name(ifb_name.clone()).execute();
                let link = links
                    .try_next()
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))?
                    .ok_or_else(|| Error::Backend(format!("no such interface: {ifb_name}").into()))?;
                let mut req = handle.qdisc().add(link.header.index as i32).plug();
                req = req.limit(limit_bytes as u32);
                if first {
                    req = req.replace(false);
                } else {
                    req = req.replace(true);
                }
                req.execute().await.map_err(|e| Error::Backend(Box::new(e)))
            })
        }

        fn release_one(&mut self, ifb_name: &str) -> Result<(), Error> {
            self.signal(ifb_name, PlugSignal::ReleaseOne)
        }

        fn release_indefinite(&mut self, ifb_name: &str) -> Result<(), Error> {
            self.signal(ifb_name, PlugSignal::ReleaseIndefinite)
        }

        fn detach(&mut self, ifb_name: &str) -> Result<(), Error> {
            let handle = self.handle.clone();
            let ifb_name = ifb_name.to_owned();
            self.runtime.block_on(async move {
                let mut links = handle.link().get().match_name(ifb_name.clone()).execute();
                let link = links
                    .try_next()
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))?
                    .ok_or_else(|| Error::Backend(format!("no such interface: {ifb_name}").into()))?;
                handle
                    .qdisc()
                    .del(link.header.index as i32)
                    .execute()
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))
            })
        }
    }

    enum PlugSignal {
        ReleaseOne,
        ReleaseIndefinite,
    }

    impl RtNetlinkBackend {
        fn signal(&mut self, ifb_name: &str, signal: PlugSignal) -> Result<(), Error> {
            let handle = self.handle.clone();
            let ifb_name = ifb_name.to_owned();
            self.runtime.block_on(async move {
                let mut links = handle.link().get().match_name(ifb_name.clone()).execute();
                let link = links
                    .try_next()
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))?
                    .ok_or_else(|| Error::Backend(format!("no such interface: {ifb_name}").into()))?;
                let mut req = handle.qdisc().add(link.header.index as i32).plug().replace(true);
                req = match signal {
                    PlugSignal::ReleaseOne => req.release_one(),
                    PlugSignal::ReleaseIndefinite => req.release_indefinite(),
                };
                req.execute().await.map_err(|e| Error::Backend(Box::new(e)))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct FakeBackend {
        log: Rc<RefCell<Vec<String>>>,
        fail_next: Rc<RefCell<bool>>,
    }

    impl QdiscBackend for FakeBackend {
        fn deliver(&mut self, ifb_name: &str, _limit: u64, first: bool) -> Result<(), Error> {
            if *self.fail_next.borrow() {
                return Err(Error::Backend("injected failure".into()));
            }
            self.log
                .borrow_mut()
                .push(format!("deliver({ifb_name}, first={first})"));
            Ok(())
        }
        fn release_one(&mut self, ifb_name: &str) -> Result<(), Error> {
            self.log.borrow_mut().push(format!("release_one({ifb_name})"));
            Ok(())
        }
        fn release_indefinite(&mut self, ifb_name: &str) -> Result<(), Error> {
            self.log
                .borrow_mut()
                .push(format!("release_indefinite({ifb_name})"));
            Ok(())
        }
        fn detach(&mut self, ifb_name: &str) -> Result<(), Error> {
            self.log.borrow_mut().push(format!("detach({ifb_name})"));
            Ok(())
        }
    }

    #[test]
    fn ifb_name_parses_first_field_match() {
        assert_eq!(ifb_name_from_peer_descriptor("ifname=eth0,vlan=5").unwrap(), "ifbeth0");
        assert!(ifb_name_from_peer_descriptor("vlan=5").is_err());
    }

    #[test]
    fn first_plug_uses_first_true_subsequent_do_not() {
        let backend = FakeBackend::default();
        let mut pb = PacketBuffer::new(backend.clone());
        pb.enable("ifname=eth0").unwrap();
        pb.plug().unwrap();
        pb.plug().unwrap();
        let log = backend.log.borrow();
        assert_eq!(log[0], "deliver(ifbeth0, first=true)");
        assert_eq!(log[1], "deliver(ifbeth0, first=false)");
    }

    #[test]
    fn second_interface_is_rejected() {
        let backend = FakeBackend::default();
        let mut pb = PacketBuffer::new(backend);
        pb.enable("ifname=eth0").unwrap();
        assert!(matches!(pb.enable("ifname=eth1"), Err(Error::MultiNicUnsupported(_))));
    }

    #[test]
    fn release_one_consumes_exactly_one_barrier() {
        let backend = FakeBackend::default();
        let mut pb = PacketBuffer::new(backend);
        pb.enable("ifname=eth0").unwrap();
        pb.plug().unwrap();
        pb.plug().unwrap();
        assert_eq!(pb.pending_barriers(), 2);
        pb.release_one().unwrap();
        assert_eq!(pb.pending_barriers(), 1);
    }

    #[test]
    fn disable_is_idempotent() {
        let backend = FakeBackend::default();
        let mut pb = PacketBuffer::new(backend.clone());
        pb.enable("ifname=eth0").unwrap();
        pb.disable();
        pb.disable();
        assert_eq!(backend.log.borrow().iter().filter(|l| l.starts_with("detach")).count(), 1);
    }

    #[test]
    fn backend_failure_downgrades_to_bypass_and_clears_barriers() {
        let backend = FakeBackend::default();
        let mut pb = PacketBuffer::new(backend.clone());
        pb.enable("ifname=eth0").unwrap();
        pb.plug().unwrap();
        *backend.fail_next.borrow_mut() = true;
        assert!(pb.plug().is_err());
        assert_eq!(pb.pending_barriers(), 0);
        assert!(!pb.is_enabled());
    }
}
