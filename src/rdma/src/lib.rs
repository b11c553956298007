//! One-sided RDMA WRITE transport for VM RAM pages, with an out-of-band
//! SEND/RECV control channel for registration negotiation and a keepalive
//! liveness subprotocol.

pub mod chunk;
pub mod connect;
pub mod control;
pub mod error;
pub mod keepalive;
pub mod ramblock;
pub mod registration;
pub mod sys;
pub mod verbs;

use wire::{CapFlags, Caps, ControlType, RdmaCompressWire, RdmaRegisterResultWire, RdmaRegisterWire, RemoteBlockWire};

use crate::chunk::{CurrentChunk, Run, CHUNK_SIZE};
use crate::control::ControlChannel;
use crate::error::Error;
use crate::keepalive::{Keepalive, KeepaliveState};
use crate::ramblock::RamBlock;
use crate::registration::{needs_registration, RegistrationMode, UnregisterQueue};
use crate::verbs::{MrHandle, VerbsContext, Wrid};

pub const RESOLVE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

/// Local capability preferences, ANDed against whatever the peer advertises
/// during connect.
#[derive(Debug, Clone, Copy)]
pub struct LocalCaps {
    pub pin_all: bool,
    pub keepalive: bool,
}

impl LocalCaps {
    fn as_flags(&self) -> CapFlags {
        let mut f = CapFlags::empty();
        if self.pin_all {
            f |= CapFlags::PIN_ALL;
        }
        if self.keepalive {
            f |= CapFlags::KEEPALIVE;
        }
        f
    }
}

/// Negotiates the intersection of local and peer capabilities; the
/// destination masks first, the source adopts what comes back.
pub fn negotiate_caps(local: LocalCaps, peer_version: u32, is_destination: bool, mut peer: Caps) -> Caps {
    if is_destination {
        peer.intersect_flags(local.as_flags());
        peer
    } else {
        Caps::new(peer_version, peer.flags() & local.as_flags(), peer.keepalive_rkey.get(), peer.keepalive_addr.get())
    }
}

/// Drives the write path, registration, and keepalive state for one
/// connection. Generic over the verbs backend so the whole transport is
/// testable against a fake (see `control::tests::FakeVerbs` for the shape).
pub struct RdmaTransport<'mem, V: VerbsContext> {
    role: Role,
    mode: RegistrationMode,
    control: ControlChannel<V>,
    blocks: Vec<RamBlock<'mem>>,
    cursor: CurrentChunk,
    unregister_queue: UnregisterQueue,
    keepalive: Keepalive,
    nb_sent: u64,
    cooperative: bool,
    error_state: Option<String>,
}

impl<'mem, V: VerbsContext> RdmaTransport<'mem, V> {
    pub fn new(
        role: Role,
        mode: RegistrationMode,
        control: ControlChannel<V>,
        blocks: Vec<RamBlock<'mem>>,
        max_in_flight: usize,
        cooperative: bool,
    ) -> Self {
        Self {
            role,
            mode,
            control,
            blocks,
            cursor: CurrentChunk::new(),
            unregister_queue: UnregisterQueue::new(max_in_flight),
            keepalive: Keepalive::new(),
            nb_sent: 0,
            cooperative,
            error_state: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn keepalive_state(&self) -> KeepaliveState {
        self.keepalive.state()
    }

    fn check_error_state(&self) -> Result<(), Error> {
        if let Some(msg) = &self.error_state {
            return Err(Error::Protocol(format!("transport is in a sticky error state: {msg}")));
        }
        Ok(())
    }

    fn enter_error_state(&mut self, e: &Error) {
        if self.error_state.is_none() {
            tracing::error!(error = %e, "rdma transport entering sticky error state");
            self.error_state = Some(e.to_string());
        }
    }

    /// One keepalive timer tick; forces the QP into `ERR` and sets the
    /// sticky error state on `NETUNREACH`.
    pub fn tick_keepalive(&mut self, observed_local_cell: u64) -> Result<(), Error> {
        self.keepalive.tick(observed_local_cell);
        if self.keepalive.state() == KeepaliveState::Unreachable && self.error_state.is_none() {
            self.control.verbs_mut().modify_qp_to_err()?;
            let e = Error::Liveness("peer unreachable: keepalive exceeded (NETUNREACH)".into());
            self.enter_error_state(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Registers (once) the whole-block local MR used both as the `lkey` for
    /// this side's own WRITE reads and, in `PIN_ALL` mode, as the `rkey`
    /// advertised to the peer.
    fn ensure_whole_block_registered(&mut self, block_idx: u32) -> Result<MrHandle, Error> {
        if let Some(mr) = self.blocks[block_idx as usize].local_whole_mr {
            return Ok(mr);
        }
        let (addr, length) = {
            let block = &self.blocks[block_idx as usize];
            (block.host_addr()? as u64, block.length)
        };
        let mr = self.control.verbs_mut().reg_mr(addr, length, true)?;
        self.blocks[block_idx as usize].local_whole_mr = Some(mr);
        Ok(mr)
    }

    /// Registers (once) the single chunk's local MR, used for the `lkey` of
    /// a `DYNAMIC`-mode WRITE read.
    fn ensure_chunk_registered_locally(&mut self, block_idx: u32, chunk_idx: u32) -> Result<MrHandle, Error> {
        if let Some(mr) = self.blocks[block_idx as usize].local_chunk_mr[chunk_idx as usize] {
            return Ok(mr);
        }
        let (addr, chunk_len) = {
            let block = &self.blocks[block_idx as usize];
            let chunk_start = chunk_idx as u64 * CHUNK_SIZE;
            let chunk_len = CHUNK_SIZE.min(block.length - chunk_start);
            (block.host_addr()? as u64 + chunk_start, chunk_len)
        };
        let mr = self.control.verbs_mut().reg_mr(addr, chunk_len, false)?;
        self.blocks[block_idx as usize].local_chunk_mr[chunk_idx as usize] = Some(mr);
        Ok(mr)
    }

    /// `PIN_ALL` setup exchange, run once after connect and before any
    /// `save_page`/`post_write` calls: each side registers its own blocks and
    /// the source learns the destination's whole-block rkeys/addresses via
    /// `RAM_BLOCKS_REQUEST`/`RAM_BLOCKS_RESULT`. A no-op in `DYNAMIC` mode,
    /// which registers lazily per chunk instead.
    pub fn negotiate_ram_blocks(&mut self) -> Result<(), Error> {
        self.check_error_state()?;
        if self.mode != RegistrationMode::PinAll {
            return Ok(());
        }

        for i in 0..self.blocks.len() {
            self.ensure_whole_block_registered(i as u32)?;
        }

        match self.role {
            Role::Destination => {
                self.control.exchange_recv(ControlType::RamBlocksRequest, self.cooperative)?;
                let mut resp = Vec::with_capacity(self.blocks.len() * std::mem::size_of::<RemoteBlockWire>());
                for block in &self.blocks {
                    let mr = block
                        .local_whole_mr
                        .ok_or_else(|| Error::Bug("block missing local whole-block MR".into()))?;
                    let entry = RemoteBlockWire {
                        remote_host_addr: wire::Be64::new(block.host_addr()? as u64),
                        offset: wire::Be64::new(block.guest_offset),
                        length: wire::Be64::new(block.length),
                        remote_rkey: wire::Be32::new(mr.rkey),
                        pad: wire::Be32::new(0),
                    };
                    resp.extend_from_slice(zerocopy::AsBytes::as_bytes(&entry));
                }
                self.control.respond(ControlType::RamBlocksResult, &resp, self.cooperative)?;
            }
            Role::Source => {
                let (_hdr, body) = self
                    .control
                    .exchange_send(ControlType::RamBlocksRequest, &[], true, self.cooperative)?
                    .ok_or_else(|| Error::Protocol("RAM_BLOCKS_REQUEST expected a response".into()))?;
                let entry_size = std::mem::size_of::<RemoteBlockWire>();
                if body.len() % entry_size != 0 {
                    return Err(Error::Protocol("malformed RAM_BLOCKS_RESULT body".into()));
                }
                for (i, entry_bytes) in body.chunks_exact(entry_size).enumerate() {
                    let entry = <RemoteBlockWire as zerocopy::FromBytes>::read_from(entry_bytes)
                        .ok_or_else(|| Error::Protocol("malformed RAM_BLOCKS_RESULT entry".into()))?;
                    let block = self
                        .blocks
                        .get_mut(i)
                        .ok_or_else(|| Error::Bug(format!("RAM_BLOCKS_RESULT entry {i} has no matching local block")))?;
                    block.whole_block_rkey = Some(entry.remote_rkey.get());
                    block.remote_whole_block_addr = Some(entry.remote_host_addr.get());
                }
            }
        }
        Ok(())
    }

    /// Copies `length` bytes at `block_offset` in `block` to the peer. Merges
    /// with the in-flight run when possible; otherwise flushes the previous
    /// run first.
    pub fn save_page(&mut self, block: u32, block_offset: u64, length: u64) -> Result<(), Error> {
        self.check_error_state()?;

        if self.is_zero_run(block, block_offset, length)? {
            self.flush_cursor()?;
            return self.send_compress(block, block_offset, length);
        }

        if let Some(flushed) = self.cursor.accept(block, block_offset, length) {
            self.post_write(flushed)?;
        }
        Ok(())
    }

    fn is_zero_run(&self, block: u32, offset: u64, length: u64) -> Result<bool, Error> {
        self.blocks
            .get(block as usize)
            .ok_or_else(|| Error::Bug(format!("unknown ram block {block}")))?
            .is_zero_run(offset, length)
    }

    /// Forces the current run out as a WRITE; called at epoch/iteration
    /// boundaries.
    pub fn flush_cursor(&mut self) -> Result<(), Error> {
        if let Some(run) = self.cursor.flush() {
            self.post_write(run)?;
        }
        Ok(())
    }

    fn post_write(&mut self, run: Run) -> Result<(), Error> {
        match self.mode {
            RegistrationMode::Dynamic => {
                self.ensure_registered(run.block, run.chunk)?;
                self.ensure_chunk_registered_locally(run.block, run.chunk)?;
            }
            RegistrationMode::PinAll => {
                self.ensure_whole_block_registered(run.block)?;
            }
        }

        let block = self
            .blocks
            .get_mut(run.block as usize)
            .ok_or_else(|| Error::Bug(format!("unknown ram block {}", run.block)))?;

        let (remote_addr, rkey) = match self.mode {
            RegistrationMode::PinAll => {
                let rkey = block.whole_block_rkey.ok_or_else(|| Error::Bug("PIN_ALL block missing whole-block rkey".into()))?;
                let base = block
                    .remote_whole_block_addr
                    .ok_or_else(|| Error::Bug("PIN_ALL block missing remote whole-block address".into()))?;
                (base + run.addr, rkey)
            }
            RegistrationMode::Dynamic => {
                let remote = block.remote[run.chunk as usize];
                (remote.remote_host_addr + run.addr, remote.rkey)
            }
        };

        let lkey = match self.mode {
            RegistrationMode::PinAll => block
                .local_whole_mr
                .ok_or_else(|| Error::Bug("PIN_ALL block missing local whole-block MR".into()))?
                .lkey,
            RegistrationMode::Dynamic => block.local_chunk_mr[run.chunk as usize]
                .ok_or_else(|| Error::Bug("DYNAMIC chunk missing local MR".into()))?
                .lkey,
        };

        let wrid = wire::wrid::encode(wire::wrid::WridType::WriteRemote as u16, run.block as u16, run.chunk);
        block.transit.set(run.chunk as usize);
        self.nb_sent += 1;

        let local_addr = block.host_addr()? as u64 + run.addr;

        match self.control.verbs_mut().post_write(wrid, local_addr, lkey, remote_addr, rkey, run.length as u32) {
            Ok(()) => Ok(()),
            Err(e @ Error::Transient(_)) => {
                self.control.verbs_mut().block_for_completion(self.cooperative)?;
                self.control.verbs_mut().post_write(wrid, local_addr, lkey, remote_addr, rkey, run.length as u32)?;
                let _ = e;
                Ok(())
            }
            Err(e) => {
                self.enter_error_state(&e);
                Err(e)
            }
        }
    }

    fn ensure_registered(&mut self, block_idx: u32, chunk_idx: u32) -> Result<(), Error> {
        let needs = {
            let block = self.blocks.get(block_idx as usize).ok_or_else(|| Error::Bug("unknown block".into()))?;
            needs_registration(&block.remote[chunk_idx as usize])
        };
        if !needs {
            return Ok(());
        }

        let req = RdmaRegisterWire {
            key: wire::Be64::new(chunk_idx as u64),
            block_idx: wire::Be32::new(block_idx),
            pad: wire::Be32::new(0),
            chunks: wire::Be64::new(1),
        };
        let (_hdr, body) = self
            .control
            .exchange_send(ControlType::RegisterRequest, zerocopy::AsBytes::as_bytes(&req), true, self.cooperative)?
            .ok_or_else(|| Error::Protocol("REGISTER_REQUEST expected a response".into()))?;
        let result = <RdmaRegisterResultWire as zerocopy::FromBytes>::read_from(body.as_slice())
            .ok_or_else(|| Error::Protocol("malformed REGISTER_RESULT body".into()))?;

        let block = self.blocks.get_mut(block_idx as usize).unwrap();
        block.remote[chunk_idx as usize].rkey = result.rkey.get();
        block.remote[chunk_idx as usize].remote_host_addr = result.host_addr.get();
        Ok(())
    }

    fn send_compress(&mut self, block: u32, offset: u64, length: u64) -> Result<(), Error> {
        let msg = RdmaCompressWire {
            value: wire::Be32::new(0),
            block_idx: wire::Be32::new(block),
            offset: wire::Be64::new(offset),
            length: wire::Be64::new(length),
        };
        self.control
            .exchange_send(ControlType::Compress, zerocopy::AsBytes::as_bytes(&msg), false, self.cooperative)?;
        Ok(())
    }

    /// Completion handling. Call after `poll_cq`-worthy events are
    /// signaled; clears `transit`, optionally enqueues a speculative
    /// unregister, and decrements `nb_sent`.
    pub fn handle_write_completion(&mut self, wrid: Wrid) -> Result<(), Error> {
        let (_ty, block_idx, chunk_idx) = wire::wrid::decode(wrid);
        let block = self
            .blocks
            .get_mut(block_idx as usize)
            .ok_or_else(|| Error::Bug(format!("completion for unknown block {block_idx}")))?;
        block.transit.clear(chunk_idx as usize);
        self.nb_sent = self.nb_sent.saturating_sub(1);
        if self.mode == RegistrationMode::Dynamic {
            block.unregister_pending.set(chunk_idx as usize);
            self.unregister_queue.push(block_idx, chunk_idx);
        }
        Ok(())
    }

    /// Drains the speculative unregister ring. Must run before the
    /// next batch of writes, not concurrently with them.
    pub fn drain_unregister_queue(&mut self) -> Result<(), Error> {
        let blocks = &self.blocks;
        let ready = self.unregister_queue.drain_ready(|block_idx, chunk_idx| {
            blocks
                .get(block_idx as usize)
                .map(|b| b.transit.is_set(chunk_idx as usize))
                .unwrap_or(false)
        });
        for (block_idx, chunk_idx) in ready {
            let local_mr = self.blocks.get_mut(block_idx as usize).and_then(|block| {
                block.remote[chunk_idx as usize].rkey = 0;
                block.unregister_pending.clear(chunk_idx as usize);
                block.local_chunk_mr[chunk_idx as usize].take()
            });
            if let Some(mr) = local_mr {
                self.control.verbs_mut().dereg_mr(mr)?;
            }
            self.control
                .exchange_send(ControlType::UnregisterRequest, &[], true, self.cooperative)?;
        }
        Ok(())
    }

    /// Drain semantics before a phase boundary: wait for all posted WRITEs
    /// to complete.
    pub fn drain_in_flight(&mut self) -> Result<(), Error> {
        while self.nb_sent > 0 {
            let completions = self.control.verbs_mut().poll_cq(16)?;
            if completions.is_empty() {
                self.control.verbs_mut().block_for_completion(self.cooperative)?;
                continue;
            }
            for c in completions {
                if c.is_write {
                    self.handle_write_completion(c.wrid)?;
                }
            }
        }
        Ok(())
    }

    /// Idempotent, best-effort teardown: posts a final ERROR control
    /// message unless the failure was itself `NETUNREACH`, then drops every
    /// owned object.
    pub fn cleanup(&mut self) {
        let skip_error_send = matches!(&self.error_state, Some(msg) if msg.contains("NETUNREACH"));
        if !skip_error_send {
            let _ = self.control.exchange_send(ControlType::Error, &[], false, self.cooperative);
        }
        for block in &mut self.blocks {
            if let Some(mr) = block.local_whole_mr.take() {
                let _ = self.control.verbs_mut().dereg_mr(mr);
            }
            for slot in &mut block.local_chunk_mr {
                if let Some(mr) = slot.take() {
                    let _ = self.control.verbs_mut().dereg_mr(mr);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verbs::{Completion, CompletionStatus, MrHandle};
    use std::collections::VecDeque;

    struct FakeVerbs {
        pending: VecDeque<Completion>,
    }

    impl FakeVerbs {
        fn new() -> Self {
            Self { pending: VecDeque::new() }
        }
    }

    impl VerbsContext for FakeVerbs {
        fn post_write(&mut self, wrid: Wrid, _: u64, _: u32, _: u64, _: u32, _: u32) -> Result<(), Error> {
            self.pending.push_back(Completion { wrid, status: CompletionStatus::Success, is_write: true });
            Ok(())
        }
        fn post_send(&mut self, wrid: Wrid, _: u64, _: u32, _: u32) -> Result<(), Error> {
            self.pending.push_back(Completion { wrid, status: CompletionStatus::Success, is_write: false });
            Ok(())
        }
        fn post_recv(&mut self, wrid: Wrid, _: u64, _: u32, _: u32) -> Result<(), Error> {
            self.pending.push_back(Completion { wrid, status: CompletionStatus::Success, is_write: false });
            Ok(())
        }
        fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>, Error> {
            let n = self.pending.len().min(max);
            Ok(self.pending.drain(..n).collect())
        }
        fn block_for_completion(&mut self, _cooperative: bool) -> Result<(), Error> {
            Ok(())
        }
        fn reg_mr(&mut self, _: u64, _: u64, _: bool) -> Result<MrHandle, Error> {
            Ok(MrHandle::new(1, 1, 1))
        }
        fn dereg_mr(&mut self, _: MrHandle) -> Result<(), Error> {
            Ok(())
        }
        fn modify_qp_to_err(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn completion_fd(&self) -> std::os::unix::io::RawFd {
            -1
        }
    }

    #[test]
    fn negotiate_caps_intersects_on_destination() {
        let local = LocalCaps { pin_all: true, keepalive: false };
        let peer = Caps::new(1, CapFlags::PIN_ALL | CapFlags::KEEPALIVE, 0, 0);
        let negotiated = negotiate_caps(local, 1, true, peer);
        assert_eq!(negotiated.flags(), CapFlags::PIN_ALL);
    }

    fn fake_block<'a>(backing: &'a mut [u8], index: u32) -> RamBlock<'a> {
        let len = backing.len() as u64;
        let slice = unsafe { vm_memory::VolatileSlice::new(backing.as_mut_ptr(), backing.len()) };
        RamBlock::new(index, 0, len, slice)
    }

    #[test]
    fn write_completion_clears_transit_and_enqueues_unregister() {
        let verbs = FakeVerbs::new();
        let control = ControlChannel::new(verbs, 0, 0, 0, 0);
        let mut backing = vec![0u8; crate::chunk::CHUNK_SIZE as usize];
        let mut block = fake_block(&mut backing, 0);
        block.transit.set(0);
        let mut transport = RdmaTransport {
            role: Role::Source,
            mode: RegistrationMode::Dynamic,
            control,
            blocks: vec![block],
            cursor: CurrentChunk::new(),
            unregister_queue: UnregisterQueue::new(8),
            keepalive: Keepalive::new(),
            nb_sent: 1,
            cooperative: false,
            error_state: None,
        };

        let wrid = wire::wrid::encode(wire::wrid::WridType::WriteRemote as u16, 0, 0);
        transport.handle_write_completion(wrid).unwrap();

        assert!(!transport.blocks[0].transit.is_set(0));
        assert_eq!(transport.nb_sent, 0);
        assert!(transport.blocks[0].unregister_pending.is_set(0));

        transport.blocks[0].transit.clear(0);
        transport.drain_unregister_queue().unwrap();
        assert!(!transport.blocks[0].unregister_pending.is_set(0));
        assert_eq!(transport.blocks[0].remote[0].rkey, 0);
    }

    #[test]
    fn negotiate_ram_blocks_source_populates_remote_whole_block_info() {
        let verbs = FakeVerbs::new();
        let mut control = ControlChannel::new(verbs, 0, 0, 0, 0);
        let entry = RemoteBlockWire {
            remote_host_addr: wire::Be64::new(0x2000),
            offset: wire::Be64::new(0),
            length: wire::Be64::new(4096),
            remote_rkey: wire::Be32::new(99),
            pad: wire::Be32::new(0),
        };
        let hdr = wire::Hdr::new(std::mem::size_of::<RemoteBlockWire>() as u32, ControlType::RamBlocksResult, 0);
        let hdr_bytes = zerocopy::AsBytes::as_bytes(&hdr);
        let entry_bytes = zerocopy::AsBytes::as_bytes(&entry);
        control.recv_buf_mut()[..hdr_bytes.len()].copy_from_slice(hdr_bytes);
        control.recv_buf_mut()[hdr_bytes.len()..hdr_bytes.len() + entry_bytes.len()].copy_from_slice(entry_bytes);

        let mut backing = vec![0u8; crate::chunk::CHUNK_SIZE as usize];
        let block = fake_block(&mut backing, 0);
        let mut transport = RdmaTransport::new(Role::Source, RegistrationMode::PinAll, control, vec![block], 16, false);
        transport.negotiate_ram_blocks().unwrap();

        assert_eq!(transport.blocks[0].whole_block_rkey, Some(99));
        assert_eq!(transport.blocks[0].remote_whole_block_addr, Some(0x2000));
        assert!(transport.blocks[0].local_whole_mr.is_some());
    }

    #[test]
    fn keepalive_unreachable_forces_qp_to_err_and_sets_sticky_error() {
        let verbs = FakeVerbs::new();
        let control = ControlChannel::new(verbs, 0, 0, 0, 0);
        let mut transport = RdmaTransport {
            role: Role::Source,
            mode: RegistrationMode::Dynamic,
            control,
            blocks: vec![],
            cursor: CurrentChunk::new(),
            unregister_queue: UnregisterQueue::new(8),
            keepalive: Keepalive::new(),
            nb_sent: 0,
            cooperative: false,
            error_state: None,
        };
        for _ in 0..(keepalive::MAX_STARTUP_MISSED + 1) {
            let _ = transport.tick_keepalive(0);
        }
        assert_eq!(transport.keepalive_state(), KeepaliveState::Unreachable);
        assert!(transport.check_error_state().is_err());
    }
}
