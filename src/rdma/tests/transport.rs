use std::collections::VecDeque;

use rdma::control::ControlChannel;
use rdma::error::Error;
use rdma::ramblock::RamBlock;
use rdma::registration::RegistrationMode;
use rdma::verbs::{Completion, CompletionStatus, MrHandle, VerbsContext, Wrid};
use rdma::{LocalCaps, RdmaTransport, Role};

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

fn block_with_memory<'a>(backing: &'a mut [u8]) -> RamBlock<'a> {
    let len = backing.len() as u64;
    let slice = unsafe { vm_memory::VolatileSlice::new(backing.as_mut_ptr(), backing.len()) };
    let mut block = RamBlock::new(0, 0, len, slice);
    block.whole_block_rkey = Some(42);
    block.remote_whole_block_addr = Some(0);
    block
}

#[test]
fn save_page_merges_then_flush_drains_all_writes_pin_all() {
    let verbs = FakeVerbs::new();
    let control = ControlChannel::new(verbs, 0, 0, 0, 0);
    let mut backing = vec![7u8; 4096];
    let block = block_with_memory(&mut backing);
    let mut transport = RdmaTransport::new(Role::Source, RegistrationMode::PinAll, control, vec![block], 16, false);

    transport.save_page(0, 0, 2048).unwrap();
    transport.save_page(0, 2048, 2048).unwrap(); // merges with the first run
    transport.flush_cursor().unwrap();
    transport.drain_in_flight().unwrap();
}

#[test]
fn zero_page_takes_the_compress_path_without_posting_a_write() {
    let verbs = FakeVerbs::new();
    let control = ControlChannel::new(verbs, 0, 0, 0, 0);
    let mut backing = vec![0u8; 4096];
    let block = block_with_memory(&mut backing);
    let mut transport = RdmaTransport::new(Role::Source, RegistrationMode::PinAll, control, vec![block], 16, false);

    transport.save_page(0, 0, 4096).unwrap();
    transport.drain_in_flight().unwrap();
}

#[test]
fn keepalive_tick_is_reachable_through_the_public_surface() {
    let verbs = FakeVerbs::new();
    let control = ControlChannel::new(verbs, 0, 0, 0, 0);
    let mut transport = RdmaTransport::new(Role::Destination, RegistrationMode::Dynamic, control, vec![], 16, true);

    transport.tick_keepalive(1).unwrap();
    assert_eq!(transport.keepalive_state(), rdma::keepalive::KeepaliveState::Steady);
}

#[test]
fn local_caps_mask_to_empty_when_destination_supports_nothing() {
    let local = LocalCaps { pin_all: true, keepalive: true };
    let peer = wire::Caps::new(1, wire::CapFlags::PIN_ALL | wire::CapFlags::KEEPALIVE, 0, 0);
    let negotiated = rdma::negotiate_caps(LocalCaps { pin_all: false, keepalive: false }, 1, true, peer);
    assert_eq!(negotiated.flags(), wire::CapFlags::empty());
    let _ = local; // exercised above via a second, differently-configured LocalCaps
}
