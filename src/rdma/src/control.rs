//! SEND/RECV control exchange with credit-1 flow control. Every SEND waits
//! for a peer READY before posting; the
//! receiver reposts READY eagerly whenever it posts a new RECV.

use wire::{ControlType, Hdr};

use crate::error::Error;
use crate::verbs::{CompletionStatus, VerbsContext, Wrid};

/// 512 KiB pinned region per control work-request slot.
pub const CONTROL_BUFFER_SIZE: usize = 512 * 1024;

const READY_RECV_SLOT: u16 = 0;
const RESPONSE_RECV_SLOT: u16 = 1;
const HEADER_SEND_SLOT: u16 = 0;

fn recv_wrid(slot: u16) -> Wrid {
    wire::wrid::encode(wire::wrid::RECV_CONTROL_BASE + slot, 0, 0)
}

fn send_wrid(slot: u16) -> Wrid {
    wire::wrid::encode(wire::wrid::SEND_CONTROL_BASE + slot, 0, 0)
}

pub struct ControlChannel<V: VerbsContext> {
    verbs: V,
    send_buf: Box<[u8]>,
    recv_buf: Box<[u8]>,
    send_lkey: u32,
    recv_lkey: u32,
    send_addr: u64,
    recv_addr: u64,
    /// Set once the peer's first READY has been observed; after that every
    /// `exchange_send` can skip straight to posting.
    peer_ready_seen: bool,
}

impl<V: VerbsContext> ControlChannel<V> {
    pub fn new(verbs: V, send_addr: u64, send_lkey: u32, recv_addr: u64, recv_lkey: u32) -> Self {
        Self {
            verbs,
            send_buf: vec![0u8; CONTROL_BUFFER_SIZE].into_boxed_slice(),
            recv_buf: vec![0u8; CONTROL_BUFFER_SIZE].into_boxed_slice(),
            send_lkey,
            recv_lkey,
            send_addr,
            recv_addr,
            peer_ready_seen: false,
        }
    }

    pub(crate) fn verbs_mut(&mut self) -> &mut V {
        &mut self.verbs
    }

    #[cfg(test)]
    pub(crate) fn recv_buf_mut(&mut self) -> &mut [u8] {
        &mut self.recv_buf
    }

    fn post_recv_slot(&mut self, slot: u16) -> Result<(), Error> {
        self.verbs.post_recv(recv_wrid(slot), self.recv_addr, self.recv_lkey, CONTROL_BUFFER_SIZE as u32)
    }

    fn wait_for_wrid(&mut self, expected: Wrid, cooperative: bool) -> Result<(), Error> {
        loop {
            for c in self.verbs.poll_cq(16)? {
                if c.wrid != expected {
                    continue;
                }
                return match c.status {
                    CompletionStatus::Success => Ok(()),
                    CompletionStatus::Error(code) => {
                        Err(Error::Protocol(format!("control completion failed, status {code}")))
                    }
                };
            }
            self.verbs.block_for_completion(cooperative)?;
        }
    }

    /// Performs the request half of the credit-1 exchange.
    pub fn exchange_send(
        &mut self,
        ty: ControlType,
        body: &[u8],
        expect_resp: bool,
        cooperative: bool,
    ) -> Result<Option<(Hdr, Vec<u8>)>, Error> {
        if !self.peer_ready_seen {
            self.post_recv_slot(READY_RECV_SLOT)?;
            self.wait_for_wrid(recv_wrid(READY_RECV_SLOT), cooperative)?;
            self.peer_ready_seen = true;
        }

        if expect_resp {
            self.post_recv_slot(RESPONSE_RECV_SLOT)?;
        }
        self.post_recv_slot(READY_RECV_SLOT)?;

        let hdr = Hdr::new((body.len()) as u32, ty, 0);
        let hdr_bytes = zerocopy::AsBytes::as_bytes(&hdr);
        self.send_buf[..hdr_bytes.len()].copy_from_slice(hdr_bytes);
        self.send_buf[hdr_bytes.len()..hdr_bytes.len() + body.len()].copy_from_slice(body);

        self.verbs.post_send(
            send_wrid(HEADER_SEND_SLOT),
            self.send_addr,
            self.send_lkey,
            (hdr_bytes.len() + body.len()) as u32,
        )?;
        self.wait_for_wrid(send_wrid(HEADER_SEND_SLOT), cooperative)?;

        if !expect_resp {
            return Ok(None);
        }

        self.wait_for_wrid(recv_wrid(RESPONSE_RECV_SLOT), cooperative)?;
        let hdr_len = std::mem::size_of::<Hdr>();
        let resp_hdr = <Hdr as zerocopy::FromBytes>::read_from(&self.recv_buf[..hdr_len])
            .ok_or_else(|| Error::Protocol("short control response header".into()))?;
        let len = resp_hdr.len.get() as usize;
        let resp_body = self.recv_buf[hdr_len..hdr_len + len].to_vec();
        Ok(Some((resp_hdr, resp_body)))
    }

    /// Sends a reply body after [`Self::exchange_recv`] has already set up the
    /// handshake; used by the side answering a request (e.g. the destination
    /// replying to `RAM_BLOCKS_REQUEST` with `RAM_BLOCKS_RESULT`).
    pub fn respond(&mut self, ty: ControlType, body: &[u8], cooperative: bool) -> Result<(), Error> {
        let hdr = Hdr::new(body.len() as u32, ty, 0);
        let hdr_bytes = zerocopy::AsBytes::as_bytes(&hdr);
        self.send_buf[..hdr_bytes.len()].copy_from_slice(hdr_bytes);
        self.send_buf[hdr_bytes.len()..hdr_bytes.len() + body.len()].copy_from_slice(body);
        self.verbs.post_send(
            send_wrid(HEADER_SEND_SLOT),
            self.send_addr,
            self.send_lkey,
            (hdr_bytes.len() + body.len()) as u32,
        )?;
        self.wait_for_wrid(send_wrid(HEADER_SEND_SLOT), cooperative)?;
        Ok(())
    }

    /// Receiver half: post READY eagerly, then block for the expected type.
    pub fn exchange_recv(&mut self, expect: ControlType, cooperative: bool) -> Result<(Hdr, Vec<u8>), Error> {
        self.post_recv_slot(READY_RECV_SLOT)?;
        self.verbs.post_send(send_wrid(HEADER_SEND_SLOT), self.send_addr, self.send_lkey, 0)?;
        self.wait_for_wrid(send_wrid(HEADER_SEND_SLOT), cooperative)?;

        self.post_recv_slot(RESPONSE_RECV_SLOT)?;
        self.wait_for_wrid(recv_wrid(RESPONSE_RECV_SLOT), cooperative)?;

        let hdr_len = std::mem::size_of::<Hdr>();
        let hdr = <Hdr as zerocopy::FromBytes>::read_from(&self.recv_buf[..hdr_len])
            .ok_or_else(|| Error::Protocol("short control message header".into()))?;
        match hdr.control_type() {
            Some(ty) if ty as u32 == expect as u32 => {
                let len = hdr.len.get() as usize;
                Ok((hdr, self.recv_buf[hdr_len..hdr_len + len].to_vec()))
            }
            Some(other) => Err(Error::Protocol(format!("unexpected control type {other:?}"))),
            None => Err(Error::Protocol("unrecognized control type".into())),
        }
    }
}
