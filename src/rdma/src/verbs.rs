//! Safe, object-safe view over the subset of libibverbs/librdmacm this
//! transport needs. The real implementation ([`real::LibverbsContext`]) owns
//! the PD/CQ/QP/MR handles and tears them down in reverse creation order on
//! `Drop`; everything above this module is written against the
//! [`VerbsContext`] trait so the write path, completion handling, and
//! registration logic are testable without real hardware.

use crate::error::Error;

pub type Wrid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error(i32),
}

#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wrid: Wrid,
    pub status: CompletionStatus,
    pub is_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MrHandle {
    pub rkey: u32,
    pub lkey: u32,
    id: u64,
}

impl MrHandle {
    pub fn new(rkey: u32, lkey: u32, id: u64) -> Self {
        Self { rkey, lkey, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Everything the transport needs from one queue pair + completion queue.
pub trait VerbsContext: Send {
    fn post_write(
        &mut self,
        wrid: Wrid,
        local_addr: u64,
        lkey: u32,
        remote_addr: u64,
        rkey: u32,
        length: u32,
    ) -> Result<(), Error>;

    fn post_send(&mut self, wrid: Wrid, local_addr: u64, lkey: u32, length: u32) -> Result<(), Error>;

    fn post_recv(&mut self, wrid: Wrid, local_addr: u64, lkey: u32, length: u32) -> Result<(), Error>;

    /// Non-blocking; returns whatever completions are immediately available.
    fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>, Error>;

    /// Blocks on the completion channel fd until at least one completion is
    /// ready, honoring the "busy-poll or yield to the event loop" duality
    /// honored via the `cooperative` flag.
    fn block_for_completion(&mut self, cooperative: bool) -> Result<(), Error>;

    fn reg_mr(&mut self, addr: u64, length: u64, remote_write: bool) -> Result<MrHandle, Error>;

    fn dereg_mr(&mut self, mr: MrHandle) -> Result<(), Error>;

    fn modify_qp_to_err(&mut self) -> Result<(), Error>;

    /// A pollable fd suitable for registering with an `mio::Poll`, used by
    /// the destination role's cooperative event loop.
    fn completion_fd(&self) -> std::os::unix::io::RawFd;
}

pub mod real {
    use super::*;
    use crate::sys;

    /// Owns one queue pair's PD/CQ/QP/MR handles and frees them in reverse
    /// creation order on drop, matching the idempotent best-effort cleanup
    /// discipline used elsewhere in this crate.
    pub struct LibverbsContext {
        context: *mut sys::ibv_context,
        pd: *mut sys::ibv_pd,
        comp_channel: *mut sys::ibv_comp_channel,
        cq: *mut sys::ibv_cq,
        qp: *mut sys::ibv_qp,
        next_mr_id: u64,
        mrs: std::collections::HashMap<u64, *mut sys::ibv_mr>,
    }

    // The raw pointers above are only ever touched from the single
    // migration thread that owns this context; Send is required so the
    // context can be constructed on a setup thread and handed off once.
    unsafe impl Send for LibverbsContext {}

    impl LibverbsContext {
        /// # Safety
        /// Caller must ensure `context`/`pd`/`comp_channel`/`cq`/`qp` are
        /// live, matched handles produced by a single `rdma_create_qp`
        /// sequence.
        pub unsafe fn from_raw(
            context: *mut sys::ibv_context,
            pd: *mut sys::ibv_pd,
            comp_channel: *mut sys::ibv_comp_channel,
            cq: *mut sys::ibv_cq,
            qp: *mut sys::ibv_qp,
        ) -> Self {
            Self {
                context,
                pd,
                comp_channel,
                cq,
                qp,
                next_mr_id: 1,
                mrs: std::collections::HashMap::new(),
            }
        }
    }

    impl VerbsContext for LibverbsContext {
        fn post_write(
            &mut self,
            wrid: Wrid,
            local_addr: u64,
            lkey: u32,
            remote_addr: u64,
            rkey: u32,
            length: u32,
        ) -> Result<(), Error> {
            unsafe {
                let mut sge = sys::ibv_sge {
                    addr: local_addr,
                    length,
                    lkey,
                };
                let mut wr: sys::ibv_send_wr = std::mem::zeroed();
                wr.wr_id = wrid;
                wr.sg_list = &mut sge;
                wr.num_sge = 1;
                wr.opcode = sys::ibv_wr_opcode_IBV_WR_RDMA_WRITE;
                wr.send_flags = sys::ibv_send_flags_IBV_SEND_SIGNALED;
                wr.wr.rdma.remote_addr = remote_addr;
                wr.wr.rdma.rkey = rkey;

                let mut bad_wr: *mut sys::ibv_send_wr = std::ptr::null_mut();
                let rc = sys::ibv_post_send(self.qp, &mut wr, &mut bad_wr);
                if rc == libc::ENOMEM {
                    return Err(Error::Transient("send queue full (ENOMEM)".into()));
                }
                if rc != 0 {
                    return Err(Error::Resource(format!("ibv_post_send(WRITE) failed: errno {rc}")));
                }
            }
            Ok(())
        }

        fn post_send(&mut self, wrid: Wrid, local_addr: u64, lkey: u32, length: u32) -> Result<(), Error> {
            unsafe {
                let mut sge = sys::ibv_sge {
                    addr: local_addr,
                    length,
                    lkey,
                };
                let mut wr: sys::ibv_send_wr = std::mem::zeroed();
                wr.wr_id = wrid;
                wr.sg_list = &mut sge;
                wr.num_sge = 1;
                wr.opcode = sys::ibv_wr_opcode_IBV_WR_SEND;
                wr.send_flags = sys::ibv_send_flags_IBV_SEND_SIGNALED;

                let mut bad_wr: *mut sys::ibv_send_wr = std::ptr::null_mut();
                let rc = sys::ibv_post_send(self.qp, &mut wr, &mut bad_wr);
                if rc == libc::ENOMEM {
                    return Err(Error::Transient("send queue full (ENOMEM)".into()));
                }
                if rc != 0 {
                    return Err(Error::Resource(format!("ibv_post_send(SEND) failed: errno {rc}")));
                }
            }
            Ok(())
        }

        fn post_recv(&mut self, wrid: Wrid, local_addr: u64, lkey: u32, length: u32) -> Result<(), Error> {
            unsafe {
                let mut sge = sys::ibv_sge {
                    addr: local_addr,
                    length,
                    lkey,
                };
                let mut wr: sys::ibv_recv_wr = std::mem::zeroed();
                wr.wr_id = wrid;
                wr.sg_list = &mut sge;
                wr.num_sge = 1;

                let mut bad_wr: *mut sys::ibv_recv_wr = std::ptr::null_mut();
                let rc = sys::ibv_post_recv(self.qp, &mut wr, &mut bad_wr);
                if rc != 0 {
                    return Err(Error::Resource(format!("ibv_post_recv failed: errno {rc}")));
                }
            }
            Ok(())
        }

        fn poll_cq(&mut self, max: usize) -> Result<Vec<Completion>, Error> {
            let mut wc = vec![sys::ibv_wc::default(); max];
            let n = unsafe { sys::ibv_poll_cq(self.cq, max as i32, wc.as_mut_ptr()) };
            if n < 0 {
                return Err(Error::Resource("ibv_poll_cq returned an error".into()));
            }
            Ok(wc[..n as usize]
                .iter()
                .map(|w| Completion {
                    wrid: w.wr_id,
                    status: if w.status == sys::ibv_wc_status_IBV_WC_SUCCESS {
                        CompletionStatus::Success
                    } else {
                        CompletionStatus::Error(w.status as i32)
                    },
                    is_write: w.opcode == sys::ibv_wc_opcode_IBV_WC_RDMA_WRITE,
                })
                .collect())
        }

        fn block_for_completion(&mut self, cooperative: bool) -> Result<(), Error> {
            if cooperative {
                // Destination role: wait on the completion channel's fd
                // through an mio::Poll instead of blocking the thread
                // directly in ibv_get_cq_event, so this path can share a
                // thread with other event sources.
                let fd = self.completion_fd();
                let mut poll = mio::Poll::new().map_err(|e| Error::Resource(format!("mio::Poll::new failed: {e}")))?;
                poll.registry()
                    .register(&mut mio::unix::SourceFd(&fd), mio::Token(0), mio::Interest::READABLE)
                    .map_err(|e| Error::Resource(format!("failed to register completion fd with mio: {e}")))?;
                let mut events = mio::Events::with_capacity(1);
                poll.poll(&mut events, None)
                    .map_err(|e| Error::Resource(format!("mio poll on completion fd failed: {e}")))?;
                unsafe {
                    let mut cq_ctx: *mut std::ffi::c_void = std::ptr::null_mut();
                    let mut cq: *mut sys::ibv_cq = std::ptr::null_mut();
                    let rc = sys::ibv_get_cq_event(self.comp_channel, &mut cq, &mut cq_ctx);
                    if rc != 0 {
                        return Err(Error::Transient("ibv_get_cq_event failed".into()));
                    }
                    sys::ibv_ack_cq_events(cq, 1);
                }
            } else {
                // Source role: busy-poll briefly before falling back to the
                // blocking event path, matching the "thread + blocking I/O"
                // half of the busy-poll-then-block duality.
                for _ in 0..1000 {
                    if !self.poll_cq(1)?.is_empty() {
                        return Ok(());
                    }
                    std::hint::spin_loop();
                }
                unsafe {
                    let mut cq_ctx: *mut std::ffi::c_void = std::ptr::null_mut();
                    let mut cq: *mut sys::ibv_cq = std::ptr::null_mut();
                    let rc = sys::ibv_get_cq_event(self.comp_channel, &mut cq, &mut cq_ctx);
                    if rc != 0 {
                        return Err(Error::Transient("ibv_get_cq_event failed".into()));
                    }
                    sys::ibv_ack_cq_events(cq, 1);
                }
            }
            Ok(())
        }

        fn reg_mr(&mut self, addr: u64, length: u64, remote_write: bool) -> Result<MrHandle, Error> {
            let mut access = sys::ibv_access_flags_IBV_ACCESS_LOCAL_WRITE;
            if remote_write {
                access |= sys::ibv_access_flags_IBV_ACCESS_REMOTE_WRITE;
            }
            let mr = unsafe { sys::ibv_reg_mr(self.pd, addr as *mut std::ffi::c_void, length as usize, access as i32) };
            if mr.is_null() {
                return Err(Error::Resource(format!(
                    "ibv_reg_mr failed for {length} bytes at {addr:#x} (mlock limit?)"
                )));
            }
            let id = self.next_mr_id;
            self.next_mr_id += 1;
            let (rkey, lkey) = unsafe { ((*mr).rkey, (*mr).lkey) };
            self.mrs.insert(id, mr);
            Ok(MrHandle::new(rkey, lkey, id))
        }

        fn dereg_mr(&mut self, mr: MrHandle) -> Result<(), Error> {
            let raw = self
                .mrs
                .remove(&mr.id())
                .ok_or_else(|| Error::Bug(format!("dereg_mr called for unknown mr id {}", mr.id())))?;
            let rc = unsafe { sys::ibv_dereg_mr(raw) };
            if rc != 0 {
                return Err(Error::Resource(format!("ibv_dereg_mr failed: errno {rc}")));
            }
            Ok(())
        }

        fn modify_qp_to_err(&mut self) -> Result<(), Error> {
            unsafe {
                let mut attr: sys::ibv_qp_attr = std::mem::zeroed();
                attr.qp_state = sys::ibv_qp_state_IBV_QPS_ERR;
                let rc = sys::ibv_modify_qp(self.qp, &mut attr, sys::ibv_qp_attr_mask_IBV_QP_STATE as i32);
                if rc != 0 {
                    return Err(Error::Resource("failed to force QP into ERR state".into()));
                }
            }
            Ok(())
        }

        fn completion_fd(&self) -> std::os::unix::io::RawFd {
            unsafe { (*self.comp_channel).fd }
        }
    }

    impl Drop for LibverbsContext {
        fn drop(&mut self) {
            unsafe {
                for (_, mr) in self.mrs.drain() {
                    sys::ibv_dereg_mr(mr);
                }
                if !self.qp.is_null() {
                    sys::ibv_destroy_qp(self.qp);
                }
                if !self.cq.is_null() {
                    sys::ibv_destroy_cq(self.cq);
                }
                if !self.comp_channel.is_null() {
                    sys::ibv_destroy_comp_channel(self.comp_channel);
                }
                if !self.pd.is_null() {
                    sys::ibv_dealloc_pd(self.pd);
                }
            }
        }
    }
}
