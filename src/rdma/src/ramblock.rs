//! One region of guest RAM as seen by the RDMA transport: host address view,
//! per-chunk bitmaps, and per-chunk remote registration state.

use vm_memory::{GuestAddress, VolatileSlice};

use crate::chunk::CHUNK_SIZE;
use crate::error::Error;
use crate::verbs::MrHandle;

/// A fixed-size bit set sized to a block's chunk count.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    words: Vec<u64>,
    len: usize,
}

impl ChunkBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64).max(1)],
            len,
        }
    }

    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 64] |= 1 << (i % 64);
    }

    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 64] &= !(1 << (i % 64));
    }

    pub fn is_set(&self, i: usize) -> bool {
        (self.words[i / 64] >> (i % 64)) & 1 != 0
    }

    /// Number of set bits; must equal the number of outstanding WRITEs
    /// referencing this block.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Per-chunk remote registration: a zero `rkey` means "not registered",
/// nonzero means the remote side has this chunk registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteChunk {
    pub rkey: u32,
    pub remote_host_addr: u64,
}

pub struct RamBlock<'a> {
    pub index: u32,
    pub guest_offset: u64,
    pub length: u64,
    slice: VolatileSlice<'a>,
    pub nb_chunks: usize,
    pub transit: ChunkBitmap,
    pub unregister_pending: ChunkBitmap,
    pub remote: Vec<RemoteChunk>,
    /// Remote rkey for this block's whole-block registration, learned from
    /// the peer's `RAM_BLOCKS_RESULT` entry in `PIN_ALL` mode.
    pub whole_block_rkey: Option<u32>,
    /// Remote base host address matching `whole_block_rkey`.
    pub remote_whole_block_addr: Option<u64>,
    /// This side's own local registration of the whole block, covering both
    /// the `lkey` used to post a WRITE reading from this block and, in
    /// `PIN_ALL` mode, the `rkey` advertised to the peer.
    pub local_whole_mr: Option<MrHandle>,
    /// This side's own per-chunk local registrations, used in `DYNAMIC` mode
    /// instead of one whole-block registration.
    pub local_chunk_mr: Vec<Option<MrHandle>>,
}

impl<'a> RamBlock<'a> {
    pub fn new(index: u32, guest_offset: u64, length: u64, slice: VolatileSlice<'a>) -> Self {
        let nb_chunks = length.div_ceil(CHUNK_SIZE) as usize;
        Self {
            index,
            guest_offset,
            length,
            slice,
            nb_chunks,
            transit: ChunkBitmap::new(nb_chunks),
            unregister_pending: ChunkBitmap::new(nb_chunks),
            remote: vec![RemoteChunk::default(); nb_chunks],
            whole_block_rkey: None,
            remote_whole_block_addr: None,
            local_whole_mr: None,
            local_chunk_mr: vec![None; nb_chunks],
        }
    }

    pub fn host_addr(&self) -> Result<*mut u8, Error> {
        Ok(self.slice.ptr_guard_mut().as_ptr())
    }

    pub fn guest_addr(&self) -> GuestAddress {
        GuestAddress(self.guest_offset)
    }

    /// True when every byte in `[offset, offset+len)` is zero; drives the
    /// zero-page COMPRESS optimisation.
    pub fn is_zero_run(&self, offset: u64, len: u64) -> Result<bool, Error> {
        let sub = self
            .slice
            .subslice(offset as usize, len as usize)
            .map_err(|e| Error::Bug(format!("subslice out of range: {e}")))?;
        let mut buf = vec![0u8; len as usize];
        sub.copy_to(&mut buf);
        Ok(buf.iter().all(|&b| b == 0))
    }
}
