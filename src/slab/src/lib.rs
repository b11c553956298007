//! Growable/shrinkable staging buffer for one checkpoint's worth of bytes.
//!
//! Backed by a [`generational_arena::Arena`] rather than an owned doubly
//! linked list: nodes reference their neighbors by [`Index`] instead of by
//! pointer, so the cyclic head/tail/curr bookkeeping never needs unsafe code
//! or a back-owning reference.

use generational_arena::{Arena, Index};
use tracing::{debug, trace};

/// Fixed size of every slab (5 MiB).
pub const SLAB_CAPACITY: usize = 5 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("slab chain is not open for writing")]
    NotOpenForWrite,
    #[error("slab chain is not open for reading")]
    NotOpenForRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Closed,
    Write,
    Read,
}

struct Slab {
    buf: Box<[u8]>,
    size: usize,
    read: usize,
    next: Option<Index>,
    prev: Option<Index>,
}

impl Slab {
    fn new() -> Self {
        Self {
            buf: vec![0u8; SLAB_CAPACITY].into_boxed_slice(),
            size: 0,
            read: 0,
            next: None,
            prev: None,
        }
    }
}

/// Append-only write / sequential-read byte container.
pub struct SlabChain {
    arena: Arena<Slab>,
    head: Index,
    tail: Index,
    curr: Index,
    nb_slabs: usize,
    slab_total: usize,
    strikes: u32,
    max_strikes: u32,
    mode: Mode,
}

/// `max_strikes = ceil(shrink_delay_secs * 1000 / freq_ms)`.
pub fn calc_max_strikes(shrink_delay_secs: u32, freq_ms: u32) -> u32 {
    let freq_ms = freq_ms.max(1) as u64;
    let total_ms = shrink_delay_secs as u64 * 1000;
    ((total_ms + freq_ms - 1) / freq_ms) as u32
}

impl SlabChain {
    pub fn new(max_strikes: u32) -> Self {
        let mut arena = Arena::new();
        let head = arena.insert(Slab::new());
        Self {
            arena,
            head,
            tail: head,
            curr: head,
            nb_slabs: 1,
            slab_total: 0,
            strikes: 0,
            max_strikes,
            mode: Mode::Closed,
        }
    }

    pub fn nb_slabs(&self) -> usize {
        self.nb_slabs
    }

    pub fn slab_total(&self) -> usize {
        self.slab_total
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    pub fn set_max_strikes(&mut self, max_strikes: u32) {
        self.max_strikes = max_strikes;
    }

    /// Open the chain for appending; write always resumes at the logical
    /// end left by the last `reset_for_epoch`.
    pub fn open_write(&mut self) {
        self.mode = Mode::Write;
    }

    /// Open the chain for sequential reading from the head.
    pub fn open_read(&mut self) {
        self.curr = self.head;
        let mut idx = Some(self.head);
        while let Some(i) = idx {
            let slab = &mut self.arena[i];
            slab.read = 0;
            idx = slab.next;
        }
        self.mode = Mode::Read;
    }

    /// Append `data`, allocating or reusing tail slabs as needed; empty
    /// input never allocates.
    pub fn put(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.mode != Mode::Write {
            return Err(Error::NotOpenForWrite);
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = SLAB_CAPACITY - self.arena[self.curr].size;
            if room == 0 {
                self.advance_write_cursor();
                continue;
            }
            let n = remaining.len().min(room);
            let slab = &mut self.arena[self.curr];
            slab.buf[slab.size..slab.size + n].copy_from_slice(&remaining[..n]);
            slab.size += n;
            self.slab_total += n;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    fn advance_write_cursor(&mut self) {
        let next = self.arena[self.curr].next;
        self.curr = match next {
            Some(idx) => idx,
            None => {
                let new_idx = self.arena.insert(Slab::new());
                self.arena[self.curr].next = Some(new_idx);
                self.arena[new_idx].prev = Some(self.curr);
                self.tail = new_idx;
                self.nb_slabs += 1;
                new_idx
            }
        };
    }

    /// Copy up to `dst.len()` bytes from the read cursor into `dst`,
    /// returning the number of bytes actually copied (0 at end of chain).
    pub fn get(&mut self, dst: &mut [u8]) -> Result<usize, Error> {
        if self.mode != Mode::Read {
            return Err(Error::NotOpenForRead);
        }
        let mut copied = 0;
        while copied < dst.len() {
            let slab = &mut self.arena[self.curr];
            let avail = slab.size - slab.read;
            if avail == 0 {
                match slab.next {
                    Some(next) => self.curr = next,
                    None => break,
                }
                continue;
            }
            let n = (dst.len() - copied).min(avail);
            dst[copied..copied + n].copy_from_slice(&slab.buf[slab.read..slab.read + n]);
            slab.read += n;
            copied += n;
        }
        Ok(copied)
    }

    /// Adaptive sizing and epoch rollover.
    pub fn reset_for_epoch(&mut self) {
        if self.nb_slabs >= 2 && self.strikes >= self.max_strikes {
            let to_free = std::cmp::max(1, (self.nb_slabs - 1) / 2);
            self.free_tail_slabs(to_free);
            self.strikes = 0;
            debug!(freed = to_free, nb_slabs = self.nb_slabs, "slab chain shrunk");
        } else if self.nb_slabs >= 2 && self.slab_total <= (self.nb_slabs - 1) * SLAB_CAPACITY {
            self.strikes += 1;
            trace!(strikes = self.strikes, max = self.max_strikes, "slab chain under-used");
        } else {
            self.strikes = 0;
        }

        let mut idx = Some(self.head);
        while let Some(i) = idx {
            let slab = &mut self.arena[i];
            slab.size = 0;
            slab.read = 0;
            idx = slab.next;
        }
        self.slab_total = 0;
        self.curr = self.head;
        self.mode = Mode::Closed;
    }

    fn free_tail_slabs(&mut self, count: usize) {
        for _ in 0..count {
            if self.nb_slabs <= 1 {
                break;
            }
            let old_tail = self.tail;
            let prev = self.arena[old_tail].prev;
            self.arena.remove(old_tail);
            if let Some(p) = prev {
                self.arena[p].next = None;
                self.tail = p;
            }
            self.nb_slabs -= 1;
        }
    }

    /// Free every slab, including the head. The chain is unusable afterward.
    pub fn close(mut self) {
        self.arena.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips_across_slab_boundaries() {
        let mut chain = SlabChain::new(10);
        chain.open_write();
        let data: Vec<u8> = (0..(SLAB_CAPACITY * 3 + 17)).map(|i| (i % 251) as u8).collect();
        chain.put(&data).unwrap();
        assert_eq!(chain.slab_total(), data.len());

        chain.open_read();
        let mut out = vec![0u8; data.len()];
        let mut pos = 0;
        loop {
            let n = chain.get(&mut out[pos..]).unwrap();
            if n == 0 {
                break;
            }
            pos += n;
        }
        assert_eq!(pos, data.len());
        assert_eq!(out, data);
    }

    #[test]
    fn empty_put_allocates_nothing() {
        let mut chain = SlabChain::new(10);
        chain.open_write();
        chain.put(&[]).unwrap();
        assert_eq!(chain.nb_slabs(), 1);
        assert_eq!(chain.slab_total(), 0);
    }

    #[test]
    fn reset_for_epoch_clears_total_and_keeps_head() {
        let mut chain = SlabChain::new(10);
        chain.open_write();
        chain.put(&vec![1u8; SLAB_CAPACITY * 2]).unwrap();
        assert_eq!(chain.nb_slabs(), 2);
        chain.reset_for_epoch();
        assert_eq!(chain.slab_total(), 0);
        assert!(chain.nb_slabs() >= 1);
    }

    #[test]
    fn chain_shrinks_after_max_strikes_of_underuse() {
        let mut chain = SlabChain::new(2);
        chain.open_write();
        chain.put(&vec![1u8; SLAB_CAPACITY * 3]).unwrap();
        chain.reset_for_epoch();
        assert_eq!(chain.nb_slabs(), 3);

        // idle epochs: nothing written, so strikes accumulate until the
        // third reset's entry check (strikes == max_strikes) triggers a shrink.
        for _ in 0..3 {
            chain.open_write();
            chain.reset_for_epoch();
        }
        assert_eq!(chain.nb_slabs(), 2, "chain should have shrunk after max_strikes of underuse");
    }

    #[test]
    fn chain_never_shrinks_below_one_slab() {
        let mut chain = SlabChain::new(1);
        for _ in 0..10 {
            chain.open_write();
            chain.reset_for_epoch();
        }
        assert_eq!(chain.nb_slabs(), 1);
    }

    #[test]
    fn calc_max_strikes_matches_ceiling_division() {
        assert_eq!(calc_max_strikes(10, 100), 100);
        assert_eq!(calc_max_strikes(10, 300), 34);
        assert_eq!(calc_max_strikes(1, 1000), 1);
    }

    #[test]
    fn get_without_open_read_errors() {
        let mut chain = SlabChain::new(10);
        let mut buf = [0u8; 4];
        assert!(matches!(chain.get(&mut buf), Err(Error::NotOpenForRead)));
    }
}
