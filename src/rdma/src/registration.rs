//! Memory registration modes: `PIN_ALL` registers everything up
//! front, `DYNAMIC` registers chunks lazily with optional speculative
//! unregistration via a bounded ring.

use std::collections::VecDeque;

use crate::ramblock::RemoteChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMode {
    PinAll,
    Dynamic,
}

pub fn needs_registration(remote: &RemoteChunk) -> bool {
    remote.rkey == 0
}

/// Fixed-capacity ring of `(block, chunk)` pairs awaiting the next
/// `UNREGISTER_REQUEST` flush.
pub struct UnregisterQueue {
    ring: VecDeque<(u32, u32)>,
    capacity: usize,
}

impl UnregisterQueue {
    pub fn new(capacity: usize) -> Self {
        Self { ring: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Speculatively enqueue a completed chunk. Returns `false` (dropped,
    /// not an error) if the ring is already full — unregistration is
    /// best-effort.
    pub fn push(&mut self, block: u32, chunk: u32) -> bool {
        if self.ring.len() >= self.capacity {
            return false;
        }
        self.ring.push_back((block, chunk));
        true
    }

    /// Drains entries whose chunk is not currently in flight (`is_in_transit`
    /// returns false); entries still in flight are retried on the next call
    /// rather than dropped.
    pub fn drain_ready(&mut self, is_in_transit: impl Fn(u32, u32) -> bool) -> Vec<(u32, u32)> {
        let mut ready = Vec::new();
        let mut retained = VecDeque::with_capacity(self.ring.len());
        while let Some((block, chunk)) = self.ring.pop_front() {
            if is_in_transit(block, chunk) {
                retained.push_back((block, chunk));
            } else {
                ready.push((block, chunk));
            }
        }
        self.ring = retained;
        ready
    }
}
