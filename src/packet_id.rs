//! Packet identifier allocation
//!
//! Identifiers live in `1..=max`. The pool hands out the smallest identifier
//! not currently in use and takes it back once its handshake completes.

use std::collections::BTreeSet;

use crate::constants::limits::MAX_PACKET_ID;

/// Free-list pool of packet identifiers
///
/// Identifiers at or above `next_fresh` have never been handed out (or were
/// compacted back); `free` holds released identifiers below it.
#[derive(Debug, Clone)]
pub struct PacketIdPool {
    max: u16,
    next_fresh: u32,
    free: BTreeSet<u16>,
}

impl PacketIdPool {
    /// Creates a pool over `1..=max`
    #[must_use]
    pub fn new(max: u16) -> Self {
        Self {
            max,
            next_fresh: 1,
            free: BTreeSet::new(),
        }
    }

    /// Takes the smallest unused identifier, `None` when every identifier is in use
    pub fn allocate(&mut self) -> Option<u16> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next_fresh > u32::from(self.max) {
            return None;
        }
        let id = u16::try_from(self.next_fresh).ok()?;
        self.next_fresh += 1;
        Some(id)
    }

    /// Marks a specific identifier as in use
    ///
    /// Used when restoring entries from a resumed session. Returns `false` if
    /// the identifier is out of range or already taken.
    pub fn reserve(&mut self, id: u16) -> bool {
        if id == 0 || id > self.max {
            return false;
        }
        let id32 = u32::from(id);
        if id32 < self.next_fresh {
            return self.free.remove(&id);
        }
        for skipped in self.next_fresh..id32 {
            if let Ok(skipped) = u16::try_from(skipped) {
                self.free.insert(skipped);
            }
        }
        self.next_fresh = id32 + 1;
        true
    }

    /// Returns an identifier to the pool
    ///
    /// Returns `false` if it was not in use.
    pub fn release(&mut self, id: u16) -> bool {
        let id32 = u32::from(id);
        if id == 0 || id32 >= self.next_fresh || self.free.contains(&id) {
            return false;
        }
        self.free.insert(id);
        // keep the free list short by shrinking the fresh boundary
        while self.next_fresh > 1 {
            let Ok(top) = u16::try_from(self.next_fresh - 1) else {
                break;
            };
            if !self.free.remove(&top) {
                break;
            }
            self.next_fresh -= 1;
        }
        true
    }

    #[must_use]
    pub fn is_in_use(&self, id: u16) -> bool {
        id != 0 && u32::from(id) < self.next_fresh && !self.free.contains(&id)
    }

    /// Number of identifiers currently handed out
    #[must_use]
    pub fn in_use(&self) -> usize {
        (self.next_fresh as usize - 1) - self.free.len()
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.in_use() == usize::from(self.max)
    }

    /// Returns every identifier to the pool
    pub fn clear(&mut self) {
        self.next_fresh = 1;
        self.free.clear();
    }
}

impl Default for PacketIdPool {
    fn default() -> Self {
        Self::new(MAX_PACKET_ID)
    }
}
