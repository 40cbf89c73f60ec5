// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The coalescing-slot allocator for Tofino2/3.
//!
//! Coalescing hardware is scarce: 16 slots per device, shared by every
//! session that needs coalescing, assigned independently per (session,
//! scope) so a per-pipe session holds its own slot.  On Tofino1 slots are
//! instead bound to a fixed high session-id range by address convention
//! and never pass through this allocator.
//!
//! This structure lives inside the session store's mutex; it has no
//! locking of its own.

use std::collections::BTreeMap;

use crate::session::SessionKey;

pub(crate) struct CoalSlots {
    // Bit n set means slot n is free.
    free: u32,
    assigned: BTreeMap<SessionKey, u8>,
}

impl CoalSlots {
    pub fn new(nslots: u8) -> Self {
        assert!(nslots as usize <= u32::BITS as usize);
        CoalSlots {
            free: if nslots == 32 {
                u32::MAX
            } else {
                (1u32 << nslots) - 1
            },
            assigned: BTreeMap::new(),
        }
    }

    /// Assign a slot to `key`, or return the slot it already holds.
    pub fn alloc(&mut self, key: SessionKey) -> Option<u8> {
        if let Some(slot) = self.assigned.get(&key) {
            return Some(*slot);
        }
        if self.free == 0 {
            return None;
        }
        let slot = self.free.trailing_zeros() as u8;
        self.free &= !(1 << slot);
        self.assigned.insert(key, slot);
        Some(slot)
    }

    /// Release the slot held by `key`, if any, returning it.
    pub fn release(&mut self, key: &SessionKey) -> Option<u8> {
        let slot = self.assigned.remove(key)?;
        self.free |= 1 << slot;
        Some(slot)
    }

    pub fn get(&self, key: &SessionKey) -> Option<u8> {
        self.assigned.get(key).copied()
    }

    pub fn in_use(&self) -> usize {
        self.assigned.len()
    }
}

#[cfg(test)]
use crate::session::PipeScope;

#[cfg(test)]
fn key(sid: u16) -> SessionKey {
    SessionKey::new(sid, PipeScope::All)
}

#[test]
fn test_alloc_release() -> anyhow::Result<()> {
    let mut slots = CoalSlots::new(16);
    let a = slots.alloc(key(10)).unwrap();
    let b = slots.alloc(key(11)).unwrap();
    assert_ne!(a, b);
    // Allocation is idempotent per key.
    assert_eq!(slots.alloc(key(10)), Some(a));
    assert_eq!(slots.in_use(), 2);

    assert_eq!(slots.release(&key(10)), Some(a));
    assert_eq!(slots.release(&key(10)), None);
    assert_eq!(slots.get(&key(11)), Some(b));
    assert_eq!(slots.in_use(), 1);
    Ok(())
}

#[test]
fn test_exhaustion_and_reuse() -> anyhow::Result<()> {
    let mut slots = CoalSlots::new(16);
    for sid in 1..=16 {
        slots.alloc(key(sid)).unwrap();
    }
    assert_eq!(slots.alloc(key(17)), None);

    // A released slot is immediately available to the next allocation.
    let freed = slots.release(&key(7)).unwrap();
    assert_eq!(slots.alloc(key(17)), Some(freed));
    assert_eq!(slots.in_use(), 16);
    Ok(())
}

// Per-pipe sessions hold independent slots for the same id.
#[test]
fn test_per_pipe_slots() -> anyhow::Result<()> {
    let mut slots = CoalSlots::new(16);
    let a = slots.alloc(SessionKey::new(9, PipeScope::Pipe(0))).unwrap();
    let b = slots.alloc(SessionKey::new(9, PipeScope::Pipe(1))).unwrap();
    assert_ne!(a, b);
    Ok(())
}
