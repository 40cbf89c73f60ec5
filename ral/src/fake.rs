// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! An in-memory register file used in place of real hardware by the test
//! suites.  Registers read as zero until written, matching the
//! all-zeros reset state the codecs rely on to detect never-programmed
//! session slots.
//!
//! Failures are injected deterministically rather than probabilistically,
//! so rollback tests can assert the exact write that failed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Mutex;

use slog::Logger;

use crate::{PhysPipe, RalError, RalResult, RegAddr, RegisterIo};

#[derive(Default)]
struct FakeState {
    regs: BTreeMap<(PhysPipe, RegAddr), u32>,
    // Writes remaining until the next injected failure.  None means no
    // failure is armed.
    fail_after: Option<u32>,
    // Addresses for which every write fails.
    fail_addrs: BTreeSet<RegAddr>,
    writes: u64,
}

pub struct FakeIo {
    log: Logger,
    state: Mutex<FakeState>,
}

impl FakeIo {
    pub fn new(log: Logger) -> Self {
        FakeIo {
            log,
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Arm a failure on the `n`th subsequent write (0 fails the very next
    /// one).  The failure disarms after it fires.
    pub fn fail_after(&self, n: u32) {
        self.state.lock().unwrap().fail_after = Some(n);
    }

    /// Fail every write to `addr` until cleared.
    pub fn fail_addr(&self, addr: RegAddr) {
        self.state.lock().unwrap().fail_addrs.insert(addr);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_after = None;
        state.fail_addrs.clear();
    }

    /// Total number of write attempts, including failed ones.
    pub fn write_count(&self) -> u64 {
        self.state.lock().unwrap().writes
    }

    /// A copy of every register holding a non-zero value.  Zero-valued
    /// entries are dropped so that an explicit zeroing write and the reset
    /// state compare equal, the way they do on the real register file.
    pub fn snapshot(&self) -> BTreeMap<(PhysPipe, RegAddr), u32> {
        self.state
            .lock()
            .unwrap()
            .regs
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    fn check_injected(
        state: &mut FakeState,
        pipe: PhysPipe,
        addr: RegAddr,
    ) -> RalResult<()> {
        if state.fail_addrs.contains(&addr) {
            return Err(RalError::Synthetic(format!(
                "armed failure at pipe {pipe} addr {addr:#x}"
            )));
        }
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                Err(RalError::Synthetic(format!(
                    "armed failure at pipe {pipe} addr {addr:#x}"
                )))
            }
            Some(n) => {
                state.fail_after = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl RegisterIo for FakeIo {
    fn write(&self, pipe: PhysPipe, addr: RegAddr, val: u32) -> RalResult<()> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        Self::check_injected(&mut state, pipe, addr)?;
        slog::trace!(
            self.log,
            "reg write pipe {} addr {:#x} val {:#x}",
            pipe,
            addr,
            val
        );
        state.regs.insert((pipe, addr), val);
        Ok(())
    }

    fn read(&self, pipe: PhysPipe, addr: RegAddr) -> RalResult<u32> {
        let state = self.state.lock().unwrap();
        Ok(state.regs.get(&(pipe, addr)).copied().unwrap_or(0))
    }
}

#[cfg(test)]
fn test_log() -> Logger {
    common::logging::init("test", &None, common::logging::LogFormat::Human)
        .unwrap()
}

#[test]
fn test_reset_state_reads_zero() -> anyhow::Result<()> {
    let io = FakeIo::new(test_log());
    assert_eq!(io.read(0, 0x100)?, 0);
    io.write(0, 0x100, 7)?;
    assert_eq!(io.read(0, 0x100)?, 7);
    assert_eq!(io.read(1, 0x100)?, 0);
    Ok(())
}

#[test]
fn test_fail_after() -> anyhow::Result<()> {
    let io = FakeIo::new(test_log());
    io.fail_after(1);
    io.write(0, 0x100, 1)?;
    io.write(0, 0x104, 2).unwrap_err();
    // The failure disarms after firing.
    io.write(0, 0x104, 3)?;
    assert_eq!(io.read(0, 0x104)?, 3);
    Ok(())
}

#[test]
fn test_fail_addr() -> anyhow::Result<()> {
    let io = FakeIo::new(test_log());
    io.fail_addr(0x200);
    io.write(0, 0x1fc, 1)?;
    io.write(0, 0x200, 1).unwrap_err();
    io.write(1, 0x200, 1).unwrap_err();
    io.clear_failures();
    io.write(0, 0x200, 1)?;
    Ok(())
}

#[test]
fn test_snapshot_drops_zeros() -> anyhow::Result<()> {
    let io = FakeIo::new(test_log());
    io.write(0, 0x100, 5)?;
    io.write(0, 0x104, 0)?;
    let snap = io.snapshot();
    assert_eq!(snap.len(), 1);
    assert_eq!(snap.get(&(0, 0x100)), Some(&5));
    Ok(())
}
