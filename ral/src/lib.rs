// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The register access layer: the surface through which the mirror
//! subsystem touches the switch ASIC.
//!
//! The actual DMA/instruction-list plumbing lives below this crate and is
//! owned by the SDE session framework.  Here we define the abstract
//! register-file contract ([`RegisterIo`]), the description of the device
//! being driven ([`DeviceInfo`]), and the error taxonomy shared by every
//! hardware-touching path.

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod fake;

/// A logical pipe index, as seen by the control plane.
pub type PipeId = u8;

/// A physical pipe index, as wired on the die.
pub type PhysPipe = u8;

/// A register offset within one pipe's address space.
pub type RegAddr = u32;

/// A specialized Result type for register-layer operations.
pub type RalResult<T> = Result<T, RalError>;

/// Error type conveying additional information about register-layer
/// failures.
#[derive(Error, Debug)]
pub enum RalError {
    /// The instruction-list/DMA layer rejected or failed an operation.
    /// Reports both the location that detected the error and the detailed
    /// message from the layer below.
    #[error("DMA error at {ctx}: {err}")]
    DmaError { ctx: String, err: String },
    /// An argument passed to the register layer is invalid or
    /// inappropriate.  This indicates misbehavior from the caller.
    #[error("Invalid argument: {}", .0)]
    InvalidArg(String),
    /// A register function was called before the layer was properly
    /// initialized.  Indicates misbehavior from the caller.
    #[error("register layer uninitialized: {}", .0)]
    Uninitialized(String),
    /// The register layer detected some internal inconsistency.
    #[error("Internal error: {}", .0)]
    Internal(String),
    /// An error derived from a purposely triggered synthetic fault for
    /// testing purposes.
    #[error("Synthetic register error: {}", .0)]
    Synthetic(String),
}

/// The three generations of the Tofino ASIC, which the SDE refers to as
/// "families".  Each family has an incompatible mirror-session register
/// layout and its own coalescing hardware, so the family tag selects the
/// codec used for every hardware translation.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
)]
pub enum DeviceFamily {
    Tofino1,
    Tofino2,
    Tofino3,
}

/// A single register write, as queued on the fast DMA batch path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegWrite {
    pub pipe: PhysPipe,
    pub addr: RegAddr,
    pub val: u32,
}

/// The contract the mirror subsystem programs hardware through.  One
/// implementation wraps the SDE's instruction-list machinery; the in-memory
/// [`fake::FakeIo`] stands in for it under test.
pub trait RegisterIo: Send + Sync {
    /// Write a single register word through the direct (non-batched) path.
    fn write(&self, pipe: PhysPipe, addr: RegAddr, val: u32) -> RalResult<()>;

    /// Read back a single register word.
    fn read(&self, pipe: PhysPipe, addr: RegAddr) -> RalResult<u32>;

    /// Push a sequence of writes through the DMA batch path.  The default
    /// implementation degrades to word-at-a-time writes; real backends
    /// coalesce the sequence into one instruction list.
    fn write_batch(&self, writes: &[RegWrite]) -> RalResult<()> {
        for w in writes {
            self.write(w.pipe, w.addr, w.val)?;
        }
        Ok(())
    }
}

/// Everything the mirror subsystem needs to know about the device it is
/// driving.  Built once at device-add time from the topology layer and
/// never mutated afterwards, except for the lock flag which tracks
/// fast-reconfig windows.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// SDE device id.
    pub dev_id: u32,
    pub family: DeviceFamily,
    num_pipes: u8,
    /// Logical-to-physical pipe mapping, indexed by logical pipe.
    phys_map: Vec<PhysPipe>,
    /// True when driving the software model rather than real hardware.
    /// The model has no mirror buffers, so drain waits are meaningless.
    pub sw_model: bool,
    /// True while the device is locked for fast reconfig.  Programming
    /// during a locked window goes through the batch path unconditionally.
    pub locked: bool,
}

impl DeviceInfo {
    /// Describe a device whose logical and physical pipe numbering match.
    pub fn new(dev_id: u32, family: DeviceFamily, num_pipes: u8) -> Self {
        DeviceInfo {
            dev_id,
            family,
            num_pipes,
            phys_map: (0..num_pipes).collect(),
            sw_model: false,
            locked: false,
        }
    }

    /// Describe a device with an explicit logical-to-physical pipe map.
    pub fn with_phys_map(
        dev_id: u32,
        family: DeviceFamily,
        phys_map: Vec<PhysPipe>,
    ) -> RalResult<Self> {
        if phys_map.is_empty() {
            return Err(RalError::InvalidArg(
                "device must have at least one pipe".to_string(),
            ));
        }
        Ok(DeviceInfo {
            dev_id,
            family,
            num_pipes: phys_map.len() as u8,
            phys_map,
            sw_model: false,
            locked: false,
        })
    }

    pub fn num_pipes(&self) -> u8 {
        self.num_pipes
    }

    /// Translate a logical pipe index to its physical location.
    pub fn log_to_phys(&self, pipe: PipeId) -> RalResult<PhysPipe> {
        self.phys_map.get(pipe as usize).copied().ok_or_else(|| {
            RalError::InvalidArg(format!(
                "logical pipe {pipe} out of range on device {}",
                self.dev_id
            ))
        })
    }

    /// Translate a physical pipe back to the logical index the control
    /// plane uses.
    pub fn phys_to_log(&self, phys: PhysPipe) -> RalResult<PipeId> {
        self.phys_map
            .iter()
            .position(|p| *p == phys)
            .map(|p| p as PipeId)
            .ok_or_else(|| {
                RalError::InvalidArg(format!(
                    "physical pipe {phys} not present on device {}",
                    self.dev_id
                ))
            })
    }
}

#[test]
fn test_pipe_mapping() -> anyhow::Result<()> {
    let dev = DeviceInfo::new(0, DeviceFamily::Tofino2, 4);
    assert_eq!(dev.num_pipes(), 4);
    assert_eq!(dev.log_to_phys(2)?, 2);
    assert_eq!(dev.phys_to_log(3)?, 3);
    dev.log_to_phys(4).unwrap_err();

    let dev = DeviceInfo::with_phys_map(
        0,
        DeviceFamily::Tofino2,
        vec![3, 1, 0, 2],
    )?;
    assert_eq!(dev.log_to_phys(0)?, 3);
    assert_eq!(dev.phys_to_log(3)?, 0);
    assert_eq!(dev.phys_to_log(2)?, 3);
    Ok(())
}
