// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The chip-agnostic mirror-session data model.
//!
//! A [`SessionRecord`] carries everything the control plane knows about a
//! session.  The per-family hardware parameters live in the [`HwParams`]
//! sum type: exactly one variant is meaningful per device, and the codecs
//! pattern-match on it rather than trusting a separately-carried family
//! tag.

use std::fmt;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use ral::DeviceFamily;
use ral::PipeId;

/// A session id.  Id 0 is reserved on every family; the valid range above
/// that is family-specific.
pub type SessionId = u16;

/// The largest pipe count across the supported families (Tofino3 spans
/// two dies of four pipes each).
pub const MAX_PIPES: usize = 8;

/// Pipes are grouped into dies of four on Tofino3; the die vector routes
/// mirror copies between them.
pub const PIPES_PER_DIE: u8 = 4;

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
pub enum MirrorType {
    /// One mirrored copy per matched packet.
    Normal,
    /// Samples are buffered and emitted as one coalesced packet.
    Coalescing,
}

/// Which traffic directions a session applies to.
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
pub enum Direction {
    None,
    Ingress,
    Egress,
    Both,
}

/// Whether a session's configuration applies to every pipe on the device
/// or to exactly one.  Part of the store key: a given session id may exist
/// once per pipe or once globally, never both.
///
/// The derived ordering sorts `All` ahead of any specific pipe, which
/// fixes the store's iteration order for a given id.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub enum PipeScope {
    All,
    Pipe(PipeId),
}

impl fmt::Display for PipeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeScope::All => write!(f, "all-pipes"),
            PipeScope::Pipe(p) => write!(f, "pipe {p}"),
        }
    }
}

/// The store key: (session id, pipe scope), ordered by id first so that
/// iteration walks ids in ascending order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct SessionKey {
    pub sid: SessionId,
    pub scope: PipeScope,
}

impl SessionKey {
    pub fn new(sid: SessionId, scope: PipeScope) -> Self {
        SessionKey { sid, scope }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} ({})", self.sid, self.scope)
    }
}

/// Scheduling priority of a session's copies.  Tofino2/3 only.
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
pub enum SessionPriority {
    Low,
    High,
}

/// How the coalescing hardware formats its output.  Tofino2/3 only.
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
pub enum CoalMode {
    /// Tofino1-compatible header layout.
    Legacy,
    /// The family's native layout.
    Native,
}

/// Tofino1 per-session metadata, shaped the way the family's deparser
/// consumes it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
    JsonSchema,
)]
pub struct Tofino1Meta {
    pub egress_port: u16,
    pub egress_port_valid: bool,
    /// Logical pipe mask steering multicast copies.
    pub pipe_vec: u8,
    pub mcast_grp_a: u16,
    pub mcast_grp_a_valid: bool,
    pub mcast_grp_b: u16,
    pub mcast_grp_b_valid: bool,
    pub mcast_l1_xid: u16,
    pub mcast_l2_xid: u16,
    pub mcast_rid: u16,
    /// Ingress class of service.
    pub icos: u8,
    pub copy_to_cpu_cos: u8,
    pub copy_to_cpu: bool,
    pub deflect_on_drop: bool,
    pub color: u8,
    pub egress_queue: u8,
}

/// Per-field "take the value from the session config rather than the
/// pipeline" switches.  Tofino2/3 only; on Tofino1 the pipeline always
/// wins.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
    JsonSchema,
)]
pub struct ConfigSource {
    pub hash_cfg: bool,
    pub icos_cfg: bool,
    pub dod_cfg: bool,
    pub copy_to_cpu_cfg: bool,
    pub mc_cfg: bool,
    pub epipe_cfg: bool,
}

/// Tofino2 per-session entry.  Also the base of the Tofino3 entry, which
/// extends it with die routing.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct Tofino2Entry {
    pub egress_port: u16,
    pub egress_port_valid: bool,
    pub pipe_vec: u8,
    pub mcast_grp_a: u16,
    pub mcast_grp_a_valid: bool,
    pub mcast_grp_b: u16,
    pub mcast_grp_b_valid: bool,
    pub mcast_l1_xid: u16,
    pub mcast_l2_xid: u16,
    pub mcast_rid: u16,
    pub icos: u8,
    pub copy_to_cpu_cos: u8,
    pub copy_to_cpu: bool,
    pub deflect_on_drop: bool,
    pub color: u8,
    pub egress_queue: u8,
    pub cfg: ConfigSource,
    pub priority: SessionPriority,
    pub coal_mode: CoalMode,
    /// Saved deparser mirror-selector values, one slot per pipe, live only
    /// across a drain-and-reprogram transition.  Not session config.
    pub sel_save: [u32; MAX_PIPES],
    pub sel_save_valid: [bool; MAX_PIPES],
}

impl Default for Tofino2Entry {
    fn default() -> Self {
        Tofino2Entry {
            egress_port: 0,
            egress_port_valid: false,
            pipe_vec: 0,
            mcast_grp_a: 0,
            mcast_grp_a_valid: false,
            mcast_grp_b: 0,
            mcast_grp_b_valid: false,
            mcast_l1_xid: 0,
            mcast_l2_xid: 0,
            mcast_rid: 0,
            icos: 0,
            copy_to_cpu_cos: 0,
            copy_to_cpu: false,
            deflect_on_drop: false,
            color: 0,
            egress_queue: 0,
            cfg: ConfigSource::default(),
            priority: SessionPriority::Low,
            coal_mode: CoalMode::Native,
            sel_save: [0; MAX_PIPES],
            sel_save_valid: [false; MAX_PIPES],
        }
    }
}

/// Tofino3 per-session entry: the Tofino2 layout plus the 2-bit die
/// routing vector.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize,
    JsonSchema,
)]
pub struct Tofino3Entry {
    pub base: Tofino2Entry,
    /// Derived from `base.pipe_vec`: bit d set when any pipe on die d is
    /// selected.  Recomputed on every pipe-vector change, never set
    /// directly.
    pub die_vec: u8,
}

/// Compute the die vector for a pipe mask; pipes are partitioned into
/// dies of [`PIPES_PER_DIE`].
pub fn die_vec_for(pipe_vec: u8) -> u8 {
    let mut dv = 0;
    for die in 0..(MAX_PIPES as u8 / PIPES_PER_DIE) {
        let mask = ((1u16 << PIPES_PER_DIE) - 1) as u8;
        if pipe_vec >> (die * PIPES_PER_DIE) & mask != 0 {
            dv |= 1 << die;
        }
    }
    dv
}

/// The per-family hardware parameters, tagged by family.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub enum HwParams {
    Tofino1(Tofino1Meta),
    Tofino2(Tofino2Entry),
    Tofino3(Tofino3Entry),
}

impl HwParams {
    pub fn family(&self) -> DeviceFamily {
        match self {
            HwParams::Tofino1(_) => DeviceFamily::Tofino1,
            HwParams::Tofino2(_) => DeviceFamily::Tofino2,
            HwParams::Tofino3(_) => DeviceFamily::Tofino3,
        }
    }

    /// The Tofino2-shaped entry, present on Tofino2 and Tofino3 only.
    /// Every family B/C-only knob goes through here.
    pub fn entry(&self) -> Option<&Tofino2Entry> {
        match self {
            HwParams::Tofino1(_) => None,
            HwParams::Tofino2(e) => Some(e),
            HwParams::Tofino3(e) => Some(&e.base),
        }
    }

    pub fn entry_mut(&mut self) -> Option<&mut Tofino2Entry> {
        match self {
            HwParams::Tofino1(_) => None,
            HwParams::Tofino2(e) => Some(e),
            HwParams::Tofino3(e) => Some(&mut e.base),
        }
    }

    /// The multicast pipe vector, common to every family.
    pub fn pipe_vec(&self) -> u8 {
        match self {
            HwParams::Tofino1(m) => m.pipe_vec,
            HwParams::Tofino2(e) => e.pipe_vec,
            HwParams::Tofino3(e) => e.base.pipe_vec,
        }
    }

    /// Update the pipe vector, recomputing the Tofino3 die vector so the
    /// two can never disagree.
    pub fn set_pipe_vec(&mut self, pipe_vec: u8) {
        match self {
            HwParams::Tofino1(m) => m.pipe_vec = pipe_vec,
            HwParams::Tofino2(e) => e.pipe_vec = pipe_vec,
            HwParams::Tofino3(e) => {
                e.base.pipe_vec = pipe_vec;
                e.die_vec = die_vec_for(pipe_vec);
            }
        }
    }

    /// A zero-valued parameter block for the given family.
    pub fn zeroed(family: DeviceFamily) -> Self {
        match family {
            DeviceFamily::Tofino1 => {
                HwParams::Tofino1(Tofino1Meta::default())
            }
            DeviceFamily::Tofino2 => {
                HwParams::Tofino2(Tofino2Entry::default())
            }
            DeviceFamily::Tofino3 => {
                HwParams::Tofino3(Tofino3Entry::default())
            }
        }
    }
}

/// Everything the control plane knows about one mirror session.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub struct SessionRecord {
    pub mirror_type: MirrorType,
    pub direction: Direction,
    /// Truncation length for the mirrored copy, in bytes.
    pub max_packet_len: u16,
    /// User-defined prefix injected into coalesced packets.
    pub header: [u8; 16],
    /// Length of the prefix, in 32-bit words.
    pub header_len: u8,
    /// Coalescing flush timeout, in microseconds.
    pub timeout_usec: u32,
    /// Bytes sampled per coalesced slice.
    pub extract_len: u16,
    /// True when the extraction length comes from the P4 program rather
    /// than `extract_len`.
    pub extract_len_from_p4: bool,
    pub hw: HwParams,
}

impl SessionRecord {
    /// A disabled, zero-valued record for the given family.  Used both as
    /// a builder base and for the throwaway node the ECC path programs.
    pub fn zeroed(family: DeviceFamily) -> Self {
        SessionRecord {
            mirror_type: MirrorType::Normal,
            direction: Direction::None,
            max_packet_len: 0,
            header: [0; 16],
            header_len: 0,
            timeout_usec: 0,
            extract_len: 0,
            extract_len_from_p4: false,
            hw: HwParams::zeroed(family),
        }
    }
}

/// A stored session: the record plus the enable state the manager derived
/// for it.  Owned exclusively by the session store; callers get copies.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SessionNode {
    pub sid: SessionId,
    pub scope: PipeScope,
    pub enable_ingress: bool,
    pub enable_egress: bool,
    pub record: SessionRecord,
}

impl SessionNode {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.sid, self.scope)
    }
}

#[test]
fn test_scope_ordering() -> anyhow::Result<()> {
    // The store depends on All sorting ahead of any specific pipe.
    assert!(PipeScope::All < PipeScope::Pipe(0));
    assert!(PipeScope::Pipe(0) < PipeScope::Pipe(1));
    let a = SessionKey::new(4, PipeScope::Pipe(3));
    let b = SessionKey::new(5, PipeScope::All);
    assert!(a < b);
    Ok(())
}

// The record types are part of the API surface and must survive a trip
// through their serialized form.
#[test]
fn test_record_serde() -> anyhow::Result<()> {
    let mut record = SessionRecord::zeroed(ral::DeviceFamily::Tofino2);
    record.mirror_type = MirrorType::Coalescing;
    record.direction = Direction::Ingress;
    record.max_packet_len = 256;
    record.header = core::array::from_fn(|i| i as u8);
    record.header_len = 4;
    record.timeout_usec = 100;
    if let HwParams::Tofino2(e) = &mut record.hw {
        e.egress_port = 9;
        e.egress_port_valid = true;
        e.priority = SessionPriority::High;
    }

    let json = serde_json::to_string(&record)?;
    let parsed: SessionRecord = serde_json::from_str(&json)?;
    assert_eq!(parsed, record);
    Ok(())
}

#[test]
fn test_die_vec() -> anyhow::Result<()> {
    assert_eq!(die_vec_for(0b0000_0000), 0b00);
    assert_eq!(die_vec_for(0b0000_1010), 0b01);
    assert_eq!(die_vec_for(0b0011_0000), 0b10);
    assert_eq!(die_vec_for(0b1000_0001), 0b11);

    let mut hw = HwParams::zeroed(ral::DeviceFamily::Tofino3);
    hw.set_pipe_vec(0x31);
    let HwParams::Tofino3(e) = hw else { panic!("wrong variant") };
    assert_eq!(e.die_vec, 0b11);
    Ok(())
}
