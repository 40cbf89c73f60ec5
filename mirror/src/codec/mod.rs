// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Per-family register codecs.
//!
//! Each Tofino family lays its mirror-session state out differently:
//! word widths, bit positions, the presence of config-source flags, and
//! Tofino3's die routing all diverge.  A single shared encoder would
//! branch on the family as often as three separate ones, with the added
//! risk of cross-family bugs, so each family owns its encoding behind the
//! common [`FamilyCodec`] contract and the manager stays
//! family-agnostic.
//!
//! The codecs are stateless; the scarce coalescing slots they consume are
//! tracked by the session store.

use slog::Logger;

use crate::pipemap::PipeMap;
use crate::session::{
    MirrorType, SessionId, SessionNode, SessionRecord,
};
use ral::{
    DeviceFamily, DeviceInfo, PipeId, RalResult, RegisterIo,
};

pub(crate) mod tofino1;
pub(crate) mod tofino2;
pub(crate) mod tofino3;

/// One session's state as read back from hardware.
#[derive(Clone, Debug)]
pub(crate) struct HwSession {
    pub record: SessionRecord,
    pub enable_ingress: bool,
    pub enable_egress: bool,
    /// The coalescing slot the hardware says the session holds.  The
    /// reconciler compares this against the software assignment; a
    /// replayed session may be handed a different slot than the one it
    /// held before the restart.
    pub coal_slot: Option<u8>,
}

pub(crate) trait FamilyCodec: Send + Sync {
    fn family(&self) -> DeviceFamily;

    /// Lowest valid session id for the mirror type.  Id 0 is reserved on
    /// every family.
    fn base_sid(&self, mirror_type: MirrorType) -> SessionId;

    /// Highest valid session id for the mirror type.
    fn max_sid(&self, mirror_type: MirrorType) -> SessionId;

    /// Number of coalescing slots on the device.
    fn coal_slots(&self) -> u8;

    /// True when coalescing slots are assigned dynamically from a pool
    /// (Tofino2/3).  On Tofino1 a session's id within the coalescing
    /// range *is* its slot.
    fn dynamic_coal_slots(&self) -> bool;

    /// Tofino1 only: whether this id falls in the coalescing range.  The
    /// range is an address convention, not a stored flag.
    fn sid_is_coalescing(&self, sid: SessionId) -> bool;

    /// Width of the ingress-CoS and copy-to-CPU-CoS fields.
    fn cos_bits(&self) -> u8;

    /// Width of the egress queue field.
    fn queue_bits(&self) -> u8;

    /// Width of the egress port field; the pipe lives in the bits above
    /// the 7-bit local port.
    fn port_bits(&self) -> u8;

    /// Zero every session slot and program the fixed global parameters.
    /// The manager skips this entirely when the device is locked or a
    /// hitless warm init is in progress.
    fn init(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        log: &Logger,
    ) -> RalResult<()>;

    /// Zero exactly one session's hardware slot on the selected pipes.
    fn init_one(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        sid: SessionId,
        pipes: &PipeMap,
    ) -> RalResult<()>;

    /// Write the non-coalescing session state on the selected pipes.
    /// `slot` carries the dynamically assigned coalescing slot on
    /// Tofino2/3; the node is mutable only so those families can stage
    /// the deparser-selector save area through it during the
    /// drain-and-reprogram path.
    fn program(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        log: &Logger,
        node: &mut SessionNode,
        slot: Option<u8>,
        pipes: &PipeMap,
    ) -> RalResult<()>;

    /// Write the coalescing-specific registers for one slot on the
    /// selected pipes.
    fn program_coal(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        slot: u8,
        record: &SessionRecord,
        enable: bool,
        pipes: &PipeMap,
    ) -> RalResult<()>;

    /// Read one session back from one pipe.  Returns `None` when every
    /// read-back word is zero, meaning nothing was ever programmed there.
    fn read(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        sid: SessionId,
        pipe: PipeId,
    ) -> RalResult<Option<HwSession>>;

    /// Field-by-field comparison used by the ECC and warm-restart paths.
    /// Transient state (deparser-selector save areas) and fields the
    /// family cannot represent exactly (quantized timeouts, Tofino1's
    /// derived header byte) are normalized before comparing.
    fn fields_match(&self, a: &SessionRecord, b: &SessionRecord) -> bool;
}

// Field widths shared by every family's layout; the manager validates
// against these before any encode runs.

/// Widest level-2 multicast exclusion id (9 bits).
pub(crate) const MAX_L2_XID: u16 = 0x1ff;

/// Largest truncation length whose FCS-corrected form still fits the
/// 14-bit register field.
pub(crate) const MAX_TRUNC_LEN: u16 = 0x3ff0;

/// Largest per-slice extraction length (11 bits).
pub(crate) const MAX_EXTRACT_LEN: u16 = 0x7ff;

/// The user header is at most four 32-bit words.
pub(crate) const MAX_HEADER_WORDS: u8 = 4;

/// The codec for a device family.
pub(crate) fn for_family(family: DeviceFamily) -> &'static dyn FamilyCodec {
    match family {
        DeviceFamily::Tofino1 => &tofino1::Tofino1Codec,
        DeviceFamily::Tofino2 => &tofino2::Tofino2Codec,
        DeviceFamily::Tofino3 => &tofino3::Tofino3Codec,
    }
}

// Field packing helpers shared by the family encoders.  `lo` is the bit
// position of the field's LSB, `width` its size in bits.

pub(super) fn pack(word: &mut u32, lo: u32, width: u32, val: u32) {
    debug_assert!(width == 32 || val < (1 << width));
    let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
    *word = (*word & !(mask << lo)) | ((val & mask) << lo);
}

pub(super) fn pack_bit(word: &mut u32, pos: u32, val: bool) {
    pack(word, pos, 1, val as u32);
}

pub(super) fn unpack(word: u32, lo: u32, width: u32) -> u32 {
    let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
    (word >> lo) & mask
}

pub(super) fn unpack_bit(word: u32, pos: u32) -> bool {
    unpack(word, pos, 1) != 0
}

/// Convert a flush timeout to hardware ticks, rounding up so a short
/// timeout never becomes "never".
pub(super) fn usec_to_ticks(usec: u32, base_tick_us: u32) -> u32 {
    usec.div_ceil(base_tick_us)
}

/// The timeout a tick count represents.  `usec_to_ticks` followed by this
/// quantizes a timeout to the family's granularity.
pub(super) fn ticks_to_usec(ticks: u32, base_tick_us: u32) -> u32 {
    ticks.saturating_mul(base_tick_us)
}

/// The coalescing hardware consumes the user header back to front, so the
/// bytes are reversed into slice order before packing.
pub(super) fn header_words(header: &[u8; 16]) -> [u32; 4] {
    let mut rev = *header;
    rev.reverse();
    let mut words = [0u32; 4];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_le_bytes(rev[4 * i..4 * i + 4].try_into().unwrap());
    }
    words
}

pub(super) fn header_from_words(words: &[u32; 4]) -> [u8; 16] {
    let mut rev = [0u8; 16];
    for (i, w) in words.iter().enumerate() {
        rev[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
    }
    rev.reverse();
    rev
}

/// Buffering thresholds for a coalescing session, derived from the
/// truncation length and the family's buffer cell size: enough cells for
/// one truncated copy plus two cells of slack before new samples are
/// dropped, and the truncation length itself as the minimum emit size.
pub(super) fn coal_thresholds(
    max_packet_len: u16,
    cell_bytes: u32,
) -> (u32, u32) {
    let cells = (max_packet_len as u32).div_ceil(cell_bytes);
    (cells + 2, max_packet_len as u32)
}

/// The truncation field carries the mirrored copy's FCS, so a configured
/// length is written 4 bytes larger.  Zero means "no truncation" and is
/// written through unchanged.
pub(super) fn trunc_encode(max_packet_len: u16) -> u32 {
    match max_packet_len {
        0 => 0,
        len => len as u32 + 4,
    }
}

pub(super) fn trunc_decode(field: u32) -> u16 {
    match field {
        0 => 0,
        len => (len - 4) as u16,
    }
}

#[test]
fn test_pack_unpack() -> anyhow::Result<()> {
    let mut w = 0u32;
    pack(&mut w, 3, 4, 0xb);
    pack_bit(&mut w, 0, true);
    assert_eq!(w, 0x59);
    assert_eq!(unpack(w, 3, 4), 0xb);
    assert!(unpack_bit(w, 0));
    assert!(!unpack_bit(w, 1));

    // Overwriting a field clears its old bits.
    pack(&mut w, 3, 4, 0x2);
    assert_eq!(unpack(w, 3, 4), 0x2);

    pack(&mut w, 0, 32, 0xdead_beef);
    assert_eq!(unpack(w, 0, 32), 0xdead_beef);
    Ok(())
}

#[test]
fn test_tick_conversion() -> anyhow::Result<()> {
    // Round up, never down: a 150us timeout on a 100us tick is 2 ticks.
    assert_eq!(usec_to_ticks(150, 100), 2);
    assert_eq!(usec_to_ticks(200, 100), 2);
    assert_eq!(usec_to_ticks(1, 100), 1);
    assert_eq!(usec_to_ticks(0, 100), 0);
    assert_eq!(ticks_to_usec(2, 100), 200);
    Ok(())
}

#[test]
fn test_header_reversal() -> anyhow::Result<()> {
    let header: [u8; 16] = core::array::from_fn(|i| i as u8);
    let words = header_words(&header);
    // The last user byte leads the packed form.
    assert_eq!(words[0] & 0xff, 15);
    assert_eq!(header_from_words(&words), header);
    Ok(())
}

#[test]
fn test_trunc_fcs_correction() -> anyhow::Result<()> {
    assert_eq!(trunc_encode(128), 132);
    assert_eq!(trunc_decode(132), 128);
    // Zero is "no truncation", not a 4-byte cap.
    assert_eq!(trunc_encode(0), 0);
    assert_eq!(trunc_decode(0), 0);
    Ok(())
}
