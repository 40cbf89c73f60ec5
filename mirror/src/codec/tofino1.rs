// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Tofino1 mirror-session encoding.
//!
//! Session state is six words per session per pipe.  Coalescing state is
//! seven words per slot; the eight slots are bound to session ids
//! 1016..=1023 by address convention, so a session's id within that range
//! *is* its slot number.
//!
//! Word layout:
//!
//! ```text
//! CTRL  [0] ingress  [1] egress  [2] coalescing  [3] deflect-on-drop
//!       [4] copy-to-cpu  [5:2] color  [7:3] icos  [10:5] queue
//!       [16:14] truncation (+FCS)  [30:2] direction
//! EPORT [0:9] egress port  [15] valid
//! MCA   [0:16] mcast group a  [16] valid
//! MCB   [0:16] mcast group b  [16] valid
//! XID   [0:16] level-1 exclusion  [16:9] level-2 exclusion
//! RID   [0:16] replication id  [16:4] pipe vector  [20:3] c2c cos
//!
//! CCTRL [0] enable  [1] extract-from-p4  [2:11] extract length
//!       [13:3] header words
//! CTMO  [0:32] flush timeout, ticks
//! CHDR0..CHDR3  user header, byte-reversed; CHDR3's top byte is
//!       rewritten by hardware convention (see below)
//! CTHR  [0:14] min emit length  [16:12] drop threshold, cells
//! ```

use slog::{info, Logger};

use crate::codec::{
    coal_thresholds, header_from_words, header_words, pack, pack_bit,
    ticks_to_usec, trunc_decode, trunc_encode, unpack, unpack_bit,
    usec_to_ticks, FamilyCodec, HwSession,
};
use crate::pipemap::PipeMap;
use crate::session::{
    Direction, HwParams, MirrorType, SessionId, SessionNode, SessionRecord,
    Tofino1Meta,
};
use ral::{
    DeviceFamily, DeviceInfo, PipeId, RalError, RalResult, RegAddr,
    RegWrite, RegisterIo,
};

const MAX_NORMAL_SID: SessionId = 1015;
const COAL_BASE_SID: SessionId = 1016;
const COAL_MAX_SID: SessionId = 1023;
const COAL_SLOTS: u8 = 8;

// The negative-mirror path borrows the last normal session id.
const NEG_MIRROR_SID: u32 = 1015;

const BASE_TICK_US: u32 = 100;
const CELL_BYTES: u32 = 80;
const TRUNC_WATERMARK: u32 = 0x2800;

const GLB_TRUNC_WM: RegAddr = 0x0000_0010;
const GLB_BASE_TICK: RegAddr = 0x0000_0014;
const GLB_NEG_SID: RegAddr = 0x0000_0018;
const GLB_PKT_SANITY: RegAddr = 0x0000_001c;

const SESS_BASE: RegAddr = 0x0100_0000;
const SESS_STRIDE: u32 = 0x40;
const SESS_WORDS: usize = 6;

const COAL_BASE: RegAddr = 0x0180_0000;
const COAL_STRIDE: u32 = 0x20;
const COAL_WORDS: usize = 7;

fn sess_addr(sid: SessionId, word: usize) -> RegAddr {
    SESS_BASE + sid as u32 * SESS_STRIDE + 4 * word as u32
}

fn coal_addr(slot: u8, word: usize) -> RegAddr {
    COAL_BASE + slot as u32 * COAL_STRIDE + 4 * word as u32
}

fn direction_code(dir: Direction) -> u32 {
    match dir {
        Direction::None => 0,
        Direction::Ingress => 1,
        Direction::Egress => 2,
        Direction::Both => 3,
    }
}

fn direction_decode(code: u32) -> Direction {
    match code {
        1 => Direction::Ingress,
        2 => Direction::Egress,
        3 => Direction::Both,
        _ => Direction::None,
    }
}

fn encode(node: &SessionNode, meta: &Tofino1Meta) -> [u32; SESS_WORDS] {
    let r = &node.record;
    let mut w = [0u32; SESS_WORDS];

    pack_bit(&mut w[0], 0, node.enable_ingress);
    pack_bit(&mut w[0], 1, node.enable_egress);
    pack_bit(&mut w[0], 2, r.mirror_type == MirrorType::Coalescing);
    pack_bit(&mut w[0], 3, meta.deflect_on_drop);
    pack_bit(&mut w[0], 4, meta.copy_to_cpu);
    pack(&mut w[0], 5, 2, meta.color as u32);
    pack(&mut w[0], 7, 3, meta.icos as u32);
    pack(&mut w[0], 10, 5, meta.egress_queue as u32);
    pack(&mut w[0], 16, 14, trunc_encode(r.max_packet_len));
    pack(&mut w[0], 30, 2, direction_code(r.direction));

    pack(&mut w[1], 0, 9, meta.egress_port as u32);
    pack_bit(&mut w[1], 15, meta.egress_port_valid);

    pack(&mut w[2], 0, 16, meta.mcast_grp_a as u32);
    pack_bit(&mut w[2], 16, meta.mcast_grp_a_valid);
    pack(&mut w[3], 0, 16, meta.mcast_grp_b as u32);
    pack_bit(&mut w[3], 16, meta.mcast_grp_b_valid);

    pack(&mut w[4], 0, 16, meta.mcast_l1_xid as u32);
    pack(&mut w[4], 16, 9, meta.mcast_l2_xid as u32);

    pack(&mut w[5], 0, 16, meta.mcast_rid as u32);
    pack(&mut w[5], 16, 4, meta.pipe_vec as u32);
    pack(&mut w[5], 20, 3, meta.copy_to_cpu_cos as u32);

    w
}

fn decode(sid: SessionId, w: &[u32; SESS_WORDS]) -> HwSession {
    let meta = Tofino1Meta {
        egress_port: unpack(w[1], 0, 9) as u16,
        egress_port_valid: unpack_bit(w[1], 15),
        pipe_vec: unpack(w[5], 16, 4) as u8,
        mcast_grp_a: unpack(w[2], 0, 16) as u16,
        mcast_grp_a_valid: unpack_bit(w[2], 16),
        mcast_grp_b: unpack(w[3], 0, 16) as u16,
        mcast_grp_b_valid: unpack_bit(w[3], 16),
        mcast_l1_xid: unpack(w[4], 0, 16) as u16,
        mcast_l2_xid: unpack(w[4], 16, 9) as u16,
        mcast_rid: unpack(w[5], 0, 16) as u16,
        icos: unpack(w[0], 7, 3) as u8,
        copy_to_cpu_cos: unpack(w[5], 20, 3) as u8,
        copy_to_cpu: unpack_bit(w[0], 4),
        deflect_on_drop: unpack_bit(w[0], 3),
        color: unpack(w[0], 5, 2) as u8,
        egress_queue: unpack(w[0], 10, 5) as u8,
    };

    let mut record = SessionRecord::zeroed(DeviceFamily::Tofino1);
    record.mirror_type = if sid >= COAL_BASE_SID {
        MirrorType::Coalescing
    } else {
        MirrorType::Normal
    };
    record.direction = direction_decode(unpack(w[0], 30, 2));
    record.max_packet_len = trunc_decode(unpack(w[0], 16, 14));
    record.hw = HwParams::Tofino1(meta);

    HwSession {
        record,
        enable_ingress: unpack_bit(w[0], 0),
        enable_egress: unpack_bit(w[0], 1),
        coal_slot: (sid >= COAL_BASE_SID)
            .then(|| (sid - COAL_BASE_SID) as u8),
    }
}

/// The byte the hardware rewrites in the packed header: the sample-count
/// position, seeded with the header length and the coalesced-format
/// version nibble.  The user's header byte 0 lands here after reversal
/// and is lost; readback cannot recover it.
fn derived_header_byte(header_len: u8) -> u32 {
    ((header_len as u32) << 4) | 0x5
}

fn encode_coal(record: &SessionRecord, enable: bool) -> [u32; COAL_WORDS] {
    let mut w = [0u32; COAL_WORDS];

    pack_bit(&mut w[0], 0, enable);
    pack_bit(&mut w[0], 1, record.extract_len_from_p4);
    pack(&mut w[0], 2, 11, record.extract_len as u32);
    pack(&mut w[0], 13, 3, record.header_len as u32);

    w[1] = usec_to_ticks(record.timeout_usec, BASE_TICK_US);

    let hdr = header_words(&record.header);
    w[2..6].copy_from_slice(&hdr);
    // Hardware owns the top byte of the last header word.
    pack(&mut w[5], 24, 8, derived_header_byte(record.header_len));

    let (drop_cells, min_len) =
        coal_thresholds(record.max_packet_len, CELL_BYTES);
    pack(&mut w[6], 0, 14, min_len);
    pack(&mut w[6], 16, 12, drop_cells);

    w
}

fn decode_coal(record: &mut SessionRecord, w: &[u32; COAL_WORDS]) {
    record.extract_len_from_p4 = unpack_bit(w[0], 1);
    record.extract_len = unpack(w[0], 2, 11) as u16;
    record.header_len = unpack(w[0], 13, 3) as u8;
    record.timeout_usec = ticks_to_usec(w[1], BASE_TICK_US);
    let hdr: [u32; 4] = w[2..6].try_into().unwrap();
    record.header = header_from_words(&hdr);
}

fn meta_of(record: &SessionRecord) -> RalResult<Tofino1Meta> {
    match record.hw {
        HwParams::Tofino1(meta) => Ok(meta),
        _ => Err(RalError::InvalidArg(
            "record does not carry Tofino1 parameters".to_string(),
        )),
    }
}

pub(crate) struct Tofino1Codec;

impl FamilyCodec for Tofino1Codec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Tofino1
    }

    fn base_sid(&self, mirror_type: MirrorType) -> SessionId {
        match mirror_type {
            MirrorType::Normal => 1,
            MirrorType::Coalescing => COAL_BASE_SID,
        }
    }

    fn max_sid(&self, mirror_type: MirrorType) -> SessionId {
        match mirror_type {
            MirrorType::Normal => MAX_NORMAL_SID,
            MirrorType::Coalescing => COAL_MAX_SID,
        }
    }

    fn coal_slots(&self) -> u8 {
        COAL_SLOTS
    }

    fn dynamic_coal_slots(&self) -> bool {
        false
    }

    fn sid_is_coalescing(&self, sid: SessionId) -> bool {
        (COAL_BASE_SID..=COAL_MAX_SID).contains(&sid)
    }

    fn cos_bits(&self) -> u8 {
        3
    }

    fn queue_bits(&self) -> u8 {
        5
    }

    fn port_bits(&self) -> u8 {
        9
    }

    fn init(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        log: &Logger,
    ) -> RalResult<()> {
        info!(log, "initializing tofino1 mirror tables");
        let mut writes = Vec::new();
        for pipe in 0..dev.num_pipes() {
            let phys = dev.log_to_phys(pipe)?;
            writes.push(RegWrite {
                pipe: phys,
                addr: GLB_TRUNC_WM,
                val: TRUNC_WATERMARK,
            });
            writes.push(RegWrite {
                pipe: phys,
                addr: GLB_BASE_TICK,
                val: BASE_TICK_US,
            });
            writes.push(RegWrite {
                pipe: phys,
                addr: GLB_NEG_SID,
                val: NEG_MIRROR_SID,
            });
            writes.push(RegWrite {
                pipe: phys,
                addr: GLB_PKT_SANITY,
                val: 0,
            });
            for sid in 1..=COAL_MAX_SID {
                for word in 0..SESS_WORDS {
                    writes.push(RegWrite {
                        pipe: phys,
                        addr: sess_addr(sid, word),
                        val: 0,
                    });
                }
            }
            for slot in 0..COAL_SLOTS {
                for word in 0..COAL_WORDS {
                    writes.push(RegWrite {
                        pipe: phys,
                        addr: coal_addr(slot, word),
                        val: 0,
                    });
                }
            }
        }
        io.write_batch(&writes)
    }

    fn init_one(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        sid: SessionId,
        pipes: &PipeMap,
    ) -> RalResult<()> {
        let mut writes = Vec::new();
        for pipe in pipes.iter() {
            let phys = dev.log_to_phys(pipe as PipeId)?;
            for word in 0..SESS_WORDS {
                writes.push(RegWrite {
                    pipe: phys,
                    addr: sess_addr(sid, word),
                    val: 0,
                });
            }
            if self.sid_is_coalescing(sid) {
                let slot = (sid - COAL_BASE_SID) as u8;
                for word in 0..COAL_WORDS {
                    writes.push(RegWrite {
                        pipe: phys,
                        addr: coal_addr(slot, word),
                        val: 0,
                    });
                }
            }
        }
        io.write_batch(&writes)
    }

    fn program(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        _log: &Logger,
        node: &mut SessionNode,
        _slot: Option<u8>,
        pipes: &PipeMap,
    ) -> RalResult<()> {
        let meta = meta_of(&node.record)?;
        let words = encode(node, &meta);
        let mut writes = Vec::new();
        for pipe in pipes.iter() {
            let phys = dev.log_to_phys(pipe as PipeId)?;
            for (word, val) in words.iter().enumerate() {
                writes.push(RegWrite {
                    pipe: phys,
                    addr: sess_addr(node.sid, word),
                    val: *val,
                });
            }
        }
        io.write_batch(&writes)
    }

    fn program_coal(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        slot: u8,
        record: &SessionRecord,
        enable: bool,
        pipes: &PipeMap,
    ) -> RalResult<()> {
        let words = encode_coal(record, enable);
        let mut writes = Vec::new();
        for pipe in pipes.iter() {
            let phys = dev.log_to_phys(pipe as PipeId)?;
            for (word, val) in words.iter().enumerate() {
                writes.push(RegWrite {
                    pipe: phys,
                    addr: coal_addr(slot, word),
                    val: *val,
                });
            }
        }
        io.write_batch(&writes)
    }

    fn read(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        sid: SessionId,
        pipe: PipeId,
    ) -> RalResult<Option<HwSession>> {
        let phys = dev.log_to_phys(pipe)?;

        let mut sess = [0u32; SESS_WORDS];
        for (word, val) in sess.iter_mut().enumerate() {
            *val = io.read(phys, sess_addr(sid, word))?;
        }
        let mut coal = [0u32; COAL_WORDS];
        if self.sid_is_coalescing(sid) {
            let slot = (sid - COAL_BASE_SID) as u8;
            for (word, val) in coal.iter_mut().enumerate() {
                *val = io.read(phys, coal_addr(slot, word))?;
            }
        }

        if sess.iter().all(|w| *w == 0) && coal.iter().all(|w| *w == 0) {
            return Ok(None);
        }

        let mut hw = decode(sid, &sess);
        if self.sid_is_coalescing(sid) {
            decode_coal(&mut hw.record, &coal);
        }
        Ok(Some(hw))
    }

    fn fields_match(&self, a: &SessionRecord, b: &SessionRecord) -> bool {
        normalize(a) == normalize(b)
    }
}

// Comparison form of a record: the timeout quantized to the tick, and
// the derived header byte masked out.
fn normalize(r: &SessionRecord) -> SessionRecord {
    let mut n = *r;
    n.timeout_usec = ticks_to_usec(
        usec_to_ticks(n.timeout_usec, BASE_TICK_US),
        BASE_TICK_US,
    );
    n.header[0] = 0;
    n
}

#[cfg(test)]
mod test {
    use super::*;
    use ral::fake::FakeIo;

    fn test_setup() -> (Logger, DeviceInfo, FakeIo) {
        let log = common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap();
        let dev = DeviceInfo::new(0, DeviceFamily::Tofino1, 4);
        let io = FakeIo::new(log.clone());
        (log, dev, io)
    }

    fn sample_meta() -> Tofino1Meta {
        Tofino1Meta {
            egress_port: 0x1a3,
            egress_port_valid: true,
            pipe_vec: 0b1010,
            mcast_grp_a: 0x1234,
            mcast_grp_a_valid: true,
            mcast_grp_b: 0x4321,
            mcast_grp_b_valid: false,
            mcast_l1_xid: 0xbeef,
            mcast_l2_xid: 0x1ab,
            mcast_rid: 0x77,
            icos: 5,
            copy_to_cpu_cos: 3,
            copy_to_cpu: true,
            deflect_on_drop: true,
            color: 2,
            egress_queue: 19,
        }
    }

    fn sample_node(sid: SessionId, mt: MirrorType) -> SessionNode {
        let mut record = SessionRecord::zeroed(DeviceFamily::Tofino1);
        record.mirror_type = mt;
        record.direction = Direction::Both;
        record.max_packet_len = 256;
        record.hw = HwParams::Tofino1(sample_meta());
        if mt == MirrorType::Coalescing {
            record.header = core::array::from_fn(|i| 0x40 + i as u8);
            record.header_len = 4;
            record.timeout_usec = 500;
            record.extract_len = 96;
        }
        SessionNode {
            sid,
            scope: crate::session::PipeScope::All,
            enable_ingress: true,
            enable_egress: true,
            record,
        }
    }

    #[test]
    fn test_roundtrip_normal() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino1Codec;
        let mut node = sample_node(12, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set_all();

        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        let hw = codec.read(&io, &dev, 12, 2)?.unwrap();
        assert!(hw.enable_ingress);
        assert!(hw.enable_egress);
        assert!(codec.fields_match(&hw.record, &node.record));
        assert_eq!(hw.record.max_packet_len, 256);
        assert_eq!(hw.record.hw, node.record.hw);
        Ok(())
    }

    #[test]
    fn test_roundtrip_coalescing() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino1Codec;
        let mut node = sample_node(1018, MirrorType::Coalescing);
        let mut pipes = PipeMap::new(4);
        pipes.set(0);

        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        codec.program_coal(&io, &dev, 2, &node.record, true, &pipes)?;
        let hw = codec.read(&io, &dev, 1018, 0)?.unwrap();
        assert_eq!(hw.record.mirror_type, MirrorType::Coalescing);
        assert!(codec.fields_match(&hw.record, &node.record));
        // The timeout was quantized up to the next 100us tick.
        assert_eq!(hw.record.timeout_usec, 500);
        assert_eq!(hw.record.extract_len, 96);
        Ok(())
    }

    // Byte 0 of the user header is rewritten by hardware convention and
    // cannot round-trip; every other byte must.
    #[test]
    fn test_header_byte0_lossy() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino1Codec;
        let mut node = sample_node(1016, MirrorType::Coalescing);
        node.record.header[0] = 0xaa;
        let mut pipes = PipeMap::new(4);
        pipes.set(0);

        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        codec.program_coal(&io, &dev, 0, &node.record, true, &pipes)?;
        let hw = codec.read(&io, &dev, 1016, 0)?.unwrap();
        assert_ne!(hw.record.header[0], 0xaa);
        assert_eq!(hw.record.header[1..], node.record.header[1..]);
        assert!(codec.fields_match(&hw.record, &node.record));
        Ok(())
    }

    #[test]
    fn test_unprogrammed_reads_invalid() -> anyhow::Result<()> {
        let (_log, dev, io) = test_setup();
        let codec = Tofino1Codec;
        assert!(codec.read(&io, &dev, 55, 1)?.is_none());
        Ok(())
    }

    #[test]
    fn test_init_zeroes_programmed_state() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino1Codec;
        let mut node = sample_node(9, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set_all();
        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;

        codec.init_one(&io, &dev, 9, &pipes)?;
        assert!(codec.read(&io, &dev, 9, 0)?.is_none());
        Ok(())
    }

    #[test]
    fn test_sid_ranges() -> anyhow::Result<()> {
        let codec = Tofino1Codec;
        assert!(!codec.sid_is_coalescing(1015));
        assert!(codec.sid_is_coalescing(1016));
        assert!(codec.sid_is_coalescing(1023));
        assert_eq!(codec.max_sid(MirrorType::Normal), 1015);
        assert_eq!(codec.base_sid(MirrorType::Coalescing), 1016);
        Ok(())
    }
}
