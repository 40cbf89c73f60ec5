// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Tofino2 mirror-session encoding.
//!
//! Session state is seven words per session per pipe; the sixteen
//! coalescing slots are a shared pool, with a session's assigned slot
//! recorded in its RID word.  Unlike Tofino1, the deparser cannot swap a
//! live session's routing fields atomically: outside fast-reconfig
//! windows the mirror-select path must be disabled, the slice buffers
//! drained, and the session reprogrammed through direct register access
//! before the selector is restored.
//!
//! Word layout:
//!
//! ```text
//! CTRL  [0] ingress  [1] egress  [2] coalescing  [3] deflect-on-drop
//!       [4] copy-to-cpu  [5:2] color  [7:3] icos  [10:7] queue
//!       [17:14] truncation (+FCS)
//! EPORT [0:10] egress port  [15] valid  [16:8] pipe vector
//! MCA   [0:16] mcast group a  [16] valid
//! MCB   [0:16] mcast group b  [16] valid
//! XID   [0:16] level-1 exclusion  [16:9] level-2 exclusion
//! RID   [0:16] replication id  [16:3] c2c cos  [19] high priority
//!       [20] native coalescing  [21:5] slot + 1 (0 = none)
//! CFG   [0] hash  [1] icos  [2] dod  [3] c2c  [4] mc  [5] epipe
//!       [8:2] direction
//!
//! CCTRL/CTMO/CHDR0-3/CTHR as on Tofino1, without the rewritten header
//! byte.  DPRSR_SEL and DPRSR_USAGE are per-pipe deparser state used by
//! the drain workaround.
//! ```

use slog::{info, warn, Logger};

use crate::codec::{
    coal_thresholds, header_from_words, header_words, pack, pack_bit,
    ticks_to_usec, trunc_decode, trunc_encode, unpack, unpack_bit,
    usec_to_ticks, FamilyCodec, HwSession,
};
use crate::pipemap::PipeMap;
use crate::session::{
    CoalMode, Direction, HwParams, MirrorType, SessionId, SessionNode,
    SessionPriority, SessionRecord, Tofino2Entry,
};
use ral::{
    DeviceFamily, DeviceInfo, PipeId, RalError, RalResult, RegAddr,
    RegWrite, RegisterIo,
};

const MAX_SID: SessionId = 255;
const COAL_SLOTS: u8 = 16;
const NEG_MIRROR_SID: u32 = 255;

const BASE_TICK_US: u32 = 50;
const CELL_BYTES: u32 = 176;
const TRUNC_WATERMARK: u32 = 0x3000;

const GLB_TRUNC_WM: RegAddr = 0x0000_0010;
const GLB_BASE_TICK: RegAddr = 0x0000_0014;
const GLB_NEG_SID: RegAddr = 0x0000_0018;
const GLB_PKT_SANITY: RegAddr = 0x0000_001c;

const SESS_BASE: RegAddr = 0x0200_0000;
const SESS_STRIDE: u32 = 0x80;
const SESS_WORDS: usize = 7;

const COAL_BASE: RegAddr = 0x0280_0000;
const COAL_STRIDE: u32 = 0x40;
const COAL_WORDS: usize = 7;

// Per-pipe deparser mirror-select path and slice buffer usage counter.
const DPRSR_SEL: RegAddr = 0x0040_0000;
const DPRSR_USAGE: RegAddr = 0x0040_0004;
const SEL_MIRROR_EN: u32 = 1 << 0;

// Retry budget for the buffer drain.  Exhausting it is logged, not
// failed: stale buffered copies are cosmetic, an unreliable reconfig
// path is not.
const DRAIN_POLL_LIMIT: u32 = 200;

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

pub(super) fn encode_entry(
    node: &SessionNode,
    entry: &Tofino2Entry,
    slot: Option<u8>,
) -> [u32; SESS_WORDS] {
    let r = &node.record;
    let mut w = [0u32; SESS_WORDS];

    pack_bit(&mut w[0], 0, node.enable_ingress);
    pack_bit(&mut w[0], 1, node.enable_egress);
    pack_bit(&mut w[0], 2, r.mirror_type == MirrorType::Coalescing);
    pack_bit(&mut w[0], 3, entry.deflect_on_drop);
    pack_bit(&mut w[0], 4, entry.copy_to_cpu);
    pack(&mut w[0], 5, 2, entry.color as u32);
    pack(&mut w[0], 7, 3, entry.icos as u32);
    pack(&mut w[0], 10, 7, entry.egress_queue as u32);
    pack(&mut w[0], 17, 14, trunc_encode(r.max_packet_len));

    pack(&mut w[1], 0, 10, entry.egress_port as u32);
    pack_bit(&mut w[1], 15, entry.egress_port_valid);
    pack(&mut w[1], 16, 8, entry.pipe_vec as u32);

    pack(&mut w[2], 0, 16, entry.mcast_grp_a as u32);
    pack_bit(&mut w[2], 16, entry.mcast_grp_a_valid);
    pack(&mut w[3], 0, 16, entry.mcast_grp_b as u32);
    pack_bit(&mut w[3], 16, entry.mcast_grp_b_valid);

    pack(&mut w[4], 0, 16, entry.mcast_l1_xid as u32);
    pack(&mut w[4], 16, 9, entry.mcast_l2_xid as u32);

    pack(&mut w[5], 0, 16, entry.mcast_rid as u32);
    pack(&mut w[5], 16, 3, entry.copy_to_cpu_cos as u32);
    pack_bit(&mut w[5], 19, entry.priority == SessionPriority::High);
    pack_bit(&mut w[5], 20, entry.coal_mode == CoalMode::Native);
    pack(&mut w[5], 21, 5, slot.map(|s| s as u32 + 1).unwrap_or(0));

    pack_bit(&mut w[6], 0, entry.cfg.hash_cfg);
    pack_bit(&mut w[6], 1, entry.cfg.icos_cfg);
    pack_bit(&mut w[6], 2, entry.cfg.dod_cfg);
    pack_bit(&mut w[6], 3, entry.cfg.copy_to_cpu_cfg);
    pack_bit(&mut w[6], 4, entry.cfg.mc_cfg);
    pack_bit(&mut w[6], 5, entry.cfg.epipe_cfg);
    pack(&mut w[6], 8, 2, direction_code(r.direction));

    w
}

pub(super) fn decode_entry(
    w: &[u32; SESS_WORDS],
) -> (Tofino2Entry, MirrorType, Direction, u16, bool, bool, Option<u8>) {
    let entry = Tofino2Entry {
        egress_port: unpack(w[1], 0, 10) as u16,
        egress_port_valid: unpack_bit(w[1], 15),
        pipe_vec: unpack(w[1], 16, 8) as u8,
        mcast_grp_a: unpack(w[2], 0, 16) as u16,
        mcast_grp_a_valid: unpack_bit(w[2], 16),
        mcast_grp_b: unpack(w[3], 0, 16) as u16,
        mcast_grp_b_valid: unpack_bit(w[3], 16),
        mcast_l1_xid: unpack(w[4], 0, 16) as u16,
        mcast_l2_xid: unpack(w[4], 16, 9) as u16,
        mcast_rid: unpack(w[5], 0, 16) as u16,
        icos: unpack(w[0], 7, 3) as u8,
        copy_to_cpu_cos: unpack(w[5], 16, 3) as u8,
        copy_to_cpu: unpack_bit(w[0], 4),
        deflect_on_drop: unpack_bit(w[0], 3),
        color: unpack(w[0], 5, 2) as u8,
        egress_queue: unpack(w[0], 10, 7) as u8,
        cfg: crate::session::ConfigSource {
            hash_cfg: unpack_bit(w[6], 0),
            icos_cfg: unpack_bit(w[6], 1),
            dod_cfg: unpack_bit(w[6], 2),
            copy_to_cpu_cfg: unpack_bit(w[6], 3),
            mc_cfg: unpack_bit(w[6], 4),
            epipe_cfg: unpack_bit(w[6], 5),
        },
        priority: if unpack_bit(w[5], 19) {
            SessionPriority::High
        } else {
            SessionPriority::Low
        },
        coal_mode: if unpack_bit(w[5], 20) {
            CoalMode::Native
        } else {
            CoalMode::Legacy
        },
        sel_save: Default::default(),
        sel_save_valid: Default::default(),
    };

    let mirror_type = if unpack_bit(w[0], 2) {
        MirrorType::Coalescing
    } else {
        MirrorType::Normal
    };
    let slot = match unpack(w[5], 21, 5) {
        0 => None,
        s => Some((s - 1) as u8),
    };

    (
        entry,
        mirror_type,
        direction_decode(unpack(w[6], 8, 2)),
        trunc_decode(unpack(w[0], 17, 14)),
        unpack_bit(w[0], 0),
        unpack_bit(w[0], 1),
        slot,
    )
}

pub(super) fn encode_coal(
    record: &SessionRecord,
    enable: bool,
    base_tick_us: u32,
    cell_bytes: u32,
) -> [u32; COAL_WORDS] {
    let mut w = [0u32; COAL_WORDS];

    pack_bit(&mut w[0], 0, enable);
    pack_bit(&mut w[0], 1, record.extract_len_from_p4);
    pack(&mut w[0], 2, 11, record.extract_len as u32);
    pack(&mut w[0], 13, 3, record.header_len as u32);

    w[1] = usec_to_ticks(record.timeout_usec, base_tick_us);
    w[2..6].copy_from_slice(&header_words(&record.header));

    let (drop_cells, min_len) =
        coal_thresholds(record.max_packet_len, cell_bytes);
    pack(&mut w[6], 0, 14, min_len);
    pack(&mut w[6], 16, 12, drop_cells);

    w
}

pub(super) fn decode_coal(
    record: &mut SessionRecord,
    w: &[u32; COAL_WORDS],
    base_tick_us: u32,
) {
    record.extract_len_from_p4 = unpack_bit(w[0], 1);
    record.extract_len = unpack(w[0], 2, 11) as u16;
    record.header_len = unpack(w[0], 13, 3) as u8;
    record.timeout_usec = ticks_to_usec(w[1], base_tick_us);
    let hdr: [u32; 4] = w[2..6].try_into().unwrap();
    record.header = header_from_words(&hdr);
}

fn entry_of(record: &SessionRecord) -> RalResult<Tofino2Entry> {
    match record.hw {
        HwParams::Tofino2(entry) => Ok(entry),
        _ => Err(RalError::InvalidArg(
            "record does not carry Tofino2 parameters".to_string(),
        )),
    }
}

/// Poll the slice buffer usage counter down to its steady-state floor.
/// The budget is deliberately soft: exhausting it means some stale
/// buffered copies may still emerge, which is tolerable; failing the
/// reconfiguration is not.
pub(super) fn drain_wait(
    io: &dyn RegisterIo,
    log: &Logger,
    phys: ral::PhysPipe,
    usage_addr: RegAddr,
) -> RalResult<()> {
    for _ in 0..DRAIN_POLL_LIMIT {
        if io.read(phys, usage_addr)? == 0 {
            return Ok(());
        }
    }
    warn!(
        log,
        "mirror buffer drain did not reach floor on pipe {phys} \
         after {DRAIN_POLL_LIMIT} polls; continuing"
    );
    Ok(())
}

/// Reprogram one session on the selected pipes through the
/// drain-then-reprogram path: park the deparser mirror selector, wait
/// out the in-flight buffered copies, rewrite the session words through
/// direct register access, then restore the selector.  The selector
/// value rides in the record's per-pipe save area across the transition.
pub(super) fn drain_and_program(
    io: &dyn RegisterIo,
    dev: &DeviceInfo,
    log: &Logger,
    node: &mut SessionNode,
    words: &[u32],
    addr_of: impl Fn(usize) -> RegAddr,
    sel_addr: RegAddr,
    usage_addr: RegAddr,
    pipes: &PipeMap,
) -> RalResult<()> {
    for pipe in pipes.iter() {
        let phys = dev.log_to_phys(pipe as PipeId)?;

        let sel = io.read(phys, sel_addr)?;
        if let Some(entry) = node.record.hw.entry_mut() {
            entry.sel_save[pipe] = sel;
            entry.sel_save_valid[pipe] = true;
        }
        io.write(phys, sel_addr, sel & !SEL_MIRROR_EN)?;

        // The software model has no mirror buffers to drain.
        if !dev.sw_model {
            drain_wait(io, log, phys, usage_addr)?;
        }

        for (word, val) in words.iter().enumerate() {
            io.write(phys, addr_of(word), *val)?;
        }

        io.write(phys, sel_addr, sel)?;
        if let Some(entry) = node.record.hw.entry_mut() {
            entry.sel_save_valid[pipe] = false;
        }
    }
    Ok(())
}

pub(crate) struct Tofino2Codec;

impl FamilyCodec for Tofino2Codec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Tofino2
    }

    fn base_sid(&self, _mirror_type: MirrorType) -> SessionId {
        1
    }

    fn max_sid(&self, _mirror_type: MirrorType) -> SessionId {
        MAX_SID
    }

    fn coal_slots(&self) -> u8 {
        COAL_SLOTS
    }

    fn dynamic_coal_slots(&self) -> bool {
        true
    }

    fn sid_is_coalescing(&self, _sid: SessionId) -> bool {
        false
    }

    fn cos_bits(&self) -> u8 {
        3
    }

    fn queue_bits(&self) -> u8 {
        7
    }

    fn port_bits(&self) -> u8 {
        10
    }

    fn init(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        log: &Logger,
    ) -> RalResult<()> {
        info!(log, "initializing tofino2 mirror tables");
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
            for sid in 1..=MAX_SID {
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
            // A stale session may still reference a coalescing slot;
            // scrub that slot's registers along with the session words.
            let rid = io.read(phys, sess_addr(sid, 5))?;
            let slot = crate::codec::unpack(rid, 21, 5);
            if slot != 0 {
                for word in 0..COAL_WORDS {
                    writes.push(RegWrite {
                        pipe: phys,
                        addr: coal_addr((slot - 1) as u8, word),
                        val: 0,
                    });
                }
            }
            for word in 0..SESS_WORDS {
                writes.push(RegWrite {
                    pipe: phys,
                    addr: sess_addr(sid, word),
                    val: 0,
                });
            }
        }
        io.write_batch(&writes)
    }

    fn program(
        &self,
        io: &dyn RegisterIo,
        dev: &DeviceInfo,
        log: &Logger,
        node: &mut SessionNode,
        slot: Option<u8>,
        pipes: &PipeMap,
    ) -> RalResult<()> {
        let entry = entry_of(&node.record)?;
        let words = encode_entry(node, &entry, slot);
        let sid = node.sid;

        if dev.locked {
            // Fast-reconfig window: traffic is quiesced, the batch path
            // is safe and much cheaper.
            let mut writes = Vec::new();
            for pipe in pipes.iter() {
                let phys = dev.log_to_phys(pipe as PipeId)?;
                for (word, val) in words.iter().enumerate() {
                    writes.push(RegWrite {
                        pipe: phys,
                        addr: sess_addr(sid, word),
                        val: *val,
                    });
                }
            }
            return io.write_batch(&writes);
        }

        drain_and_program(
            io,
            dev,
            log,
            node,
            &words,
            |word| sess_addr(sid, word),
            DPRSR_SEL,
            DPRSR_USAGE,
            pipes,
        )
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
        let words = encode_coal(record, enable, BASE_TICK_US, CELL_BYTES);
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
        if sess.iter().all(|w| *w == 0) {
            return Ok(None);
        }

        let (entry, mirror_type, direction, max_packet_len, ing, egr, slot) =
            decode_entry(&sess);

        let mut record = SessionRecord::zeroed(DeviceFamily::Tofino2);
        record.mirror_type = mirror_type;
        record.direction = direction;
        record.max_packet_len = max_packet_len;
        record.hw = HwParams::Tofino2(entry);

        if mirror_type == MirrorType::Coalescing {
            if let Some(slot) = slot {
                let mut coal = [0u32; COAL_WORDS];
                for (word, val) in coal.iter_mut().enumerate() {
                    *val = io.read(phys, coal_addr(slot, word))?;
                }
                decode_coal(&mut record, &coal, BASE_TICK_US);
            }
        }

        Ok(Some(HwSession {
            record,
            enable_ingress: ing,
            enable_egress: egr,
            coal_slot: slot,
        }))
    }

    fn fields_match(&self, a: &SessionRecord, b: &SessionRecord) -> bool {
        normalize(a, BASE_TICK_US) == normalize(b, BASE_TICK_US)
    }
}

// Comparison form of a record: the timeout quantized to the tick and the
// transient selector save area cleared.
pub(super) fn normalize(
    r: &SessionRecord,
    base_tick_us: u32,
) -> SessionRecord {
    let mut n = *r;
    n.timeout_usec = ticks_to_usec(
        usec_to_ticks(n.timeout_usec, base_tick_us),
        base_tick_us,
    );
    if let Some(entry) = n.hw.entry_mut() {
        entry.sel_save = Default::default();
        entry.sel_save_valid = Default::default();
    }
    n
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::{ConfigSource, PipeScope};
    use ral::fake::FakeIo;

    fn test_setup() -> (Logger, DeviceInfo, FakeIo) {
        let log = common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap();
        let dev = DeviceInfo::new(0, DeviceFamily::Tofino2, 4);
        let io = FakeIo::new(log.clone());
        (log, dev, io)
    }

    pub(super) fn sample_entry() -> Tofino2Entry {
        Tofino2Entry {
            egress_port: 0x2c5,
            egress_port_valid: true,
            pipe_vec: 0b0110,
            mcast_grp_a: 0x2222,
            mcast_grp_a_valid: true,
            mcast_grp_b: 0x3333,
            mcast_grp_b_valid: true,
            mcast_l1_xid: 0x88,
            mcast_l2_xid: 0x99,
            mcast_rid: 0xabc,
            icos: 6,
            copy_to_cpu_cos: 2,
            copy_to_cpu: true,
            deflect_on_drop: false,
            color: 1,
            egress_queue: 100,
            cfg: ConfigSource {
                hash_cfg: true,
                icos_cfg: false,
                dod_cfg: true,
                copy_to_cpu_cfg: false,
                mc_cfg: true,
                epipe_cfg: false,
            },
            priority: SessionPriority::High,
            coal_mode: CoalMode::Legacy,
            sel_save: Default::default(),
            sel_save_valid: Default::default(),
        }
    }

    fn sample_node(sid: SessionId, mt: MirrorType) -> SessionNode {
        let mut record = SessionRecord::zeroed(DeviceFamily::Tofino2);
        record.mirror_type = mt;
        record.direction = Direction::Ingress;
        record.max_packet_len = 512;
        record.hw = HwParams::Tofino2(sample_entry());
        if mt == MirrorType::Coalescing {
            record.header = core::array::from_fn(|i| 0x80 | i as u8);
            record.header_len = 3;
            record.timeout_usec = 250;
            record.extract_len = 128;
        }
        SessionNode {
            sid,
            scope: PipeScope::All,
            enable_ingress: true,
            enable_egress: false,
            record,
        }
    }

    #[test]
    fn test_roundtrip_normal() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino2Codec;
        let mut node = sample_node(44, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set_all();

        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        let hw = codec.read(&io, &dev, 44, 3)?.unwrap();
        assert!(hw.enable_ingress);
        assert!(!hw.enable_egress);
        assert!(codec.fields_match(&hw.record, &node.record));
        assert_eq!(hw.record.hw.entry().unwrap().priority,
            SessionPriority::High);
        Ok(())
    }

    #[test]
    fn test_roundtrip_coalescing() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino2Codec;
        let mut node = sample_node(45, MirrorType::Coalescing);
        let mut pipes = PipeMap::new(4);
        pipes.set(1);

        codec.program(&io, &dev, &log, &mut node, Some(5), &pipes)?;
        codec.program_coal(&io, &dev, 5, &node.record, true, &pipes)?;
        let hw = codec.read(&io, &dev, 45, 1)?.unwrap();
        assert_eq!(hw.record.mirror_type, MirrorType::Coalescing);
        // Full header round-trip on this family; no derived byte.
        assert_eq!(hw.record.header, node.record.header);
        assert!(codec.fields_match(&hw.record, &node.record));
        Ok(())
    }

    // Outside a locked window, programming parks and restores the
    // deparser selector around the rewrite.
    #[test]
    fn test_selector_restored() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino2Codec;
        io.write(2, DPRSR_SEL, SEL_MIRROR_EN | 0xf0)?;

        let mut node = sample_node(10, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set(2);
        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;

        assert_eq!(io.read(2, DPRSR_SEL)?, SEL_MIRROR_EN | 0xf0);
        let entry = node.record.hw.entry().unwrap();
        assert!(!entry.sel_save_valid[2]);
        Ok(())
    }

    // The drain poll gives up after its budget without failing the call.
    #[test]
    fn test_drain_budget_soft() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino2Codec;
        // A usage counter that never reaches the floor.
        io.write(0, DPRSR_USAGE, 3)?;

        let mut node = sample_node(11, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set(0);
        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        assert!(codec.read(&io, &dev, 11, 0)?.is_some());
        Ok(())
    }

    // A locked device takes the batch path and leaves the selector
    // alone.
    #[test]
    fn test_locked_uses_batch_path() -> anyhow::Result<()> {
        let (log, mut dev, io) = test_setup();
        dev.locked = true;
        let codec = Tofino2Codec;

        let mut node = sample_node(12, MirrorType::Normal);
        let mut pipes = PipeMap::new(4);
        pipes.set(0);
        let before = io.write_count();
        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;

        // Exactly the session words, no selector traffic.
        assert_eq!(io.write_count() - before, SESS_WORDS as u64);
        assert_eq!(io.read(0, DPRSR_SEL)?, 0);
        Ok(())
    }

    #[test]
    fn test_wrong_family_params() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino2Codec;
        let mut node = sample_node(13, MirrorType::Normal);
        node.record.hw =
            HwParams::zeroed(DeviceFamily::Tofino1);
        let mut pipes = PipeMap::new(4);
        pipes.set(0);
        codec
            .program(&io, &dev, &log, &mut node, None, &pipes)
            .unwrap_err();
        Ok(())
    }
}
