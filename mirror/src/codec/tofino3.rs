// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Tofino3 mirror-session encoding.
//!
//! The session entry is the Tofino2 word layout at different addresses,
//! with two additions: the device spans two dies of four pipes, so the
//! pipe vector is wider and the EPORT word carries a 2-bit die routing
//! vector at [24:2], derived from the pipe vector and never set
//! directly.  The coalescing pool and the deparser drain workaround
//! behave as on Tofino2.

use slog::{info, Logger};

use crate::codec::tofino2::{
    decode_coal, decode_entry, drain_and_program, encode_coal,
    encode_entry, normalize,
};
use crate::codec::{pack, unpack, FamilyCodec, HwSession};
use crate::pipemap::PipeMap;
use crate::session::{
    HwParams, MirrorType, SessionId, SessionNode, SessionRecord,
    Tofino3Entry,
};
use ral::{
    DeviceFamily, DeviceInfo, PipeId, RalError, RalResult, RegAddr,
    RegWrite, RegisterIo,
};

const MAX_SID: SessionId = 255;
const COAL_SLOTS: u8 = 16;
const NEG_MIRROR_SID: u32 = 255;

const BASE_TICK_US: u32 = 25;
const CELL_BYTES: u32 = 176;
const TRUNC_WATERMARK: u32 = 0x3000;

const GLB_TRUNC_WM: RegAddr = 0x0000_0010;
const GLB_BASE_TICK: RegAddr = 0x0000_0014;
const GLB_NEG_SID: RegAddr = 0x0000_0018;
const GLB_PKT_SANITY: RegAddr = 0x0000_001c;

const SESS_BASE: RegAddr = 0x0300_0000;
const SESS_STRIDE: u32 = 0x80;
const SESS_WORDS: usize = 7;

const COAL_BASE: RegAddr = 0x0380_0000;
const COAL_STRIDE: u32 = 0x40;
const COAL_WORDS: usize = 7;

const DPRSR_SEL: RegAddr = 0x0060_0000;
const DPRSR_USAGE: RegAddr = 0x0060_0004;

fn sess_addr(sid: SessionId, word: usize) -> RegAddr {
    SESS_BASE + sid as u32 * SESS_STRIDE + 4 * word as u32
}

fn coal_addr(slot: u8, word: usize) -> RegAddr {
    COAL_BASE + slot as u32 * COAL_STRIDE + 4 * word as u32
}

fn entry_of(record: &SessionRecord) -> RalResult<Tofino3Entry> {
    match record.hw {
        HwParams::Tofino3(entry) => Ok(entry),
        _ => Err(RalError::InvalidArg(
            "record does not carry Tofino3 parameters".to_string(),
        )),
    }
}

fn encode(
    node: &SessionNode,
    entry: &Tofino3Entry,
    slot: Option<u8>,
) -> [u32; SESS_WORDS] {
    let mut w = encode_entry(node, &entry.base, slot);
    pack(&mut w[1], 24, 2, entry.die_vec as u32);
    w
}

pub(crate) struct Tofino3Codec;

impl FamilyCodec for Tofino3Codec {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Tofino3
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
        info!(log, "initializing tofino3 mirror tables");
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
        let words = encode(node, &entry, slot);
        let sid = node.sid;

        if dev.locked {
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

        let (base, mirror_type, direction, max_packet_len, ing, egr, slot) =
            decode_entry(&sess);
        let entry = Tofino3Entry {
            base,
            die_vec: unpack(sess[1], 24, 2) as u8,
        };

        let mut record = SessionRecord::zeroed(DeviceFamily::Tofino3);
        record.mirror_type = mirror_type;
        record.direction = direction;
        record.max_packet_len = max_packet_len;
        record.hw = HwParams::Tofino3(entry);

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

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::{
        die_vec_for, Direction, PipeScope, Tofino2Entry,
    };
    use ral::fake::FakeIo;

    fn test_setup() -> (Logger, DeviceInfo, FakeIo) {
        let log = common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap();
        // Two dies of four pipes.
        let dev = DeviceInfo::new(0, DeviceFamily::Tofino3, 8);
        let io = FakeIo::new(log.clone());
        (log, dev, io)
    }

    fn sample_node(sid: SessionId) -> SessionNode {
        let mut base = Tofino2Entry {
            egress_port: 0x3e1,
            egress_port_valid: true,
            mcast_rid: 0x42,
            icos: 2,
            egress_queue: 64,
            ..Default::default()
        };
        base.pipe_vec = 0b0011_0001;
        let entry = Tofino3Entry {
            base,
            die_vec: die_vec_for(base.pipe_vec),
        };

        let mut record = SessionRecord::zeroed(DeviceFamily::Tofino3);
        record.mirror_type = MirrorType::Normal;
        record.direction = Direction::Egress;
        record.max_packet_len = 1024;
        record.hw = HwParams::Tofino3(entry);
        SessionNode {
            sid,
            scope: PipeScope::All,
            enable_ingress: false,
            enable_egress: true,
            record,
        }
    }

    #[test]
    fn test_roundtrip_with_die_vector() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino3Codec;
        let mut node = sample_node(99);
        let mut pipes = PipeMap::new(8);
        pipes.set_all();

        codec.program(&io, &dev, &log, &mut node, None, &pipes)?;
        let hw = codec.read(&io, &dev, 99, 6)?.unwrap();
        assert!(codec.fields_match(&hw.record, &node.record));

        // Pipes 0, 4, and 5 are selected: both dies route.
        let HwParams::Tofino3(entry) = hw.record.hw else {
            panic!("wrong variant");
        };
        assert_eq!(entry.die_vec, 0b11);
        assert!(hw.enable_egress);
        Ok(())
    }

    #[test]
    fn test_roundtrip_coalescing() -> anyhow::Result<()> {
        let (log, dev, io) = test_setup();
        let codec = Tofino3Codec;
        let mut node = sample_node(7);
        node.record.mirror_type = MirrorType::Coalescing;
        node.record.header = core::array::from_fn(|i| i as u8 * 3);
        node.record.header_len = 2;
        node.record.timeout_usec = 130;
        node.record.extract_len = 64;
        let mut pipes = PipeMap::new(8);
        pipes.set(4);

        codec.program(&io, &dev, &log, &mut node, Some(9), &pipes)?;
        codec.program_coal(&io, &dev, 9, &node.record, true, &pipes)?;
        let hw = codec.read(&io, &dev, 7, 4)?.unwrap();
        assert!(codec.fields_match(&hw.record, &node.record));
        // 130us on a 25us tick quantizes up to 150us.
        assert_eq!(hw.record.timeout_usec, 150);
        Ok(())
    }

    #[test]
    fn test_unprogrammed_reads_invalid() -> anyhow::Result<()> {
        let (_log, dev, io) = test_setup();
        let codec = Tofino3Codec;
        assert!(codec.read(&io, &dev, 100, 0)?.is_none());
        Ok(())
    }
}
