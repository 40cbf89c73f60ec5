// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Session-manager behavior over the fake register backend: validation,
//! the exclusivity invariant, rollback on hardware failure, coalescing
//! slot accounting, and bulk convergence.

use std::sync::Arc;

use mirror::session::{
    CoalMode, Direction, HwParams, MirrorType, PipeScope, SessionKey,
    SessionPriority, SessionRecord,
};
use mirror::{MetaFlag, MirrorError, MirrorMgr};
use ral::fake::FakeIo;
use ral::{DeviceFamily, DeviceInfo};

fn setup(family: DeviceFamily, pipes: u8) -> (Arc<FakeIo>, MirrorMgr) {
    let log = common::logging::init(
        "test",
        &None,
        common::logging::LogFormat::Human,
    )
    .unwrap();
    let mut dev = DeviceInfo::new(0, family, pipes);
    dev.sw_model = true;
    let io = Arc::new(FakeIo::new(log.clone()));
    let mgr = MirrorMgr::new(&log, dev, io.clone()).unwrap();
    (io, mgr)
}

fn t2_setup() -> (Arc<FakeIo>, MirrorMgr) {
    setup(DeviceFamily::Tofino2, 4)
}

fn t2_record() -> SessionRecord {
    let mut r = SessionRecord::zeroed(DeviceFamily::Tofino2);
    r.mirror_type = MirrorType::Normal;
    r.direction = Direction::Both;
    r.max_packet_len = 192;
    if let HwParams::Tofino2(e) = &mut r.hw {
        e.egress_port = 0x85;
        e.egress_port_valid = true;
        e.egress_queue = 3;
        e.mcast_rid = 7;
    }
    r
}

fn t2_coal_record() -> SessionRecord {
    let mut r = t2_record();
    r.mirror_type = MirrorType::Coalescing;
    r.header = [0x11; 16];
    r.header_len = 2;
    r.timeout_usec = 100;
    r.extract_len = 64;
    r
}

#[test]
fn test_reserved_session_id() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    let err = mgr
        .session_set(0, PipeScope::All, t2_record(), true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));
    mgr.session_reset(0, PipeScope::All).unwrap_err();
    mgr.session_get(0, PipeScope::All).unwrap_err();
    mgr.session_enable(0, PipeScope::All, Direction::Both)
        .unwrap_err();
    assert_eq!(mgr.session_get_count(PipeScope::All), 0);
    Ok(())
}

#[test]
fn test_out_of_range_session_id() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();
    let err = mgr
        .session_set(300, PipeScope::All, t2_record(), false)
        .unwrap_err();
    assert!(matches!(err, MirrorError::NotFound(_)));

    // Tofino1 splits the range by mirror type.
    let (_io, mgr) = setup(DeviceFamily::Tofino1, 4);
    let mut normal = SessionRecord::zeroed(DeviceFamily::Tofino1);
    normal.direction = Direction::Ingress;
    let err = mgr
        .session_set(1016, PipeScope::All, normal, false)
        .unwrap_err();
    assert!(matches!(err, MirrorError::NotFound(_)));

    let mut coal = SessionRecord::zeroed(DeviceFamily::Tofino1);
    coal.mirror_type = MirrorType::Coalescing;
    coal.direction = Direction::Ingress;
    let err = mgr
        .session_set(5, PipeScope::All, coal, false)
        .unwrap_err();
    assert!(matches!(err, MirrorError::NotFound(_)));
    Ok(())
}

#[test]
fn test_enable_without_direction() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();
    let mut record = t2_record();
    record.direction = Direction::None;

    let before = io.write_count();
    let err = mgr
        .session_set(5, PipeScope::All, record, true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));
    // Rejected before any hardware write.
    assert_eq!(io.write_count(), before);
    mgr.session_get(5, PipeScope::All).unwrap_err();

    // The same record is fine when not enabling.
    mgr.session_set(5, PipeScope::All, record, false)?;
    Ok(())
}

#[test]
fn test_pipe_scope_conflict() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    mgr.session_set(7, PipeScope::All, t2_record(), true)?;
    let err = mgr
        .session_set(7, PipeScope::Pipe(2), t2_record(), true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));
    assert_eq!(mgr.session_get_count(PipeScope::All), 1);
    assert!(mgr.session_get(7, PipeScope::All).is_ok());

    // The symmetric case: per-pipe first, then all-pipes.
    mgr.session_set(8, PipeScope::Pipe(1), t2_record(), true)?;
    let err = mgr
        .session_set(8, PipeScope::All, t2_record(), true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));

    // Distinct pipes coexist for one id.
    mgr.session_set(8, PipeScope::Pipe(0), t2_record(), true)?;
    assert_eq!(mgr.session_get_count(PipeScope::All), 3);
    Ok(())
}

#[test]
fn test_session_get_count() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    mgr.session_set(3, PipeScope::All, t2_record(), true)?;
    mgr.session_set(4, PipeScope::Pipe(0), t2_record(), false)?;
    mgr.session_set(4, PipeScope::Pipe(1), t2_record(), false)?;
    mgr.session_set(9, PipeScope::All, t2_record(), true)?;
    assert_eq!(mgr.session_get_count(PipeScope::All), 4);
    assert_eq!(mgr.session_get_count(PipeScope::Pipe(1)), 1);
    assert_eq!(mgr.session_get_count(PipeScope::Pipe(3)), 0);

    mgr.session_reset(4, PipeScope::Pipe(0))?;
    assert_eq!(mgr.session_get_count(PipeScope::All), 3);
    Ok(())
}

#[test]
fn test_enable_disable_semantics() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), false)?;

    let node = mgr.session_get(5, PipeScope::All)?;
    assert!(!node.enable_ingress && !node.enable_egress);

    mgr.session_enable(5, PipeScope::All, Direction::Ingress)?;
    let node = mgr.session_get(5, PipeScope::All)?;
    assert!(node.enable_ingress && !node.enable_egress);
    // Enabling a different direction retargets the stored direction.
    assert_eq!(node.record.direction, Direction::Ingress);

    mgr.session_enable(5, PipeScope::All, Direction::Both)?;
    let node = mgr.session_get(5, PipeScope::All)?;
    assert!(node.enable_ingress && node.enable_egress);
    assert_eq!(node.record.direction, Direction::Both);

    mgr.session_disable(5, PipeScope::All, Direction::Ingress)?;
    let node = mgr.session_get(5, PipeScope::All)?;
    assert!(!node.enable_ingress && node.enable_egress);

    // Enabling a session that was never set is a caller error.
    let err = mgr
        .session_enable(6, PipeScope::All, Direction::Both)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));
    Ok(())
}

// Any mutation that fails in hardware must leave the stored node
// exactly as it was before the call.
#[test]
fn test_rollback_on_hw_failure() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), false)?;
    let before = mgr.session_get(5, PipeScope::All)?;

    io.fail_after(0);
    mgr.session_enable(5, PipeScope::All, Direction::Both)
        .unwrap_err();
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    io.fail_after(0);
    mgr.priority_update(5, PipeScope::All, SessionPriority::High)
        .unwrap_err();
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    io.fail_after(0);
    mgr.coal_mode_update(5, PipeScope::All, CoalMode::Legacy)
        .unwrap_err();
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    io.fail_after(0);
    mgr.meta_flag_update(5, PipeScope::All, MetaFlag::HashCfg, true)
        .unwrap_err();
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    io.fail_after(0);
    mgr.mcast_pipe_vector_set(5, PipeScope::All, 0b0101)
        .unwrap_err();
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    // With failures cleared the same updates land.
    mgr.session_enable(5, PipeScope::All, Direction::Both)?;
    mgr.priority_update(5, PipeScope::All, SessionPriority::High)?;
    mgr.mcast_pipe_vector_set(5, PipeScope::All, 0b0101)?;
    let node = mgr.session_get(5, PipeScope::All)?;
    assert!(node.enable_ingress && node.enable_egress);
    assert_eq!(
        mgr.priority_get(5, PipeScope::All)?,
        SessionPriority::High
    );
    assert_eq!(mgr.mcast_pipe_vector_get(5, PipeScope::All)?, 0b0101);
    Ok(())
}

#[test]
fn test_set_failure_leaves_store_untouched() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();

    // A failed overwrite keeps the pre-existing entry intact.
    mgr.session_set(5, PipeScope::All, t2_record(), true)?;
    let before = mgr.session_get(5, PipeScope::All)?;
    let mut other = t2_record();
    other.max_packet_len = 64;
    io.fail_after(0);
    let err = mgr
        .session_set(5, PipeScope::All, other, true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Hw(_)));
    assert_eq!(mgr.session_get(5, PipeScope::All)?, before);

    // A failed first-time set leaves no node behind at all.
    io.fail_after(0);
    mgr.session_set(6, PipeScope::All, t2_record(), true)
        .unwrap_err();
    mgr.session_get(6, PipeScope::All).unwrap_err();
    assert_eq!(mgr.session_get_count(PipeScope::All), 1);
    Ok(())
}

#[test]
fn test_coalescing_slot_conservation() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    for sid in 1..=16 {
        mgr.session_set(sid, PipeScope::All, t2_coal_record(), true)?;
    }
    let err = mgr
        .session_set(17, PipeScope::All, t2_coal_record(), true)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Exhausted(_)));

    // Resetting a session returns its slot to the pool.
    mgr.session_reset(3, PipeScope::All)?;
    mgr.session_set(17, PipeScope::All, t2_coal_record(), true)?;

    // A failed coalescing set must not leak the slot it took.
    let (io, mgr) = t2_setup();
    for sid in 1..=15 {
        mgr.session_set(sid, PipeScope::All, t2_coal_record(), true)?;
    }
    io.fail_after(0);
    mgr.session_set(16, PipeScope::All, t2_coal_record(), true)
        .unwrap_err();
    mgr.session_set(16, PipeScope::All, t2_coal_record(), true)?;
    Ok(())
}

#[test]
fn test_slot_released_on_type_conversion() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    for sid in 1..=16 {
        mgr.session_set(sid, PipeScope::All, t2_coal_record(), true)?;
    }
    mgr.session_set(20, PipeScope::All, t2_coal_record(), true)
        .unwrap_err();

    // Overwriting a coalescing session as Normal frees its slot.
    mgr.session_set(16, PipeScope::All, t2_record(), true)?;
    mgr.session_set(20, PipeScope::All, t2_coal_record(), true)?;
    Ok(())
}

#[test]
fn test_family_gating() -> anyhow::Result<()> {
    let (_io, mgr) = setup(DeviceFamily::Tofino1, 4);
    let mut record = SessionRecord::zeroed(DeviceFamily::Tofino1);
    record.direction = Direction::Both;
    mgr.session_set(9, PipeScope::All, record, true)?;

    // Priority, coalescing mode, and the config-source flags exist only
    // on Tofino2/3.
    let err = mgr
        .priority_update(9, PipeScope::All, SessionPriority::High)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));
    mgr.priority_get(9, PipeScope::All).unwrap_err();
    mgr.coal_mode_update(9, PipeScope::All, CoalMode::Native)
        .unwrap_err();
    mgr.coal_mode_get(9, PipeScope::All).unwrap_err();
    mgr.meta_flag_update(9, PipeScope::All, MetaFlag::McCfg, true)
        .unwrap_err();
    mgr.meta_flag_get(9, PipeScope::All, MetaFlag::McCfg)
        .unwrap_err();
    Ok(())
}

#[test]
fn test_field_validation() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();

    // An egress port on a pipe the device doesn't have.
    let mut record = t2_record();
    if let HwParams::Tofino2(e) = &mut record.hw {
        e.egress_port = 5 << 7;
    }
    let err = mgr
        .session_set(5, PipeScope::All, record, false)
        .unwrap_err();
    assert!(matches!(err, MirrorError::Invalid(_)));

    // Queue id wider than the family's field.
    let mut record = t2_record();
    if let HwParams::Tofino2(e) = &mut record.hw {
        e.egress_queue = 0x80;
    }
    mgr.session_set(5, PipeScope::All, record, false)
        .unwrap_err();

    // Level-2 exclusion id out of range.
    let mut record = t2_record();
    if let HwParams::Tofino2(e) = &mut record.hw {
        e.mcast_l2_xid = 0x200;
    }
    mgr.session_set(5, PipeScope::All, record, false)
        .unwrap_err();

    // Ingress CoS wider than the field.
    let mut record = t2_record();
    if let HwParams::Tofino2(e) = &mut record.hw {
        e.icos = 8;
    }
    mgr.session_set(5, PipeScope::All, record, false)
        .unwrap_err();

    // Parameters for the wrong family.
    let mut record = t2_record();
    record.hw = HwParams::zeroed(DeviceFamily::Tofino1);
    mgr.session_set(5, PipeScope::All, record, false)
        .unwrap_err();

    // A scope naming a pipe the device doesn't have.
    mgr.session_set(5, PipeScope::Pipe(4), t2_record(), false)
        .unwrap_err();

    assert_eq!(mgr.session_get_count(PipeScope::All), 0);
    Ok(())
}

// Updating a knob to its current value is a successful no-op with no
// hardware write.
#[test]
fn test_unchanged_update_skips_hardware() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), true)?;

    let before = io.write_count();
    mgr.priority_update(5, PipeScope::All, SessionPriority::Low)?;
    mgr.coal_mode_update(5, PipeScope::All, CoalMode::Native)?;
    assert_eq!(io.write_count(), before);

    mgr.priority_update(5, PipeScope::All, SessionPriority::High)?;
    assert!(io.write_count() > before);
    Ok(())
}

#[test]
fn test_pipe_vector_and_die_vector() -> anyhow::Result<()> {
    let (_io, mgr) = setup(DeviceFamily::Tofino3, 8);
    let mut record = SessionRecord::zeroed(DeviceFamily::Tofino3);
    record.direction = Direction::Both;
    mgr.session_set(5, PipeScope::All, record, true)?;

    mgr.mcast_pipe_vector_set(5, PipeScope::All, 0b0011_0000)?;
    assert_eq!(
        mgr.mcast_pipe_vector_get(5, PipeScope::All)?,
        0b0011_0000
    );
    let node = mgr.session_get(5, PipeScope::All)?;
    let HwParams::Tofino3(entry) = node.record.hw else {
        panic!("wrong variant");
    };
    // Only die 1 pipes are selected.
    assert_eq!(entry.die_vec, 0b10);

    // A vector selecting pipes beyond the device is rejected.
    let (_io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), true)?;
    mgr.mcast_pipe_vector_set(5, PipeScope::All, 0b1_0000)
        .unwrap_err();
    Ok(())
}

// Running the bulk convergence sweep twice with no intervening changes
// must leave hardware byte-identical after the second run.
#[test]
fn test_cfg_sessions_idempotent() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), true)?;
    mgr.session_set(9, PipeScope::Pipe(1), t2_record(), true)?;
    mgr.session_set(12, PipeScope::All, t2_coal_record(), true)?;

    mgr.cfg_sessions()?;
    let first = io.snapshot();
    mgr.cfg_sessions()?;
    assert_eq!(io.snapshot(), first);
    Ok(())
}

#[test]
fn test_ecc_correct() -> anyhow::Result<()> {
    let (io, mgr) = t2_setup();
    mgr.session_set(5, PipeScope::All, t2_record(), true)?;
    let clean = io.snapshot();

    // A configured session is rewritten in place; the register file ends
    // up exactly where it started.
    mgr.ecc_correct(2, 5)?;
    assert_eq!(io.snapshot(), clean);
    assert_eq!(mgr.session_get_count(PipeScope::All), 1);

    // A slot nothing covers gets scrubbed to zero via a throwaway node
    // that never enters the store.  Leave stale state behind by
    // resetting a session (reset disables but does not zero).
    mgr.session_set(77, PipeScope::Pipe(0), t2_record(), true)?;
    mgr.session_reset(77, PipeScope::Pipe(0))?;
    assert_ne!(io.snapshot(), clean);

    mgr.ecc_correct(0, 77)?;
    assert_eq!(io.snapshot(), clean);
    assert_eq!(mgr.session_get_count(PipeScope::All), 1);
    Ok(())
}

#[test]
fn test_get_first_next_filtering() -> anyhow::Result<()> {
    let (_io, mgr) = t2_setup();
    mgr.session_set(3, PipeScope::All, t2_record(), true)?;
    mgr.session_set(5, PipeScope::Pipe(1), t2_record(), true)?;
    mgr.session_set(7, PipeScope::Pipe(0), t2_record(), true)?;

    let first = mgr.session_get_first(PipeScope::All)?;
    assert_eq!(first.sid, 3);
    let next = mgr.session_get_next(PipeScope::All, first.key())?;
    assert_eq!((next.sid, next.scope), (5, PipeScope::Pipe(1)));
    let next = mgr.session_get_next(PipeScope::All, next.key())?;
    assert_eq!(next.sid, 7);
    mgr.session_get_next(PipeScope::All, next.key()).unwrap_err();

    // A specific-pipe filter walks only that pipe's own entries.
    let first = mgr.session_get_first(PipeScope::Pipe(1))?;
    assert_eq!(first.sid, 5);
    mgr.session_get_next(PipeScope::Pipe(1), first.key())
        .unwrap_err();
    mgr.session_get_first(PipeScope::Pipe(3)).unwrap_err();

    // The cursor key need not name a surviving node.
    mgr.session_reset(5, PipeScope::Pipe(1))?;
    let next = mgr.session_get_next(
        PipeScope::All,
        SessionKey::new(5, PipeScope::Pipe(1)),
    )?;
    assert_eq!(next.sid, 7);
    Ok(())
}

#[test]
fn test_session_id_ranges() -> anyhow::Result<()> {
    let (_io, mgr) = setup(DeviceFamily::Tofino1, 4);
    assert_eq!(mgr.max_sessions_get(MirrorType::Normal), 1015);
    assert_eq!(mgr.max_sessions_get(MirrorType::Coalescing), 1023);
    assert_eq!(mgr.base_session_id_get(MirrorType::Normal), 1);
    assert_eq!(mgr.base_session_id_get(MirrorType::Coalescing), 1016);

    let (_io, mgr) = t2_setup();
    assert_eq!(mgr.max_sessions_get(MirrorType::Normal), 255);
    assert_eq!(mgr.max_sessions_get(MirrorType::Coalescing), 255);
    assert_eq!(mgr.base_session_id_get(MirrorType::Coalescing), 1);
    Ok(())
}

// A Tofino1 coalescing session lives in the reserved high id range and
// derives its slot from its id.
#[test]
fn test_tofino1_coalescing_range() -> anyhow::Result<()> {
    let (_io, mgr) = setup(DeviceFamily::Tofino1, 4);
    let mut record = SessionRecord::zeroed(DeviceFamily::Tofino1);
    record.mirror_type = MirrorType::Coalescing;
    record.direction = Direction::Ingress;
    record.header_len = 1;
    record.timeout_usec = 300;
    record.extract_len = 80;

    for sid in 1016..=1023 {
        mgr.session_set(sid, PipeScope::All, record, true)?;
    }
    assert_eq!(mgr.session_get_count(PipeScope::All), 8);
    mgr.session_reset(1020, PipeScope::All)?;
    mgr.session_set(1020, PipeScope::All, record, true)?;
    Ok(())
}
