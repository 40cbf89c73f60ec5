// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The family-agnostic session manager.
//!
//! This is the entrypoint for configuring mirror sessions: request
//! validation, enable/disable semantics, pipe-scope exclusivity, and the
//! transactional discipline between hardware and the session store.
//! Hardware is always written before the store is updated, so a caller
//! observing the store after a successful return never sees state the
//! hardware hasn't also reached.  Mutations of an existing session go
//! through one copy-modify-commit helper: the modified copy is programmed
//! first and committed only on success, so a hardware failure leaves the
//! stored node untouched.
//!
//! One `MirrorMgr` exists per device, constructed at device-add time and
//! dropped at device-remove; there is no process-wide session state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, info, o, Logger};

use crate::codec::{self, FamilyCodec};
use crate::ha;
use crate::pipemap::PipeMap;
use crate::session::{
    Direction, HwParams, MirrorType, PipeScope, SessionId, SessionKey,
    SessionNode, SessionPriority, SessionRecord,
};
use crate::session::CoalMode;
use crate::store::SessionStore;
use crate::types::{MirrorError, MirrorResult};
use ral::{DeviceFamily, DeviceInfo, PhysPipe, RegisterIo};

/// The per-field config-source switches exposed for update.  Tofino2/3
/// only.
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
pub enum MetaFlag {
    HashCfg,
    IcosCfg,
    DodCfg,
    CopyToCpuCfg,
    McCfg,
    EpipeCfg,
}

pub struct MirrorMgr {
    pub(crate) log: Logger,
    pub(crate) dev: DeviceInfo,
    pub(crate) io: Arc<dyn RegisterIo>,
    pub(crate) codec: &'static dyn FamilyCodec,
    pub(crate) store: SessionStore,
    // Set while a hitless warm init is in progress: programming calls
    // update the store only, and reconcile() converges hardware
    // afterwards.
    pub(crate) hitless: AtomicBool,
    // The phase-1 hardware snapshot, consumed by reconcile().
    pub(crate) observed: Mutex<Option<ha::Observed>>,
}

impl MirrorMgr {
    /// Build the manager for one device and initialize its mirror
    /// hardware.  Initialization is skipped when the device is locked
    /// for fast reconfig; the subsequent `cfg_sessions` convergence pass
    /// rebuilds the state instead.
    pub fn new(
        log: &Logger,
        dev: DeviceInfo,
        io: Arc<dyn RegisterIo>,
    ) -> MirrorResult<Self> {
        let log = log.new(o!("unit" => "mirror"));
        let codec = codec::for_family(dev.family);
        debug_assert_eq!(codec.family(), dev.family);
        let store =
            SessionStore::new(log.new(o!("unit" => "mirror-store")),
                codec.coal_slots());

        if !dev.locked {
            codec.init(io.as_ref(), &dev, &log)?;
        } else {
            info!(log, "device locked; skipping mirror table init");
        }

        Ok(MirrorMgr {
            log,
            dev,
            io,
            codec,
            store,
            hitless: AtomicBool::new(false),
            observed: Mutex::new(None),
        })
    }

    /// Build the manager for a device entering hitless warm init.  No
    /// hardware is touched beyond reading the current session state into
    /// the transient observed store; the control plane then replays its
    /// configuration (store-only) and calls [`Self::reconcile`].
    pub fn new_hitless(
        log: &Logger,
        dev: DeviceInfo,
        io: Arc<dyn RegisterIo>,
    ) -> MirrorResult<Self> {
        let log = log.new(o!("unit" => "mirror"));
        let codec = codec::for_family(dev.family);
        let store =
            SessionStore::new(log.new(o!("unit" => "mirror-store")),
                codec.coal_slots());

        info!(log, "hitless warm init; snapshotting mirror hardware");
        let observed = ha::snapshot(codec, io.as_ref(), &dev, &log)?;

        Ok(MirrorMgr {
            log,
            dev,
            io,
            codec,
            store,
            hitless: AtomicBool::new(true),
            observed: Mutex::new(Some(observed)),
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.dev
    }

    /// Highest valid session id for the mirror type on this device.
    pub fn max_sessions_get(&self, mirror_type: MirrorType) -> SessionId {
        self.codec.max_sid(mirror_type)
    }

    /// Lowest valid session id for the mirror type on this device.
    pub fn base_session_id_get(&self, mirror_type: MirrorType) -> SessionId {
        self.codec.base_sid(mirror_type)
    }

    pub(crate) fn in_hitless(&self) -> bool {
        self.hitless.load(Ordering::SeqCst)
    }

    // Build the pipe selector for a scope: one named pipe, or every
    // active pipe on the device.
    pub(crate) fn selector(&self, scope: PipeScope) -> MirrorResult<PipeMap> {
        let mut pipes = PipeMap::new(self.dev.num_pipes() as usize);
        match scope {
            PipeScope::All => pipes.set_all(),
            PipeScope::Pipe(p) => {
                if p >= self.dev.num_pipes() {
                    return Err(MirrorError::Invalid(format!(
                        "pipe {p} out of range (device has {} pipes)",
                        self.dev.num_pipes()
                    )));
                }
                pipes.set(p as usize);
            }
        }
        Ok(pipes)
    }

    // The coalescing slot a node programs with: its position in the
    // fixed Tofino1 range, or its dynamic assignment on Tofino2/3.  The
    // assignment must exist by the time a coalescing node is programmed.
    pub(crate) fn slot_for(
        &self,
        node: &SessionNode,
    ) -> MirrorResult<Option<u8>> {
        if node.record.mirror_type != MirrorType::Coalescing {
            return Ok(None);
        }
        if !self.codec.dynamic_coal_slots() {
            let base = self.codec.base_sid(MirrorType::Coalescing);
            return Ok(Some((node.sid - base) as u8));
        }
        self.store
            .with_slots(|s| s.get(&node.key()))
            .map(Some)
            .ok_or_else(|| {
                MirrorError::Invalid(format!(
                    "{} has no coalescing slot assigned",
                    node.key()
                ))
            })
    }

    // Write a node's full hardware state on the selected pipes.  During
    // a hitless warm init nothing is written; reconcile() converges the
    // hardware once replay completes.
    pub(crate) fn program_node(
        &self,
        node: &mut SessionNode,
        pipes: &PipeMap,
    ) -> MirrorResult<()> {
        if self.in_hitless() {
            return Ok(());
        }
        let slot = self.slot_for(node)?;
        self.codec.program(
            self.io.as_ref(),
            &self.dev,
            &self.log,
            node,
            slot,
            pipes,
        )?;
        if node.record.mirror_type == MirrorType::Coalescing {
            let enable = node.enable_ingress || node.enable_egress;
            self.codec.program_coal(
                self.io.as_ref(),
                &self.dev,
                slot.expect("coalescing node always has a slot"),
                &node.record,
                enable,
                pipes,
            )?;
        }
        Ok(())
    }

    // The copy-modify-commit helper behind every mutation of an
    // existing session.  The mutated copy is programmed before the store
    // is touched; a hardware failure therefore rolls back for free.  An
    // update that changes nothing is a successful no-op with no hardware
    // write.
    fn update_node(
        &self,
        key: SessionKey,
        mutate: impl FnOnce(&mut SessionNode) -> MirrorResult<()>,
    ) -> MirrorResult<()> {
        let Some(orig) = self.store.get(&key) else {
            return Err(MirrorError::Invalid(format!("no such {key}")));
        };
        let mut updated = orig;
        mutate(&mut updated)?;
        if updated == orig {
            return Ok(());
        }
        let pipes = self.selector(key.scope)?;
        self.program_node(&mut updated, &pipes)?;
        self.store.insert(updated);
        Ok(())
    }

    fn check_sid_reserved(&self, sid: SessionId) -> MirrorResult<()> {
        if sid == 0 {
            return Err(MirrorError::Invalid(
                "session id 0 is reserved".to_string(),
            ));
        }
        Ok(())
    }

    // Tofino2/3-only knobs reject on Tofino1 before anything else runs.
    fn check_entry_family(&self) -> MirrorResult<()> {
        if self.dev.family == DeviceFamily::Tofino1 {
            return Err(MirrorError::Invalid(format!(
                "operation not supported on {}",
                self.dev.family
            )));
        }
        Ok(())
    }

    fn validate_set(
        &self,
        sid: SessionId,
        scope: PipeScope,
        record: &SessionRecord,
        enable: bool,
    ) -> MirrorResult<(bool, bool)> {
        self.check_sid_reserved(sid)?;

        if record.hw.family() != self.dev.family {
            return Err(MirrorError::Invalid(format!(
                "record carries {} parameters on a {} device",
                record.hw.family(),
                self.dev.family
            )));
        }

        let base = self.codec.base_sid(record.mirror_type);
        let max = self.codec.max_sid(record.mirror_type);
        if sid < base || sid > max {
            return Err(MirrorError::NotFound(format!(
                "session id {sid} outside the {} range {base}..={max}",
                record.mirror_type
            )));
        }

        // Scope must name a real pipe; selector() performs the range
        // check.
        let _ = self.selector(scope)?;

        let (port, port_valid, l2_xid, icos, c2c_cos, queue, color, pipe_vec) =
            match &record.hw {
                HwParams::Tofino1(m) => (
                    m.egress_port,
                    m.egress_port_valid,
                    m.mcast_l2_xid,
                    m.icos,
                    m.copy_to_cpu_cos,
                    m.egress_queue,
                    m.color,
                    m.pipe_vec,
                ),
                HwParams::Tofino2(e) => (
                    e.egress_port,
                    e.egress_port_valid,
                    e.mcast_l2_xid,
                    e.icos,
                    e.copy_to_cpu_cos,
                    e.egress_queue,
                    e.color,
                    e.pipe_vec,
                ),
                HwParams::Tofino3(e) => (
                    e.base.egress_port,
                    e.base.egress_port_valid,
                    e.base.mcast_l2_xid,
                    e.base.icos,
                    e.base.copy_to_cpu_cos,
                    e.base.egress_queue,
                    e.base.color,
                    e.base.pipe_vec,
                ),
            };

        if l2_xid > codec::MAX_L2_XID {
            return Err(MirrorError::Invalid(format!(
                "level-2 exclusion id {l2_xid} exceeds {}",
                codec::MAX_L2_XID
            )));
        }
        if port >= 1 << self.codec.port_bits() {
            return Err(MirrorError::Invalid(format!(
                "egress port {port} out of range"
            )));
        }
        if port_valid {
            let port_pipe = (port >> 7) as u8;
            if port_pipe >= self.dev.num_pipes() {
                return Err(MirrorError::Invalid(format!(
                    "egress port {port} lives on pipe {port_pipe}, but \
                     the device has {} pipes",
                    self.dev.num_pipes()
                )));
            }
        }
        if color > 3 {
            return Err(MirrorError::Invalid(format!(
                "packet color {color} out of range"
            )));
        }
        if icos >= 1 << self.codec.cos_bits() {
            return Err(MirrorError::Invalid(format!(
                "ingress cos {icos} wider than {} bits",
                self.codec.cos_bits()
            )));
        }
        if c2c_cos >= 1 << self.codec.cos_bits() {
            return Err(MirrorError::Invalid(format!(
                "copy-to-cpu cos {c2c_cos} wider than {} bits",
                self.codec.cos_bits()
            )));
        }
        if queue as u16 >= 1 << self.codec.queue_bits() {
            return Err(MirrorError::Invalid(format!(
                "egress queue {queue} wider than {} bits",
                self.codec.queue_bits()
            )));
        }
        if self.dev.num_pipes() < 8
            && pipe_vec >> self.dev.num_pipes() != 0
        {
            return Err(MirrorError::Invalid(format!(
                "pipe vector {pipe_vec:#x} selects pipes beyond the \
                 device's {}",
                self.dev.num_pipes()
            )));
        }
        if record.max_packet_len > codec::MAX_TRUNC_LEN {
            return Err(MirrorError::Invalid(format!(
                "truncation length {} exceeds {}",
                record.max_packet_len,
                codec::MAX_TRUNC_LEN
            )));
        }
        if record.mirror_type == MirrorType::Coalescing {
            if record.header_len > codec::MAX_HEADER_WORDS {
                return Err(MirrorError::Invalid(format!(
                    "header length {} exceeds {} words",
                    record.header_len,
                    codec::MAX_HEADER_WORDS
                )));
            }
            if record.extract_len > codec::MAX_EXTRACT_LEN {
                return Err(MirrorError::Invalid(format!(
                    "extract length {} exceeds {}",
                    record.extract_len,
                    codec::MAX_EXTRACT_LEN
                )));
            }
        }

        derive_enables(record.direction, enable)
    }

    /// Create or overwrite a session.  Hardware is programmed before the
    /// store is updated; a failed write leaves any pre-existing entry
    /// for this key untouched.
    pub fn session_set(
        &self,
        sid: SessionId,
        scope: PipeScope,
        record: SessionRecord,
        enable: bool,
    ) -> MirrorResult<()> {
        let (enable_ingress, enable_egress) =
            self.validate_set(sid, scope, &record, enable)?;
        let key = SessionKey::new(sid, scope);

        if self.store.scope_conflict(&key) {
            return Err(MirrorError::Invalid(format!(
                "{key} conflicts with an existing entry of the opposite \
                 pipe scope"
            )));
        }

        let pipes = self.selector(scope)?;
        let prior = self.store.get(&key);

        let mut record = record;
        // The die vector is derived state; recompute rather than trust
        // the caller's copy.
        let pipe_vec = record.hw.pipe_vec();
        record.hw.set_pipe_vec(pipe_vec);

        let mut node = SessionNode {
            sid,
            scope,
            enable_ingress,
            enable_egress,
            record,
        };

        // A new coalescing session on Tofino2/3 takes a slot from the
        // shared pool up front, and gives it back if the hardware write
        // fails.
        let wants_dynamic_slot = record.mirror_type
            == MirrorType::Coalescing
            && self.codec.dynamic_coal_slots();
        let had_slot = self.store.with_slots(|s| s.get(&key)).is_some();
        let mut fresh_slot = false;
        if wants_dynamic_slot && !had_slot {
            if self.store.with_slots(|s| s.alloc(key)).is_none() {
                let in_use = self.store.with_slots(|s| s.in_use());
                return Err(MirrorError::Exhausted(format!(
                    "no free coalescing slot for {key} ({in_use} of {} \
                     in use)",
                    self.codec.coal_slots()
                )));
            }
            fresh_slot = true;
        }

        if let Err(e) = self.program_node(&mut node, &pipes) {
            if fresh_slot {
                self.store.with_slots(|s| s.release(&key));
            }
            return Err(e);
        }

        // An overwrite that converts Coalescing to Normal quiesces the
        // old slot's registers, then releases it.  The release happens
        // last so a failed quiesce leaves the slot bookkeeping matching
        // the still-stored prior node.
        if record.mirror_type == MirrorType::Normal && had_slot {
            let old_slot = self.store.with_slots(|s| s.get(&key));
            if let (Some(old_slot), Some(old)) = (old_slot, &prior) {
                if !self.in_hitless() {
                    self.codec.program_coal(
                        self.io.as_ref(),
                        &self.dev,
                        old_slot,
                        &old.record,
                        false,
                        &pipes,
                    )?;
                }
            }
            self.store.with_slots(|s| s.release(&key));
        }

        debug!(self.log, "set {key} enable={enable}");
        self.store.insert(node);
        Ok(())
    }

    /// Disable a session in hardware and, only if that succeeds, remove
    /// it from the store and release any coalescing slot it held.
    pub fn session_reset(
        &self,
        sid: SessionId,
        scope: PipeScope,
    ) -> MirrorResult<()> {
        self.check_sid_reserved(sid)?;
        let key = SessionKey::new(sid, scope);
        let Some(node) = self.store.get(&key) else {
            return Err(MirrorError::NotFound(format!("no such {key}")));
        };

        let mut disabled = node;
        disabled.enable_ingress = false;
        disabled.enable_egress = false;
        let pipes = self.selector(scope)?;
        self.program_node(&mut disabled, &pipes)?;

        self.store.remove(&key);
        if self.codec.dynamic_coal_slots() {
            self.store.with_slots(|s| s.release(&key));
        }
        debug!(self.log, "reset {key}");
        Ok(())
    }

    pub fn session_enable(
        &self,
        sid: SessionId,
        scope: PipeScope,
        direction: Direction,
    ) -> MirrorResult<()> {
        self.enable_or_disable(sid, scope, direction, true)
    }

    pub fn session_disable(
        &self,
        sid: SessionId,
        scope: PipeScope,
        direction: Direction,
    ) -> MirrorResult<()> {
        self.enable_or_disable(sid, scope, direction, false)
    }

    fn enable_or_disable(
        &self,
        sid: SessionId,
        scope: PipeScope,
        direction: Direction,
        enable: bool,
    ) -> MirrorResult<()> {
        self.check_sid_reserved(sid)?;
        if direction == Direction::None {
            return Err(MirrorError::Invalid(
                "a direction is required".to_string(),
            ));
        }
        self.update_node(SessionKey::new(sid, scope), |node| {
            match direction {
                Direction::Ingress => node.enable_ingress = enable,
                Direction::Egress => node.enable_egress = enable,
                Direction::Both => {
                    node.enable_ingress = enable;
                    node.enable_egress = enable;
                }
                Direction::None => unreachable!(),
            }
            if enable && node.record.direction != direction {
                node.record.direction = direction;
            }
            Ok(())
        })
    }

    /// Look up a stored session.  Scope `All` means "the all-pipes
    /// entry", not an aggregate across pipes.
    pub fn session_get(
        &self,
        sid: SessionId,
        scope: PipeScope,
    ) -> MirrorResult<SessionNode> {
        self.check_sid_reserved(sid)?;
        let key = SessionKey::new(sid, scope);
        self.store
            .get(&key)
            .ok_or_else(|| MirrorError::NotFound(format!("no such {key}")))
    }

    fn filter_matches(filter: PipeScope, node: &SessionNode) -> bool {
        match filter {
            PipeScope::All => true,
            PipeScope::Pipe(p) => node.scope == PipeScope::Pipe(p),
        }
    }

    /// The first stored session matching the filter, in (id, scope)
    /// order.  A specific-pipe filter selects only that pipe's own
    /// entries.  This is a linear scan of the store, O(sessions), not an
    /// indexed lookup.
    pub fn session_get_first(
        &self,
        filter: PipeScope,
    ) -> MirrorResult<SessionNode> {
        let mut cursor = self.store.first();
        while let Some(node) = cursor {
            if Self::filter_matches(filter, &node) {
                return Ok(node);
            }
            cursor = self.store.next(&node.key());
        }
        Err(MirrorError::NotFound("no sessions configured".to_string()))
    }

    /// The session following `cursor` that matches the filter.  Same
    /// linear-scan cost as [`Self::session_get_first`].
    pub fn session_get_next(
        &self,
        filter: PipeScope,
        cursor: SessionKey,
    ) -> MirrorResult<SessionNode> {
        let mut next = self.store.next(&cursor);
        while let Some(node) = next {
            if Self::filter_matches(filter, &node) {
                return Ok(node);
            }
            next = self.store.next(&node.key());
        }
        Err(MirrorError::NotFound(
            "no further sessions configured".to_string(),
        ))
    }

    /// The number of stored sessions matching the filter.
    pub fn session_get_count(&self, filter: PipeScope) -> usize {
        match filter {
            PipeScope::All => self.store.count(),
            PipeScope::Pipe(_) => {
                let mut count = 0;
                let mut cursor = self.store.first();
                while let Some(node) = cursor {
                    if Self::filter_matches(filter, &node) {
                        count += 1;
                    }
                    cursor = self.store.next(&node.key());
                }
                count
            }
        }
    }

    /// Replace a session's multicast pipe vector.  On Tofino3 the die
    /// routing vector is recomputed from the new mask.
    pub fn mcast_pipe_vector_set(
        &self,
        sid: SessionId,
        scope: PipeScope,
        pipe_vec: u8,
    ) -> MirrorResult<()> {
        self.check_sid_reserved(sid)?;
        if self.dev.num_pipes() < 8 && pipe_vec >> self.dev.num_pipes() != 0
        {
            return Err(MirrorError::Invalid(format!(
                "pipe vector {pipe_vec:#x} selects pipes beyond the \
                 device's {}",
                self.dev.num_pipes()
            )));
        }
        self.update_node(SessionKey::new(sid, scope), |node| {
            node.record.hw.set_pipe_vec(pipe_vec);
            Ok(())
        })
    }

    pub fn mcast_pipe_vector_get(
        &self,
        sid: SessionId,
        scope: PipeScope,
    ) -> MirrorResult<u8> {
        Ok(self.session_get(sid, scope)?.record.hw.pipe_vec())
    }

    /// Flip one config-source flag.  Tofino2/3 only.
    pub fn meta_flag_update(
        &self,
        sid: SessionId,
        scope: PipeScope,
        flag: MetaFlag,
        value: bool,
    ) -> MirrorResult<()> {
        self.check_entry_family()?;
        self.check_sid_reserved(sid)?;
        self.update_node(SessionKey::new(sid, scope), |node| {
            let entry = node.record.hw.entry_mut().ok_or_else(|| {
                MirrorError::Invalid(
                    "record carries no config flags".to_string(),
                )
            })?;
            match flag {
                MetaFlag::HashCfg => entry.cfg.hash_cfg = value,
                MetaFlag::IcosCfg => entry.cfg.icos_cfg = value,
                MetaFlag::DodCfg => entry.cfg.dod_cfg = value,
                MetaFlag::CopyToCpuCfg => {
                    entry.cfg.copy_to_cpu_cfg = value
                }
                MetaFlag::McCfg => entry.cfg.mc_cfg = value,
                MetaFlag::EpipeCfg => entry.cfg.epipe_cfg = value,
            }
            Ok(())
        })
    }

    pub fn meta_flag_get(
        &self,
        sid: SessionId,
        scope: PipeScope,
        flag: MetaFlag,
    ) -> MirrorResult<bool> {
        self.check_entry_family()?;
        let node = self.session_get(sid, scope)?;
        let entry = node.record.hw.entry().ok_or_else(|| {
            MirrorError::Invalid("record carries no config flags".to_string())
        })?;
        Ok(match flag {
            MetaFlag::HashCfg => entry.cfg.hash_cfg,
            MetaFlag::IcosCfg => entry.cfg.icos_cfg,
            MetaFlag::DodCfg => entry.cfg.dod_cfg,
            MetaFlag::CopyToCpuCfg => entry.cfg.copy_to_cpu_cfg,
            MetaFlag::McCfg => entry.cfg.mc_cfg,
            MetaFlag::EpipeCfg => entry.cfg.epipe_cfg,
        })
    }

    /// Update a session's priority.  Tofino2/3 only; writes hardware
    /// only when the value actually changes.
    pub fn priority_update(
        &self,
        sid: SessionId,
        scope: PipeScope,
        priority: SessionPriority,
    ) -> MirrorResult<()> {
        self.check_entry_family()?;
        self.check_sid_reserved(sid)?;
        self.update_node(SessionKey::new(sid, scope), |node| {
            let entry = node.record.hw.entry_mut().ok_or_else(|| {
                MirrorError::Invalid(
                    "record carries no priority".to_string(),
                )
            })?;
            entry.priority = priority;
            Ok(())
        })
    }

    pub fn priority_get(
        &self,
        sid: SessionId,
        scope: PipeScope,
    ) -> MirrorResult<SessionPriority> {
        self.check_entry_family()?;
        let node = self.session_get(sid, scope)?;
        node.record
            .hw
            .entry()
            .map(|e| e.priority)
            .ok_or_else(|| {
                MirrorError::Invalid("record carries no priority".to_string())
            })
    }

    /// Update a session's coalescing mode.  Tofino2/3 only; writes
    /// hardware only when the value actually changes.
    pub fn coal_mode_update(
        &self,
        sid: SessionId,
        scope: PipeScope,
        mode: CoalMode,
    ) -> MirrorResult<()> {
        self.check_entry_family()?;
        self.check_sid_reserved(sid)?;
        self.update_node(SessionKey::new(sid, scope), |node| {
            let entry = node.record.hw.entry_mut().ok_or_else(|| {
                MirrorError::Invalid(
                    "record carries no coalescing mode".to_string(),
                )
            })?;
            entry.coal_mode = mode;
            Ok(())
        })
    }

    pub fn coal_mode_get(
        &self,
        sid: SessionId,
        scope: PipeScope,
    ) -> MirrorResult<CoalMode> {
        self.check_entry_family()?;
        let node = self.session_get(sid, scope)?;
        node.record
            .hw
            .entry()
            .map(|e| e.coal_mode)
            .ok_or_else(|| {
                MirrorError::Invalid(
                    "record carries no coalescing mode".to_string(),
                )
            })
    }

    /// Rewrite one hardware slot in response to a memory-error signal.
    /// The operator's stored configuration wins when one exists; a slot
    /// no configuration covers is rewritten with well-defined all-zero
    /// content via a throwaway node that never enters the store.
    pub fn ecc_correct(
        &self,
        phys_pipe: PhysPipe,
        sid: SessionId,
    ) -> MirrorResult<()> {
        self.check_sid_reserved(sid)?;
        let pipe = self.dev.phys_to_log(phys_pipe)?;
        let mut pipes = PipeMap::new(self.dev.num_pipes() as usize);
        pipes.set(pipe as usize);

        let mut node = match self
            .store
            .get(&SessionKey::new(sid, PipeScope::All))
            .or_else(|| {
                self.store.get(&SessionKey::new(sid, PipeScope::Pipe(pipe)))
            }) {
            Some(node) => node,
            None => SessionNode {
                sid,
                scope: PipeScope::Pipe(pipe),
                enable_ingress: false,
                enable_egress: false,
                record: SessionRecord::zeroed(self.dev.family),
            },
        };

        debug!(
            self.log,
            "ecc correction for session {sid} on pipe {pipe}"
        );
        self.program_node(&mut node, &pipes)
    }

    /// Bulk convergence: walk the family's full id range and force
    /// hardware to match the store, zero-initializing every (id, pipe)
    /// slot no stored entry covers so stale state from a previous,
    /// differently-scoped session cannot leak through.  O(ids x pipes);
    /// run only at topology-(re)build time.
    pub fn cfg_sessions(&self) -> MirrorResult<()> {
        info!(self.log, "converging all mirror sessions");
        let max = self
            .codec
            .max_sid(MirrorType::Normal)
            .max(self.codec.max_sid(MirrorType::Coalescing));
        for sid in 1..=max {
            if let Some(mut node) =
                self.store.get(&SessionKey::new(sid, PipeScope::All))
            {
                let pipes = self.selector(PipeScope::All)?;
                self.program_node(&mut node, &pipes)?;
                continue;
            }

            let mut missing =
                PipeMap::new(self.dev.num_pipes() as usize);
            missing.set_all();
            for pipe in 0..self.dev.num_pipes() {
                let key = SessionKey::new(sid, PipeScope::Pipe(pipe));
                if let Some(mut node) = self.store.get(&key) {
                    let pipes = self.selector(PipeScope::Pipe(pipe))?;
                    self.program_node(&mut node, &pipes)?;
                    missing.clear(pipe as usize);
                }
            }
            if !missing.is_empty() {
                self.codec.init_one(
                    self.io.as_ref(),
                    &self.dev,
                    sid,
                    &missing,
                )?;
            }
        }
        Ok(())
    }
}

// Derive the per-direction enable flags from (enable, direction).
// Enabling a session whose direction is None is a request to mirror
// nothing, which is an error rather than a silent no-op.
fn derive_enables(
    direction: Direction,
    enable: bool,
) -> MirrorResult<(bool, bool)> {
    if !enable {
        return Ok((false, false));
    }
    match direction {
        Direction::None => Err(MirrorError::Invalid(
            "cannot enable a session with no direction".to_string(),
        )),
        Direction::Ingress => Ok((true, false)),
        Direction::Egress => Ok((false, true)),
        Direction::Both => Ok((true, true)),
    }
}
