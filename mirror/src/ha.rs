// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Warm-restart reconciliation.
//!
//! A hitless warm init may not disturb the dataplane beyond what
//! actually changed, so the mirror state is never reprogrammed from
//! scratch.  Instead, phase 1 reads every session out of live hardware
//! into a transient "observed" store, the control plane replays its
//! configuration into the (software-only) session store, and phase 2
//! walks the replayed store writing hardware only where the two
//! disagree.  Whatever remains unmatched in the observed store was
//! never replayed and is zeroed out.
//!
//! A failure on one (session, pipe) pair is logged and reconciliation
//! continues; leaving the device half-reconciled over one bad session
//! would be worse than one stale session.

use std::collections::BTreeMap;

use slog::{debug, error, info, Logger};

use crate::codec::{FamilyCodec, HwSession};
use crate::mgr::MirrorMgr;
use crate::pipemap::PipeMap;
use crate::session::{MirrorType, PipeScope, SessionId};
use crate::types::{MirrorError, MirrorResult};
use ral::{DeviceInfo, PipeId, RegisterIo};

/// The transient hardware-observed store: every (session, pipe) pair the
/// hardware reports as programmed.  Built once in phase 1 and torn down
/// at the end of phase 2.
pub(crate) type Observed = BTreeMap<(SessionId, PipeId), HwSession>;

/// Phase 1: read every session slot on every pipe.  Reads only; the
/// hardware is not mutated.
pub(crate) fn snapshot(
    codec: &dyn FamilyCodec,
    io: &dyn RegisterIo,
    dev: &DeviceInfo,
    log: &Logger,
) -> MirrorResult<Observed> {
    let mut observed = Observed::new();
    let max = codec
        .max_sid(MirrorType::Normal)
        .max(codec.max_sid(MirrorType::Coalescing));
    for sid in 1..=max {
        for pipe in 0..dev.num_pipes() {
            if let Some(hw) = codec.read(io, dev, sid, pipe)? {
                observed.insert((sid, pipe), hw);
            }
        }
    }
    info!(
        log,
        "hardware snapshot holds {} programmed session slots",
        observed.len()
    );
    Ok(observed)
}

impl MirrorMgr {
    /// Phase 2: converge hardware to the replayed session store, then
    /// zero whatever the snapshot holds that was never replayed.  Ends
    /// the hitless window.
    pub fn reconcile(&self) -> MirrorResult<()> {
        let Some(mut observed) = self.observed.lock().unwrap().take()
        else {
            return Err(MirrorError::Invalid(
                "no hardware snapshot to reconcile against".to_string(),
            ));
        };

        // Programming resumes now; replay is over.
        self.hitless
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let mut reprogrammed = 0;
        let mut matched = 0;
        let mut failures = 0;

        let mut cursor = self.store.first();
        while let Some(node) = cursor {
            let covered: Vec<PipeId> = match node.scope {
                PipeScope::All => (0..self.dev.num_pipes()).collect(),
                PipeScope::Pipe(p) => vec![p],
            };
            // A replayed coalescing session may have been assigned a
            // different slot than the one it held before the restart;
            // that counts as a mismatch even when every record field
            // agrees.
            let expected_slot = self.slot_for(&node).unwrap_or(None);
            for pipe in covered {
                // The enable flags are compared first, independently of
                // the codec's field comparison.
                let stale = match observed.remove(&(node.sid, pipe)) {
                    None => true,
                    Some(hw) => {
                        hw.enable_ingress != node.enable_ingress
                            || hw.enable_egress != node.enable_egress
                            || hw.coal_slot != expected_slot
                            || !self.codec.fields_match(
                                &hw.record,
                                &node.record,
                            )
                    }
                };
                if !stale {
                    matched += 1;
                    continue;
                }
                let mut pipes =
                    PipeMap::new(self.dev.num_pipes() as usize);
                pipes.set(pipe as usize);
                let mut replayed = node;
                if let Err(e) = self.program_node(&mut replayed, &pipes) {
                    error!(
                        self.log,
                        "failed to converge {} on pipe {pipe}: {e}",
                        node.key()
                    );
                    failures += 1;
                } else {
                    reprogrammed += 1;
                }
            }
            cursor = self.store.next(&node.key());
        }

        // Whatever is left in the snapshot existed in hardware but was
        // never replayed; scrub it.
        let leftovers = observed.len();
        for (sid, pipe) in observed.into_keys() {
            let mut pipes = PipeMap::new(self.dev.num_pipes() as usize);
            pipes.set(pipe as usize);
            debug!(
                self.log,
                "zeroing unreplayed session {sid} on pipe {pipe}"
            );
            if let Err(e) = self.codec.init_one(
                self.io.as_ref(),
                &self.dev,
                sid,
                &pipes,
            ) {
                error!(
                    self.log,
                    "failed to zero session {sid} on pipe {pipe}: {e}"
                );
                failures += 1;
            }
        }

        info!(
            self.log,
            "warm-restart reconciliation complete";
            "matched" => matched,
            "reprogrammed" => reprogrammed,
            "zeroed" => leftovers,
            "failures" => failures,
        );
        Ok(())
    }
}
