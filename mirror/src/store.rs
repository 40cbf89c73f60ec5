// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-device session store.
//!
//! One coarse mutex covers the node map and the coalescing-slot
//! allocator together, so a slot assignment and the node mutation it
//! belongs to are atomic with respect to other API sessions.  The lock is
//! held only for the in-memory operation; hardware programming happens
//! outside it, serialized by the SDE's per-device API-session admission.
//!
//! Lookups on a missing key return `None` rather than an error; the
//! caller decides whether that is routine or a failure.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use slog::Logger;

use crate::session::{SessionKey, SessionNode};
use crate::slots::CoalSlots;

struct StoreInner {
    nodes: BTreeMap<SessionKey, SessionNode>,
    slots: CoalSlots,
}

pub(crate) struct SessionStore {
    log: Logger,
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new(log: Logger, coal_slots: u8) -> Self {
        SessionStore {
            log,
            inner: Mutex::new(StoreInner {
                nodes: BTreeMap::new(),
                slots: CoalSlots::new(coal_slots),
            }),
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionNode> {
        self.inner.lock().unwrap().nodes.get(key).copied()
    }

    /// Insert a node, replacing (and thereby freeing) any node already
    /// stored under the same key.
    pub fn insert(&self, node: SessionNode) {
        let mut inner = self.inner.lock().unwrap();
        let key = node.key();
        if inner.nodes.insert(key, node).is_some() {
            slog::debug!(self.log, "replaced stored {key}");
        }
    }

    pub fn remove(&self, key: &SessionKey) -> Option<SessionNode> {
        self.inner.lock().unwrap().nodes.remove(key)
    }

    /// The first node in (sid, scope) order.
    pub fn first(&self) -> Option<SessionNode> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .first_key_value()
            .map(|(_, n)| *n)
    }

    /// The node following `key` in (sid, scope) order.  The cursor key
    /// itself need not still exist, so a walk survives interleaved
    /// inserts and removes.
    pub fn next(&self, key: &SessionKey) -> Option<SessionNode> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .range((Bound::Excluded(*key), Bound::Unbounded))
            .next()
            .map(|(_, n)| *n)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    /// The all-pipes XOR per-pipe exclusivity probe.  An all-pipes key
    /// conflicts with any per-pipe entry for the same id; a per-pipe key
    /// conflicts only with an all-pipes entry.  Per-pipe entries on
    /// distinct pipes coexist, and a same-key entry is an overwrite, not
    /// a conflict.
    pub fn scope_conflict(&self, key: &SessionKey) -> bool {
        use crate::session::PipeScope;

        let inner = self.inner.lock().unwrap();
        match key.scope {
            PipeScope::All => inner
                .nodes
                .range(SessionKey::new(key.sid, PipeScope::All)..)
                .take_while(|(k, _)| k.sid == key.sid)
                .any(|(k, _)| k.scope != PipeScope::All),
            PipeScope::Pipe(_) => inner
                .nodes
                .contains_key(&SessionKey::new(key.sid, PipeScope::All)),
        }
    }

    /// Run `f` with the coalescing-slot allocator, under the store lock.
    pub fn with_slots<T>(&self, f: impl FnOnce(&mut CoalSlots) -> T) -> T {
        f(&mut self.inner.lock().unwrap().slots)
    }
}
