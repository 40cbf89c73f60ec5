// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Mirror-session management for the Tofino family of switch ASICs.
//!
//! A mirror session is a hardware rule that duplicates selected packets
//! toward a monitoring destination, optionally coalescing many samples
//! into one larger packet.  This crate owns the full lifecycle of those
//! sessions: request validation, the per-family register encodings, the
//! per-device session store, and the warm-restart reconciliation that
//! converges live hardware with replayed intent.
//!
//! The register plumbing itself (DMA, instruction lists) is reached
//! through [`ral::RegisterIo`]; everything above that line lives here.

mod codec;
mod ha;
mod mgr;
pub mod pipemap;
pub mod session;
mod slots;
mod store;
mod types;

pub use mgr::MetaFlag;
pub use mgr::MirrorMgr;
pub use types::MirrorError;
pub use types::MirrorResult;
