// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Error types shared across the mirror subsystem.

use ral::RalError;

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// The request is malformed: a field out of range, a knob applied to
    /// a family that lacks it, or a pipe-scope conflict.  Detected before
    /// any hardware write.
    #[error("Invalid argument: {0}")]
    Invalid(String),
    /// The named object does not exist: a session id out of the family's
    /// range, or a lookup for a session that was never set.
    #[error("Object not found: {0}")]
    NotFound(String),
    /// A scarce resource is exhausted; the caller may retry after freeing
    /// resources elsewhere.
    #[error("Out of resources: {0}")]
    Exhausted(String),
    /// A failure surfaced verbatim from the register layer.
    #[error("Hardware error: {0}")]
    Hw(#[from] RalError),
}
