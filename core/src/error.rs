// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The core's error taxonomy (spec §7), mirrored as `thiserror` enum
//! variants per `SPEC_FULL.md` §4.B.

use netctl::NetlinkOpError;

/// Errors raised by the object API (construction, attribute setters,
/// name lookups) and by `validate`/`commit`.
#[derive(Debug, thiserror::Error)]
pub enum LsdnError {
    /// Allocation failed (name registry full, arena exhausted). In this
    /// implementation this is raised only by [`crate::names`] duplicate
    /// checks' `Oom` path; a native Rust allocator failure is not
    /// modeled as a catchable error.
    #[error("out of memory")]
    NoMem,
    /// A string value failed to parse into its typed representation
    /// (MAC, IP, vnet id, priority, ...).
    #[error("parse error: {0}")]
    Parse(String),
    /// A uniqueness constraint was violated (duplicate name, duplicate
    /// rule key at one sub-priority).
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// A named kernel interface could not be resolved to an ifindex.
    #[error("no such interface: {0}")]
    NoIf(String),
    /// An OS-level failure unrelated to netlink (unused by this
    /// in-process model but kept in the taxonomy per spec §7).
    #[error("os error: {0}")]
    Os(String),
    /// A kernel (rtnetlink/TC) request failed.
    #[error("netlink error: {0}")]
    Netlink(#[from] NetlinkOpError),
    /// `validate()` found at least one problem; no kernel state was touched.
    #[error("validation failed")]
    Validate,
    /// `commit()` left at least one object in `Err`; kernel state is
    /// partial and a retry is meaningful.
    #[error("commit left one or more objects in an error state")]
    Commit,
    /// Decommit failed irrecoverably; the context is now inconsistent
    /// and must be reconstructed from scratch (spec §7).
    #[error("context is inconsistent; rebuild from scratch")]
    Inconsistent,
}

impl LsdnError {
    /// Collapse a [`NetlinkOpError`] into the pair of `ERR`/`FAIL`-driving
    /// taxonomy members a commit-phase hook is allowed to return, per
    /// spec §4.9's error classification table.
    #[must_use]
    pub fn classify_netlink(err: &NetlinkOpError) -> CommitOutcome {
        match err {
            NetlinkOpError::NoMem => CommitOutcome::NoMem,
            _ => CommitOutcome::Netlink,
        }
    }
}

/// The three ways a vtable hook's `Result` maps onto the commit engine's
/// per-object error classification (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Retriable: object → `Err`, problem `COMMIT_NETLINK`.
    Netlink,
    /// Retriable: object → `Err`, problem `COMMIT_NOMEM`.
    NoMem,
    /// Unrecoverable: object → `Fail`, context → inconsistent.
    Inconsistent,
}
