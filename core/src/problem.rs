// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Problem reporting (spec §6.3): the validator and commit engine buffer
//! `Problem`s rather than failing fast, so a single `validate`/`commit`
//! call can report every fault it finds in one pass.

use std::fmt::Write as _;

use net_types::mac::Mac;

use crate::ids::{NetId, PaId, PhysId, VirtId, VrId};

/// Maximum number of [`Ref`]s buffered per [`Problem`] (spec §6.3).
pub const MAX_PROBLEM_REFS: usize = 4;

/// A tagged reference to the subject of a [`Problem`] (spec §6.3's
/// `{attr-name, phys, net, virt, iface, pa, vr, net-id, end}`).
#[derive(Debug, Clone)]
pub enum Ref {
    AttrName(String),
    Phys(PhysId),
    Net(NetId),
    Virt(VirtId),
    Iface(String),
    Pa(PaId),
    Vr(VrId),
    NetId(u32),
    Mac(Mac),
    /// Sentinel marking "no further refs" (mirrors the original format
    /// string's `end` ref kind, kept for symmetry with spec §6.3; this
    /// implementation never needs to emit it explicitly since `Problem`
    /// is a typed `Vec<Ref>` rather than a C varargs list).
    End,
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ref::AttrName(name) => write!(f, "attribute '{name}'"),
            Ref::Phys(id) => write!(f, "phys {id}"),
            Ref::Net(id) => write!(f, "network {id}"),
            Ref::Virt(id) => write!(f, "virt {id}"),
            Ref::Iface(name) => write!(f, "interface '{name}'"),
            Ref::Pa(id) => write!(f, "attachment {id}"),
            Ref::Vr(id) => write!(f, "rule {id}"),
            Ref::NetId(vnet) => write!(f, "vnet-id {vnet}"),
            Ref::Mac(mac) => write!(f, "mac {mac}"),
            Ref::End => write!(f, ""),
        }
    }
}

/// The problem codes of spec §6.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemCode {
    PhysNoAttr,
    PhysNotAttached,
    PhysDupAttr,
    PhysIncompatibleIpv,
    VirtNoIf,
    VirtNoAttr,
    VirtDupAttr,
    VrIncompatibleMatch,
    VrDuplicateRule,
    NetDupId,
    NetBadId,
    NetBadNettype,
    CommitNetlink,
    CommitNetlinkCleanup,
    CommitNoMem,
    NoNlSock,
}

impl ProblemCode {
    /// The default stderr format string, using `%o` placeholders
    /// positionally replaced by each [`Ref`]'s `Display` (spec §6.3: "a
    /// default stderr formatter is provided; format strings use `%o`
    /// placeholders that are replaced by `format_subject(ref)`").
    #[must_use]
    pub fn format_string(self) -> &'static str {
        match self {
            ProblemCode::PhysNoAttr => "%o has no iface attribute set",
            ProblemCode::PhysNotAttached => "%o is connected through %o which is not attached to %o",
            ProblemCode::PhysDupAttr => "%o has the same ip address as %o",
            ProblemCode::PhysIncompatibleIpv => "%o has an ip version incompatible with other attachments of %o",
            ProblemCode::VirtNoIf => "%o's interface %o could not be resolved",
            ProblemCode::VirtNoAttr => "%o is missing a required attribute %o",
            ProblemCode::VirtDupAttr => "%o has the same mac as %o",
            ProblemCode::VrIncompatibleMatch => "%o has a match schema incompatible with other rules at its priority",
            ProblemCode::VrDuplicateRule => "%o duplicates the key of %o",
            ProblemCode::NetDupId => "%o has the same vnet-id as %o",
            ProblemCode::NetBadId => "%o has a vnet-id out of range",
            ProblemCode::NetBadNettype => "%o shares a udp port with %o under an incompatible switching model",
            ProblemCode::CommitNetlink => "commit of %o failed with a netlink error",
            ProblemCode::CommitNetlinkCleanup => "decommit of %o failed with a netlink error",
            ProblemCode::CommitNoMem => "commit of %o failed: out of memory",
            ProblemCode::NoNlSock => "no netlink socket is available",
        }
    }
}

/// One buffered validation/commit fault: a code plus up to
/// [`MAX_PROBLEM_REFS`] tagged subjects.
#[derive(Debug, Clone)]
pub struct Problem {
    pub code: ProblemCode,
    pub refs: Vec<Ref>,
}

impl Problem {
    #[must_use]
    pub fn new(code: ProblemCode, refs: Vec<Ref>) -> Problem {
        let mut refs = refs;
        refs.truncate(MAX_PROBLEM_REFS);
        Problem { code, refs }
    }

    /// Render this problem via its code's `%o`-templated format string,
    /// substituting refs positionally (spec §6.3's default formatter).
    #[must_use]
    pub fn format_default(&self) -> String {
        let mut out = String::new();
        let mut refs = self.refs.iter();
        for part in self.code.format_string().split("%o") {
            out.push_str(part);
            if let Some(r) = refs.next() {
                let _ = write!(out, "{r}");
            }
        }
        out
    }
}

/// A `problem_cb` usable as the callback argument to `validate`/`commit`:
/// formats each problem and writes it to stderr, matching the original's
/// default reporter.
pub fn report_to_stderr(problem: &Problem) {
    eprintln!("{}", problem.format_default());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_default_substitutes_refs_positionally() {
        let p = Problem::new(
            ProblemCode::NetDupId,
            vec![Ref::Net(NetId(1)), Ref::Net(NetId(2))],
        );
        assert_eq!(p.format_default(), "network 1 has the same vnet-id as network 2");
    }

    #[test]
    fn refs_are_truncated_to_max() {
        let refs = vec![
            Ref::Net(NetId(0)),
            Ref::Net(NetId(1)),
            Ref::Net(NetId(2)),
            Ref::Net(NetId(3)),
            Ref::Net(NetId(4)),
        ];
        let p = Problem::new(ProblemCode::NetDupId, refs);
        assert_eq!(p.refs.len(), MAX_PROBLEM_REFS);
    }
}
