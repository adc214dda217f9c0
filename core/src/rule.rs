// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virt rules (C8 sub-part, §4.7): per-virt firewall entries, grouped by
//! `(direction, priority)` into one `Ruleset::Prio` per group at commit
//! time.

use std::net::{Ipv4Addr, Ipv6Addr};

use net_types::ip::{Ipv4Match, Ipv6Match};
use net_types::mac::Mac;
use netctl::{MacMatch, MatchField};

use crate::error::LsdnError;
use crate::ids::VirtId;

/// Maximum match targets per virt rule (spec §3 invariant 7).
pub const MAX_MATCH_TARGETS: usize = 4;

/// The sub-priority every virt-rule entry is packed at within its
/// `Prio` (spec §4.7: "each rule adds one entry at sub-priority
/// `VR_SUBPRIO`" — there is exactly one rule per masked key per group,
/// so a fixed sub-priority is sufficient; duplicate masked keys within
/// one group are rejected by the validator, not disambiguated here).
pub const VR_SUBPRIO: u32 = 0;

/// Traffic direction a virt rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// The only action a virt rule supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Drop,
}

/// One match target appended to a [`VirtRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchTarget {
    SrcMac(Mac, Mac),
    DstMac(Mac, Mac),
    SrcIpv4(Ipv4Match),
    DstIpv4(Ipv4Match),
    SrcIpv6(Ipv6Match),
    DstIpv6(Ipv6Match),
    EncKeyId(u32),
}

impl MatchTarget {
    #[must_use]
    pub fn to_match_field(self) -> MatchField {
        match self {
            MatchTarget::SrcMac(value, mask) => MatchField::SrcMac(MacMatch { value, mask }),
            MatchTarget::DstMac(value, mask) => MatchField::DstMac(MacMatch { value, mask }),
            MatchTarget::SrcIpv4(m) => MatchField::SrcIpv4(m),
            MatchTarget::DstIpv4(m) => MatchField::DstIpv4(m),
            MatchTarget::SrcIpv6(m) => MatchField::SrcIpv6(m),
            MatchTarget::DstIpv6(m) => MatchField::DstIpv6(m),
            MatchTarget::EncKeyId(raw) => MatchField::enc_key_id(raw),
        }
    }

    /// The match-target's schema entry: its kind plus its mask, compared
    /// across rules in one group (spec §3 invariant 6), independent of the
    /// concrete matched value.
    #[must_use]
    fn schema(&self) -> TargetSchema {
        match self {
            MatchTarget::SrcMac(_, mask) => TargetSchema::SrcMac(*mask),
            MatchTarget::DstMac(_, mask) => TargetSchema::DstMac(*mask),
            MatchTarget::SrcIpv4(m) => TargetSchema::SrcIpv4(m.mask()),
            MatchTarget::DstIpv4(m) => TargetSchema::DstIpv4(m.mask()),
            MatchTarget::SrcIpv6(m) => TargetSchema::SrcIpv6(m.mask()),
            MatchTarget::DstIpv6(m) => TargetSchema::DstIpv6(m.mask()),
            MatchTarget::EncKeyId(_) => TargetSchema::EncKeyId,
        }
    }
}

/// One match target's schema entry: its kind and, where the target carries
/// one, its mask. Two targets with the same kind but different masks (e.g.
/// `src_ipv4 /32` vs `src_ipv4 /24`) are distinct schema entries, since a
/// `Ruleset::Prio` pins both the match-field kinds and their masks (spec §3
/// invariant 6: "match-target set and masks must be identical").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetSchema {
    SrcMac(Mac),
    DstMac(Mac),
    SrcIpv4(Ipv4Addr),
    DstIpv4(Ipv4Addr),
    SrcIpv6(Ipv6Addr),
    DstIpv6(Ipv6Addr),
    EncKeyId,
}

/// A maximum priority a virt rule may carry (spec §8 boundary: `[0, 0x8000)`).
pub const MAX_PRIORITY: u16 = 0x8000;

/// One virt firewall rule.
#[derive(Debug, Clone)]
pub struct VirtRule {
    pub virt: VirtId,
    pub direction: Direction,
    pub priority: u16,
    pub targets: Vec<MatchTarget>,
    pub action: RuleAction,
}

impl VirtRule {
    /// Construct a new rule with no match targets yet.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::Parse`] if `priority` is outside `[0, 0x8000)`.
    pub fn new(virt: VirtId, priority: u16, direction: Direction) -> Result<VirtRule, LsdnError> {
        if priority >= MAX_PRIORITY {
            return Err(LsdnError::Parse(format!(
                "virt rule priority {priority} is outside [0, 0x8000)"
            )));
        }
        Ok(VirtRule {
            virt,
            direction,
            priority,
            targets: Vec::new(),
            action: RuleAction::Drop,
        })
    }

    /// Append a match target.
    ///
    /// # Errors
    ///
    /// Returns [`LsdnError::Parse`] if the rule already carries
    /// [`MAX_MATCH_TARGETS`] targets.
    pub fn add_target(&mut self, target: MatchTarget) -> Result<(), LsdnError> {
        if self.targets.len() >= MAX_MATCH_TARGETS {
            return Err(LsdnError::Parse(format!(
                "virt rule already has the maximum of {MAX_MATCH_TARGETS} match targets"
            )));
        }
        self.targets.push(target);
        Ok(())
    }

    /// The rule's match-target schema (kind and mask, per target), used by
    /// the validator to compare rules within one `(direction, priority)`
    /// group (spec §3 invariant 6 / §4.8 step 4's `VR_INCOMPATIBLE_MATCH`).
    /// Two rules whose targets share kinds but differ in mask (e.g.
    /// `src_ipv4 /32` vs `src_ipv4 /24`) are flagged, since they would
    /// otherwise collide against the `Prio`'s single pinned schema at
    /// commit.
    #[must_use]
    pub(crate) fn schema(&self) -> Vec<TargetSchema> {
        self.targets.iter().map(MatchTarget::schema).collect()
    }

    /// The masked key used to detect duplicate rules within one group
    /// (`VR_DUPLICATE_RULE`).
    #[must_use]
    pub fn masked_key(&self) -> Vec<MatchField> {
        self.targets.iter().map(|t| t.to_match_field().masked()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    fn id() -> VirtId {
        VirtId(0)
    }

    #[test]
    fn rejects_priority_at_boundary() {
        assert!(VirtRule::new(id(), MAX_PRIORITY, Direction::In).is_err());
        assert!(VirtRule::new(id(), MAX_PRIORITY - 1, Direction::In).is_ok());
    }

    #[test]
    fn fifth_target_is_rejected() {
        let mut r = VirtRule::new(id(), 0, Direction::In).unwrap();
        for _ in 0..MAX_MATCH_TARGETS {
            r.add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 1))))
                .unwrap();
        }
        assert!(r
            .add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 2))))
            .is_err());
    }

    #[test]
    fn schema_reflects_target_kinds_and_masks_not_values() {
        let mut a = VirtRule::new(id(), 0, Direction::In).unwrap();
        a.add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 1))))
            .unwrap();
        let mut b = VirtRule::new(id(), 0, Direction::In).unwrap();
        b.add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 2))))
            .unwrap();
        assert_eq!(a.schema(), b.schema());
    }

    #[test]
    fn schema_differs_for_same_kind_with_different_mask() {
        let mut a = VirtRule::new(id(), 0, Direction::In).unwrap();
        a.add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 1))))
            .unwrap();
        let mut b = VirtRule::new(id(), 0, Direction::In).unwrap();
        b.add_target(MatchTarget::SrcIpv4(
            Ipv4Match::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 0)).unwrap(),
        ))
        .unwrap();
        assert_ne!(a.schema(), b.schema());
    }
}
