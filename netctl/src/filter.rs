// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flower filter key vocabulary and identity.
//!
//! Grounded on the teacher's `tc/{chain,filter/mod}.rs` (chain/filter
//! identity shape) and on §6.2's flower key field catalogue.

use std::num::NonZero;

use net_types::ip::{Ipv4Match, Ipv6Match};
use net_types::mac::Mac;

use crate::action::Action;

/// A MAC (value, mask) match target. Unlike an IP prefix mask, an
/// ethernet mask need not be contiguous; flower accepts an arbitrary
/// 48-bit bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacMatch {
    pub value: Mac,
    pub mask: Mac,
}

impl MacMatch {
    /// An exact-match (mask = all ones).
    #[must_use]
    pub fn exact(value: Mac) -> MacMatch {
        MacMatch {
            value,
            mask: Mac([0xff; 6]),
        }
    }

    /// The value with the mask applied, used as the dedup key.
    #[must_use]
    pub fn masked_value(&self) -> Mac {
        let mut out = [0u8; 6];
        for i in 0..6 {
            out[i] = self.value.0[i] & self.mask.0[i];
        }
        Mac(out)
    }
}

/// One match target in a flower key. §6.2's key field catalogue:
/// `ETH_SRC/DST [mask]`, `IPV4_SRC/DST [mask]`, `IPV6_SRC/DST [mask]`,
/// `ETH_TYPE`, `ENC_KEY_ID`.
///
/// Per the mask contract for non-maskable targets, [`MatchField::EncKeyId`]
/// values are hard-zeroed beyond their semantic width (24 bits) by the
/// constructor the core's virt-rule engine uses; this type stores the
/// already-normalized value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchField {
    SrcMac(MacMatch),
    DstMac(MacMatch),
    SrcIpv4(Ipv4Match),
    DstIpv4(Ipv4Match),
    SrcIpv6(Ipv6Match),
    DstIpv6(Ipv6Match),
    EthType(u16),
    EncKeyId(u32),
}

impl MatchField {
    /// Hard-zero an `ENC_KEY_ID` value beyond its 24-bit semantic width.
    #[must_use]
    pub fn enc_key_id(raw: u32) -> MatchField {
        MatchField::EncKeyId(raw & 0x00FF_FFFF)
    }

    /// The masked value of this field, used to compute a flower rule's
    /// dedup key. For fields without a mask (`EthType`, `EncKeyId`) the
    /// value itself is the key.
    #[must_use]
    pub fn masked(&self) -> MatchField {
        match self {
            MatchField::SrcMac(m) => MatchField::SrcMac(MacMatch {
                value: m.masked_value(),
                mask: m.mask,
            }),
            MatchField::DstMac(m) => MatchField::DstMac(MacMatch {
                value: m.masked_value(),
                mask: m.mask,
            }),
            MatchField::SrcIpv4(m) => MatchField::SrcIpv4(Ipv4Match::new(m.masked_value(), m.mask()).unwrap_or(*m)),
            MatchField::DstIpv4(m) => MatchField::DstIpv4(Ipv4Match::new(m.masked_value(), m.mask()).unwrap_or(*m)),
            MatchField::SrcIpv6(m) => MatchField::SrcIpv6(Ipv6Match::new(m.masked_value(), m.mask()).unwrap_or(*m)),
            MatchField::DstIpv6(m) => MatchField::DstIpv6(Ipv6Match::new(m.masked_value(), m.mask()).unwrap_or(*m)),
            other => *other,
        }
    }
}

/// A chain index (`TcChain`), scoped to an interface or a shared block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ChainIndex(pub u32);

/// A flower filter priority, within `[1, 0xFFFF]` (`0` is reserved by the
/// kernel to mean "pick one").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Priority(NonZero<u16>);

impl Priority {
    /// Reserved priority for rate-limiter (policer) actions.
    pub const POLICING: u16 = 0xFF00;
    /// Reserved priority for the "match" fallback filter.
    pub const MATCH: u16 = 0xFF01;
    /// Reserved priority for the final fallback filter.
    pub const FALLBACK: u16 = 0xFF02;
    /// Reserved priority used by the broadcast replicator's source-copy filter.
    pub const SOURCE: u16 = 0xFF03;

    /// Build a [`Priority`] from a non-zero `u16`.
    #[must_use]
    pub fn new(raw: NonZero<u16>) -> Priority {
        Priority(raw)
    }

    /// Get the raw priority value.
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0.get()
    }
}

/// The identity of one flower rule (a single kernel filter, possibly
/// packing several sub-priority actions) within a `Prio` block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowerKey {
    pub fields: Vec<MatchField>,
}

impl FlowerKey {
    /// Build a dedup key by masking every field of `fields`.
    #[must_use]
    pub fn new(fields: Vec<MatchField>) -> FlowerKey {
        FlowerKey {
            fields: fields.iter().map(MatchField::masked).collect(),
        }
    }
}

/// One source entry inside a flower rule's action list, ordered by
/// sub-priority (lower sorts first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    pub sub_priority: u32,
    pub actions: Vec<Action>,
}

/// A single flower filter as materialized in the kernel: a key plus an
/// ordered, sub-priority-packed action list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowerRule {
    pub key: FlowerKey,
    pub sources: Vec<ActionEntry>,
}

impl FlowerRule {
    /// Flatten the sub-priority-ordered sources into the single ordered
    /// action list the kernel filter actually carries.
    #[must_use]
    pub fn flattened_actions(&self) -> Vec<Action> {
        let mut sorted = self.sources.clone();
        sorted.sort_by_key(|e| e.sub_priority);
        sorted.into_iter().flat_map(|e| e.actions).collect()
    }
}
