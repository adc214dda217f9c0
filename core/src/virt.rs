// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Virt (spec §3): a virtual machine's network endpoint on a phys.

use net_types::mac::Mac;
use netctl::Ruleset;

use crate::iface::IfaceHandle;
use crate::ids::{NetId, PaId, PhysId, VirtId, VrId};
use crate::state::ObjectState;

/// The MTU sentinel `virt_get_recommended_mtu` returns when the phys/PA
/// cannot be resolved (spec `SPEC_FULL.md` §5 item 4), preserved from the
/// original `lsdn_virt_get_recommended_mtu`.
pub const MTU_UNKNOWN: u32 = 0xFFFF;

/// A rate-limit spec attached to a virt's `in` or `out` direction (spec
/// §3: `{avg_Bps, burst_bytes, burst_Bps}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate {
    pub avg_bps: u64,
    pub burst_bytes: u32,
    pub burst_bps: Option<u64>,
}

/// The committed policer handles for a virt, installed per §4.7's
/// direction-swap contract: `rate_in` polices the egress-side ruleset
/// (traffic heading toward the virt), `rate_out` polices the ingress-side
/// ruleset (traffic the virt sends). Kept as a plain marker here; the
/// actual flower-filter bookkeeping lives in the per-direction
/// [`crate::vtable`]-owned ruleset, identified by the reserved
/// `Priority::POLICING` slot, so no separate handle needs to be retained
/// once installed — `Some(())` only records "a policer is installed here"
/// for the decommit phase to know whether a removal is owed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommittedPolicers {
    pub rate_in_installed: bool,
    pub rate_out_installed: bool,
}

/// Where a virt is connected, and the name of the kernel interface it
/// should be spliced into the network at (spec §6.1 `connect(phys,
/// iface_name)`).
#[derive(Debug, Clone)]
pub struct Connection {
    pub phys: PhysId,
    pub pa: PaId,
}

/// The two directional rulesets bound to a committed virt's own interface
/// (spec §4.7): one on its ingress qdisc (`Direction::In`), one on its
/// `prio` egress root (`Direction::Out`). Each reserves the window `[0,
/// Priority::POLICING]` so ordinary virt-rule priorities and the one
/// reserved policer slot share a single `Ruleset` per direction.
pub struct VirtKernelState {
    pub ruleset_in: Ruleset,
    pub ruleset_out: Ruleset,
}

impl std::fmt::Debug for VirtKernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtKernelState").finish_non_exhaustive()
    }
}

/// A virt entity.
#[derive(Debug)]
pub struct Virt {
    pub id: VirtId,
    pub network: NetId,
    pub name: String,
    /// Where the user most recently asked this virt to connect. May
    /// differ from `committed_to` immediately after a migration (spec §3:
    /// "may differ from committed-PA after migration").
    pub connected: Option<Connection>,
    /// The phys this virt's kernel state was actually committed against.
    pub committed_to: Option<PhysId>,
    pub iface: IfaceHandle,
    pub mac: Option<Mac>,
    pub rate_in: Option<Rate>,
    pub rate_out: Option<Rate>,
    pub rules: Vec<VrId>,
    pub committed_policers: CommittedPolicers,
    pub kernel: Option<VirtKernelState>,
    pub state: ObjectState,
}

impl Virt {
    #[must_use]
    pub fn new(id: VirtId, network: NetId) -> Virt {
        Virt {
            id,
            network,
            name: String::new(),
            connected: None,
            committed_to: None,
            iface: IfaceHandle::Unset,
            mac: None,
            rate_in: None,
            rate_out: None,
            rules: Vec::new(),
            committed_policers: CommittedPolicers::default(),
            kernel: None,
            state: ObjectState::New,
        }
    }
}
