// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Phys attachment (PA, spec §3): the participation of one phys in one
//! network, plus the remote-PA/remote-virt views the commit engine
//! creates pairwise between every PA of a network.

use netctl::{IfIndex, RouteId, SbridgeIfId};

use crate::ids::{NetId, PaId, PhysId, RemotePaId, RemoteVirtId, VirtId};
use crate::state::ObjectState;

/// The kind-specific kernel state a local PA owns once committed (spec
/// §3: "kind-specific state (tunnel interface, bridge reference, sbridge
/// state)"). `None` until the PA's first `create_pa` commits.
pub enum PaKernelState {
    /// `direct` / `vlan` / `vxlan-mcast` / `vxlan-e2e`: a Linux bridge,
    /// plus (for every kind but `direct`) the tunnel/VLAN device enslaved
    /// to it as the network's shared uplink.
    Lbridge {
        bridge: netctl::Lbridge,
        tunnel_if: Option<IfIndex>,
    },
    /// `vxlan-static` / `geneve`: a static bridge wrapping this PA's
    /// (possibly network-dedicated, see `DESIGN.md`) metadata-mode tunnel
    /// device as its single sbridge-if.
    Sbridge {
        sbridge: netctl::Sbridge,
        tunnel_if: IfIndex,
        local_if: SbridgeIfId,
    },
}

impl std::fmt::Debug for PaKernelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaKernelState::Lbridge { tunnel_if, .. } => {
                f.debug_struct("Lbridge").field("tunnel_if", tunnel_if).finish()
            }
            PaKernelState::Sbridge { tunnel_if, local_if, .. } => f
                .debug_struct("Sbridge")
                .field("tunnel_if", tunnel_if)
                .field("local_if", local_if)
                .finish(),
        }
    }
}

/// One (phys, network) attachment.
#[derive(Debug)]
pub struct PhysAttachment {
    pub id: PaId,
    pub phys: PhysId,
    pub network: NetId,
    /// True iff the user explicitly called `attach`; false if this PA
    /// exists only to carry a virt connected through this phys (spec §3
    /// invariant 3).
    pub explicitly_attached: bool,
    pub connected_virts: Vec<VirtId>,
    pub remote_pas: Vec<RemotePaId>,
    pub kernel: Option<PaKernelState>,
    pub state: ObjectState,
}

impl PhysAttachment {
    #[must_use]
    pub fn new(id: PaId, phys: PhysId, network: NetId) -> PhysAttachment {
        PhysAttachment {
            id,
            phys,
            network,
            explicitly_attached: false,
            connected_virts: Vec::new(),
            remote_pas: Vec::new(),
            kernel: None,
            state: ObjectState::New,
        }
    }

    /// Spec §3 invariant 3: a PA must be freed once neither condition
    /// holds.
    #[must_use]
    pub fn should_exist(&self) -> bool {
        self.explicitly_attached || !self.connected_virts.is_empty()
    }
}

/// The kind-specific committed remote-reachability state a remote-PA view
/// owns (spec §4.6: "FDB entry for vxlan-e2e; sbridge route for
/// static-e2e and geneve").
#[derive(Debug, Clone, Copy)]
pub enum RemotePaKernelState {
    /// `direct` / `vlan` / `vxlan-mcast`: the kernel's own learning bridge
    /// handles reachability; no per-remote kernel state is owned here.
    None,
    /// `vxlan-e2e`: the all-zero-MAC FDB entry pointing at the remote's
    /// tunnel endpoint, installed on the local tunnel ifindex. The key is
    /// retained so `remove_remote_pa` can issue the matching
    /// `delete_fdb_entry` without re-deriving the remote address from the
    /// (by-then possibly already-freed) remote PA.
    Fdb(netctl::FdbKey),
    /// `vxlan-static` / `geneve`: the sbridge route carrying
    /// `tunnel_key set` metadata toward the remote endpoint.
    Route(RouteId),
}

/// A local PA's view of another PA of the same network (spec §3's
/// "remote-PA view"), created pairwise during commit (invariant 5).
#[derive(Debug)]
pub struct RemotePaView {
    pub id: RemotePaId,
    pub local_pa: PaId,
    pub remote_pa: PaId,
    pub remote_virts: Vec<RemoteVirtId>,
    pub kernel: RemotePaKernelState,
}

/// Whether a remote-virt view's destination-MAC entry is currently
/// installed on its owning remote-PA view's route (only meaningful for
/// `static-e2e`; `direct`/`vlan`/`vxlan-mcast`/`vxlan-e2e` never install
/// one, matching §4.6's "per remote MAC" scoping to static-e2e/geneve).
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteVirtKernelState {
    pub mac_installed: bool,
}

/// A remote-PA view's per-remote-virt destination-MAC entry.
#[derive(Debug)]
pub struct RemoteVirtView {
    pub id: RemoteVirtId,
    pub remote_pa_view: RemotePaId,
    pub remote_virt: VirtId,
    pub kernel: RemoteVirtKernelState,
}
