// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Phys (spec §3): one physical host in the fleet-wide model.

use std::net::IpAddr;

use crate::iface::IfaceHandle;
use crate::ids::{PaId, PhysId};
use crate::state::ObjectState;

/// A physical host entity.
#[derive(Debug)]
pub struct Phys {
    pub id: PhysId,
    pub name: String,
    /// The kernel device name this phys' local traffic egresses through
    /// (`direct`'s bridge member, `vlan`'s parent device, the underlay
    /// nexthop for tunnels). Required for local physes (`PHYS_NOATTR`).
    pub iface: Option<IfaceHandle>,
    /// The phys' tunnel-endpoint / segment address. All PAs of one
    /// network must agree on IP version (`PHYS_INCOMPATIBLE_IPV`); no two
    /// physes may share one IP (`PHYS_DUPATTR`).
    pub ip: Option<IpAddr>,
    /// Whether this phys represents "this machine" (spec §3 invariant 9).
    pub is_local: bool,
    /// Whether the last successful commit actually materialised local
    /// kernel state for this phys.
    pub committed_as_local: bool,
    /// PAs this phys currently participates in.
    pub attachments: Vec<PaId>,
    pub state: ObjectState,
}

impl Phys {
    #[must_use]
    pub fn new(id: PhysId) -> Phys {
        Phys {
            id,
            name: String::new(),
            iface: None,
            ip: None,
            is_local: false,
            committed_as_local: false,
            attachments: Vec::new(),
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn ip_is_v4(&self) -> Option<bool> {
        self.ip.map(|ip| ip.is_ipv4())
    }
}
