// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Network (spec §3): a logical L2 domain bound to one [`crate::settings::Settings`]
//! bundle, carrying a vnet-id and the set of phys attachments/virts that
//! participate in it.

use crate::ids::{NetId, PaId, SettingsId, VirtId};
use crate::names::NameRegistry;
use crate::state::ObjectState;

/// A network entity.
#[derive(Debug)]
pub struct Network {
    pub id: NetId,
    pub name: String,
    /// The 32-bit tenant id; constrained to `[0, 2^24)` for VXLAN/GENEVE
    /// encapsulations (spec §3; enforced by `validator::check_net_dupid_and_nettype`
    /// via `NET_BADID`), unconstrained for `direct` and `vlan` (the `vlan`
    /// encapsulation uses it verbatim as the 802.1Q tag passed to the
    /// kernel's VLAN child-device creation; the kernel itself rejects an
    /// out-of-range tag, so no separate `[0, 4096)` check is specified).
    pub vnet_id: u32,
    pub settings: SettingsId,
    pub attachments: Vec<PaId>,
    pub virts: Vec<VirtId>,
    pub virt_names: NameRegistry,
    pub state: ObjectState,
}

impl Network {
    #[must_use]
    pub fn new(id: NetId, settings: SettingsId, vnet_id: u32) -> Network {
        Network {
            id,
            name: String::new(),
            vnet_id,
            settings,
            attachments: Vec::new(),
            virts: Vec::new(),
            virt_names: NameRegistry::new(),
            state: ObjectState::New,
        }
    }
}
