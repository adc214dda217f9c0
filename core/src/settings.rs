// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Settings (spec §3): a reusable bundle naming the encapsulation and
//! switching model a [`crate::network::Network`] uses.

use net_types::ip::MulticastIpv4Addr;
use net_types::port::UdpPort;

use crate::ids::SettingsId;
use crate::state::ObjectState;

/// The reserved name returned by `by_name` lookup when the user never
/// created settings of their own (spec §3 invariant 1).
pub const DEFAULT_SETTINGS_NAME: &str = "default";

/// The encapsulation kind a settings bundle selects (spec §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncapKind {
    Direct,
    Vlan,
    VxlanMcast,
    VxlanE2e,
    VxlanStatic,
    Geneve,
}

/// The switching model a settings bundle implies (spec §3/§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchingModel {
    /// Kernel-learning Linux bridge (`direct`, `vlan`, `vxlan-mcast`).
    Learning,
    /// Learning VXLAN plus explicit FDB entries (`vxlan-e2e`).
    LearningE2e,
    /// Flower-based static bridge (`vxlan-static`, `geneve`).
    StaticE2e,
}

/// Kind-specific parameters carried by a settings bundle.
#[derive(Debug, Clone)]
pub enum EncapParams {
    Direct,
    Vlan,
    VxlanMcast {
        port: UdpPort,
        group: MulticastIpv4Addr,
    },
    VxlanE2e {
        port: UdpPort,
    },
    /// `vxlan-static` carries a shared metadata-mode tunnel device,
    /// ref-counted across every network that uses these settings (spec
    /// §4.6: "one shared metadata-mode VXLAN per settings"). The shared
    /// tunnel interface/ruleset themselves live on the committed side
    /// (populated once the first local PA commits) and are tracked by
    /// [`crate::vtable`]; this struct carries only the port and refcount.
    VxlanStatic {
        port: UdpPort,
        shared_tunnel_refs: u32,
    },
    Geneve {
        port: UdpPort,
        shared_tunnel_refs: u32,
    },
}

/// Callbacks fired once at the beginning of commit for each (local phys
/// × attached network) pair using these settings (spec §4.9 "Startup
/// hooks").
pub struct UserHooks {
    pub startup: Option<Box<dyn FnMut(crate::ids::NetId, crate::ids::PhysId)>>,
    pub shutdown: Option<Box<dyn FnMut(crate::ids::NetId, crate::ids::PhysId)>>,
}

impl std::fmt::Debug for UserHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserHooks")
            .field("startup", &self.startup.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .finish()
    }
}

/// A settings entity.
#[derive(Debug)]
pub struct Settings {
    pub id: SettingsId,
    pub name: String,
    pub encap: EncapKind,
    pub switching: SwitchingModel,
    pub params: EncapParams,
    pub hooks: Option<UserHooks>,
    pub state: ObjectState,
}

impl Settings {
    #[must_use]
    pub fn direct(id: SettingsId, name: String) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::Direct,
            switching: SwitchingModel::Learning,
            params: EncapParams::Direct,
            hooks: None,
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn vlan(id: SettingsId, name: String) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::Vlan,
            switching: SwitchingModel::Learning,
            params: EncapParams::Vlan,
            hooks: None,
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn vxlan_mcast(id: SettingsId, name: String, group: MulticastIpv4Addr, port: UdpPort) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::VxlanMcast,
            switching: SwitchingModel::Learning,
            params: EncapParams::VxlanMcast { port, group },
            hooks: None,
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn vxlan_e2e(id: SettingsId, name: String, port: UdpPort) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::VxlanE2e,
            switching: SwitchingModel::LearningE2e,
            params: EncapParams::VxlanE2e { port },
            hooks: None,
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn vxlan_static(id: SettingsId, name: String, port: UdpPort) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::VxlanStatic,
            switching: SwitchingModel::StaticE2e,
            params: EncapParams::VxlanStatic {
                port,
                shared_tunnel_refs: 0,
            },
            hooks: None,
            state: ObjectState::New,
        }
    }

    #[must_use]
    pub fn geneve(id: SettingsId, name: String, port: UdpPort) -> Settings {
        Settings {
            id,
            name,
            encap: EncapKind::Geneve,
            switching: SwitchingModel::StaticE2e,
            params: EncapParams::Geneve {
                port,
                shared_tunnel_refs: 0,
            },
            hooks: None,
            state: ObjectState::New,
        }
    }

    pub fn register_hooks(&mut self, hooks: UserHooks) {
        self.hooks = Some(hooks);
        self.state.mark_mutated();
    }

    /// The UDP port this settings' tunnel (if any) listens on, used by
    /// the vxlan-static shared-tunnel port-based dedup check (spec §10
    /// decision iii).
    #[must_use]
    pub fn tunnel_port(&self) -> Option<UdpPort> {
        match self.params {
            EncapParams::VxlanMcast { port, .. }
            | EncapParams::VxlanE2e { port }
            | EncapParams::VxlanStatic { port, .. }
            | EncapParams::Geneve { port, .. } => Some(port),
            EncapParams::Direct | EncapParams::Vlan => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn vxlan_e2e_uses_learning_e2e_switching() {
        let s = Settings::vxlan_e2e(SettingsId(0), "s".to_string(), UdpPort::VXLAN_DEFAULT);
        assert_eq!(s.switching, SwitchingModel::LearningE2e);
        assert_eq!(s.tunnel_port(), Some(UdpPort::VXLAN_DEFAULT));
    }

    #[test]
    fn direct_has_no_tunnel_port() {
        let s = Settings::direct(SettingsId(0), "s".to_string());
        assert_eq!(s.tunnel_port(), None);
    }
}
