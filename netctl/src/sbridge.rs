// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The static-bridge helper (C6): destination-MAC routing by flower
//! filter, used by the `static-e2e` switching model (vxlan-static and
//! geneve network types).
//!
//! Grounded on the ruleset compiler (C3) for the bridge_if forwarding
//! table and on the broadcast replicator (C4) for each sbridge-if's
//! broadcast chain. Structure mirrors spec §4.5: a dummy `bridge_if`
//! device whose ingress ruleset matches `DST_MAC` exactly and runs a
//! per-route action list; a set of sbridge-ifs, each an ingress
//! classifier on one external phys-if that either redirects broadcast
//! traffic into the per-if broadcast chain or mirrors unicast traffic
//! into `bridge_if` for MAC lookup.

use net_types::mac::Mac;

use crate::action::{Action, GactVerdict, MirredMode, TunnelKeySet};
use crate::broadcast::{Broadcast, BroadcastEntryId};
use crate::error::NetlinkOpError;
use crate::filter::{ChainIndex, MacMatch, MatchField, Priority};
use crate::ifindex::{IfIndex, IfName};
use crate::kernel::{KernelHandle, LinkKind};
use crate::ruleset::{RuleError, Ruleset};

/// Collapse a ruleset write failure into the flat [`NetlinkOpError`]
/// surface this module otherwise returns; schema/priority-window
/// mismatches cannot occur here (this module always derives `Prio`
/// windows and match schemas internally) so they fold into `NoMem`
/// rather than being threaded through as a distinct error variant.
fn rule_err(e: RuleError) -> NetlinkOpError {
    match e {
        RuleError::Kernel(inner) => inner,
        RuleError::PriorityOutOfRange(_) | RuleError::Schema(_) | RuleError::Duplicate(_) => NetlinkOpError::NoMem,
    }
}

/// The chain on a phys-if's ingress qdisc that the classify ruleset (C6's
/// match/fallback priorities) is written to.
const CLASSIFY_CHAIN: ChainIndex = ChainIndex(0);
/// The chain a phys-if's match-priority filter `goto-chain`s into, and
/// where that phys-if's [`Broadcast`] replicator lives.
const BROADCAST_CHAIN: ChainIndex = ChainIndex(1);
/// The chain on `bridge_if`'s ingress qdisc the per-destination-MAC
/// forwarding table lives in.
const BRIDGE_CHAIN: ChainIndex = ChainIndex(0);

/// Handle to one sbridge-if (an external phys-if attached to the sbridge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SbridgeIfId(u32);

/// Handle to one route (an outgoing forwarding path terminating at one
/// sbridge-if, optionally carrying tunnel encapsulation metadata).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u32);

struct SbridgeIf {
    id: SbridgeIfId,
    phys_if: IfIndex,
    discriminator: Option<MatchField>,
    classify: Ruleset,
    broadcast: Broadcast,
}

struct Route {
    id: RouteId,
    target_if: SbridgeIfId,
    tunnel: Option<TunnelKeySet>,
    macs: Vec<Mac>,
}

/// One broadcast-replication action's co-ownership record: it lives in
/// `owner_if`'s broadcast chain and replicates traffic toward `route`.
/// Flushed from both sides when either the owning if or the route is
/// removed, per spec §4.5's "cleanup lists" contract.
struct CleanupEntry {
    owner_if: SbridgeIfId,
    route: RouteId,
    handle: BroadcastEntryId,
}

/// A static bridge: one dummy `bridge_if` device, its DST_MAC forwarding
/// table, and the set of sbridge-ifs/routes attached to it.
pub struct Sbridge {
    bridge_if: IfIndex,
    bridge_if_name: IfName,
    mac_ruleset: Ruleset,
    ifs: Vec<SbridgeIf>,
    routes: Vec<Route>,
    cleanup: Vec<CleanupEntry>,
    next_if_id: u32,
    next_route_id: u32,
}

fn tunnel_prelude(tunnel: Option<TunnelKeySet>) -> Vec<Action> {
    match tunnel {
        Some(t) => vec![Action::TunnelKeySet(t)],
        None => Vec::new(),
    }
}

impl Sbridge {
    /// Create the dummy `bridge_if` device and bring it up.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if link creation or `link_set_up` fails.
    pub async fn init(kernel: &impl KernelHandle, name: IfName) -> Result<Sbridge, NetlinkOpError> {
        let bridge_if = kernel.create_link(&name, LinkKind::Dummy).await?;
        kernel.link_set_up(bridge_if).await?;
        tracing::debug!(target: "netops", sbridge = name.as_str(), "sbridge initialized");
        Ok(Sbridge {
            bridge_if,
            bridge_if_name: name,
            mac_ruleset: Ruleset::new(bridge_if.to_u32(), BRIDGE_CHAIN, 1, 1),
            ifs: Vec::new(),
            routes: Vec::new(),
            cleanup: Vec::new(),
            next_if_id: 0,
            next_route_id: 0,
        })
    }

    /// The dummy `bridge_if` device's kernel ifindex.
    #[must_use]
    pub fn bridge_ifindex(&self) -> IfIndex {
        self.bridge_if
    }

    fn iface(&self, id: SbridgeIfId) -> Option<&SbridgeIf> {
        self.ifs.iter().find(|i| i.id == id)
    }

    fn iface_mut(&mut self, id: SbridgeIfId) -> Option<&mut SbridgeIf> {
        self.ifs.iter_mut().find(|i| i.id == id)
    }

    fn route(&self, id: RouteId) -> Option<&Route> {
        self.routes.iter().find(|r| r.id == id)
    }

    fn route_mut(&mut self, id: RouteId) -> Option<&mut Route> {
        self.routes.iter_mut().find(|r| r.id == id)
    }

    /// Attach a new phys-if to the sbridge (`phys_if_init`): installs its
    /// ingress classify ruleset (match-priority broadcast redirect,
    /// fallback-priority mirror into `bridge_if`) and pulls every
    /// existing route into its fresh broadcast chain.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if any kernel write fails.
    pub async fn add_sbridge_if(
        &mut self,
        kernel: &impl KernelHandle,
        phys_if: IfIndex,
        discriminator: Option<MatchField>,
    ) -> Result<SbridgeIfId, NetlinkOpError> {
        let id = SbridgeIfId(self.next_if_id);
        self.next_if_id += 1;

        let mut classify = Ruleset::new(phys_if.to_u32(), CLASSIFY_CHAIN, Priority::MATCH, 2);
        let mut match_fields = vec![MatchField::DstMac(MacMatch::exact(Mac::BROADCAST))];
        if let Some(d) = discriminator {
            match_fields.push(d);
        }
        classify
            .add_rule(
                kernel,
                0,
                match_fields,
                0,
                vec![Action::Gact(GactVerdict::GotoChain(BROADCAST_CHAIN.0))],
            )
            .await
            .map_err(rule_err)?;

        let fallback_fields = discriminator.map_or_else(Vec::new, |d| vec![d]);
        classify
            .add_rule(
                kernel,
                1,
                fallback_fields,
                0,
                vec![Action::Mirred {
                    mode: MirredMode::IngressRedirect,
                    to_ifindex: self.bridge_if.to_u32(),
                }],
            )
            .await
            .map_err(rule_err)?;

        let mut broadcast = Broadcast::new(phys_if.to_u32(), BROADCAST_CHAIN, 1);
        for route in &self.routes {
            let target = self
                .ifs
                .iter()
                .find(|i| i.id == route.target_if)
                .map(|i| i.phys_if)
                .ok_or(NetlinkOpError::NoMem)?;
            let mut actions = tunnel_prelude(route.tunnel);
            actions.push(Action::Mirred {
                mode: MirredMode::EgressMirror,
                to_ifindex: target.to_u32(),
            });
            let handle = broadcast.add(kernel, actions).await?;
            self.cleanup.push(CleanupEntry {
                owner_if: id,
                route: route.id,
                handle,
            });
        }

        self.ifs.push(SbridgeIf {
            id,
            phys_if,
            discriminator,
            classify,
            broadcast,
        });
        Ok(id)
    }

    /// Add a new route terminating at `target_if`, carrying optional
    /// tunnel encapsulation metadata. Pushes a broadcast-replication
    /// entry onto every *other* existing sbridge-if's broadcast chain.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `target_if` is unknown or a kernel
    /// write fails.
    pub async fn add_route(
        &mut self,
        kernel: &impl KernelHandle,
        target_if: SbridgeIfId,
        tunnel: Option<TunnelKeySet>,
    ) -> Result<RouteId, NetlinkOpError> {
        let target_phys_if = self
            .iface(target_if)
            .ok_or(NetlinkOpError::NoMem)?
            .phys_if;
        let id = RouteId(self.next_route_id);
        self.next_route_id += 1;

        let other_ids: Vec<SbridgeIfId> = self.ifs.iter().filter(|i| i.id != target_if).map(|i| i.id).collect();
        for other in other_ids {
            let mut actions = tunnel_prelude(tunnel);
            actions.push(Action::Mirred {
                mode: MirredMode::EgressMirror,
                to_ifindex: target_phys_if.to_u32(),
            });
            let iface = self.iface_mut(other).ok_or(NetlinkOpError::NoMem)?;
            let handle = iface.broadcast.add(kernel, actions).await?;
            self.cleanup.push(CleanupEntry {
                owner_if: other,
                route: id,
                handle,
            });
        }

        self.routes.push(Route {
            id,
            target_if,
            tunnel,
            macs: Vec::new(),
        });
        Ok(id)
    }

    /// Install a destination-MAC forwarding entry on `bridge_if` for
    /// `route` (`sbridge-mac(route, mac)`): `DST_MAC == mac` triggers the
    /// route's tunnel-metadata prelude followed by a redirect to the
    /// route's target phys-if.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `route` is unknown or the kernel
    /// write fails.
    pub async fn add_route_mac(
        &mut self,
        kernel: &impl KernelHandle,
        route: RouteId,
        mac: Mac,
    ) -> Result<(), NetlinkOpError> {
        let (tunnel, target_phys_if) = {
            let r = self.route(route).ok_or(NetlinkOpError::NoMem)?;
            let target = self.iface(r.target_if).ok_or(NetlinkOpError::NoMem)?.phys_if;
            (r.tunnel, target)
        };
        let mut actions = tunnel_prelude(tunnel);
        actions.push(Action::egress_redirect(target_phys_if.to_u32()));
        self.mac_ruleset
            .add_rule(kernel, 0, vec![MatchField::DstMac(MacMatch::exact(mac))], 0, actions)
            .await
            .map_err(rule_err)?;
        self.route_mut(route).ok_or(NetlinkOpError::NoMem)?.macs.push(mac);
        Ok(())
    }

    /// Remove a previously-installed destination-MAC entry.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if the kernel write fails.
    pub async fn remove_route_mac(
        &mut self,
        kernel: &impl KernelHandle,
        route: RouteId,
        mac: Mac,
    ) -> Result<(), NetlinkOpError> {
        self.mac_ruleset
            .remove_rule(kernel, 0, vec![MatchField::DstMac(MacMatch::exact(mac))], 0)
            .await
            .map_err(rule_err)?;
        if let Some(r) = self.route_mut(route) {
            r.macs.retain(|m| *m != mac);
        }
        Ok(())
    }

    /// Remove a route: flushes every broadcast-replication entry it owns
    /// (wherever it lives, across every other sbridge-if) and every
    /// destination-MAC rule it installed on `bridge_if`.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if a kernel write fails.
    pub async fn remove_route(
        &mut self,
        kernel: &impl KernelHandle,
        route: RouteId,
        decommit_disabled: bool,
    ) -> Result<(), NetlinkOpError> {
        let owned: Vec<(SbridgeIfId, BroadcastEntryId)> = self
            .cleanup
            .iter()
            .filter(|e| e.route == route)
            .map(|e| (e.owner_if, e.handle))
            .collect();
        for (owner_if, handle) in owned {
            if let Some(iface) = self.iface_mut(owner_if) {
                iface.broadcast.remove(kernel, handle, decommit_disabled).await?;
            }
        }
        self.cleanup.retain(|e| e.route != route);

        let macs = self.route(route).map(|r| r.macs.clone()).unwrap_or_default();
        for mac in macs {
            if !decommit_disabled {
                self.mac_ruleset
                    .remove_rule(kernel, 0, vec![MatchField::DstMac(MacMatch::exact(mac))], 0)
                    .await
                    .map_err(rule_err)?;
            }
        }
        self.routes.retain(|r| r.id != route);
        Ok(())
    }

    /// Remove a sbridge-if: any route terminating at it is removed first
    /// (cascading through [`Sbridge::remove_route`]'s own cleanup flush),
    /// then its own classify ruleset and broadcast chain are dropped.
    /// Kernel writes for the sbridge-if's *own* rulesets are elided: the
    /// underlying phys-if interface is expected to be destroyed by the
    /// caller in the same teardown step.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if a kernel write fails while removing
    /// a dependent route's replication entries on other sbridge-ifs.
    pub async fn remove_sbridge_if(
        &mut self,
        kernel: &impl KernelHandle,
        id: SbridgeIfId,
        decommit_disabled: bool,
    ) -> Result<(), NetlinkOpError> {
        let dependent_routes: Vec<RouteId> = self
            .routes
            .iter()
            .filter(|r| r.target_if == id)
            .map(|r| r.id)
            .collect();
        for route in dependent_routes {
            self.remove_route(kernel, route, decommit_disabled).await?;
        }
        self.cleanup.retain(|e| e.owner_if != id);
        self.ifs.retain(|i| i.id != id);
        Ok(())
    }

    /// Tear down the `bridge_if` device itself. Elided (no kernel write)
    /// when `decommit_disabled` is set.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `delete_link` fails.
    pub async fn free(self, kernel: &impl KernelHandle, decommit_disabled: bool) -> Result<(), NetlinkOpError> {
        if !decommit_disabled {
            kernel.delete_link(self.bridge_if).await?;
        }
        let _ = self.bridge_if_name;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::kernel::MockKernel;
    use net_types::ip::UnicastIpv4Addr;
    use net_types::port::UdpPort;
    use net_types::vnet_id::VnetId;
    use std::net::Ipv4Addr;

    async fn two_ifs(kernel: &MockKernel) -> (Sbridge, SbridgeIfId, SbridgeIfId) {
        let mut sb = Sbridge::init(kernel, IfName::new("sb0").unwrap()).await.unwrap();
        let p1 = kernel.create_link(&IfName::new("vx0").unwrap(), LinkKind::Dummy).await.unwrap();
        let p2 = kernel.create_link(&IfName::new("vx1").unwrap(), LinkKind::Dummy).await.unwrap();
        let if1 = sb.add_sbridge_if(kernel, p1, None).await.unwrap();
        let if2 = sb.add_sbridge_if(kernel, p2, None).await.unwrap();
        (sb, if1, if2)
    }

    fn tunnel() -> TunnelKeySet {
        TunnelKeySet {
            src: UnicastIpv4Addr::new(Ipv4Addr::new(172, 16, 0, 1)).unwrap(),
            dst: UnicastIpv4Addr::new(Ipv4Addr::new(172, 16, 0, 2)).unwrap(),
            vni: VnetId::new_checked(42).unwrap(),
            dst_port: UdpPort::VXLAN_DEFAULT,
        }
    }

    #[tokio::test]
    async fn new_route_pushes_broadcast_entry_onto_other_ifs() {
        let kernel = MockKernel::new();
        let (mut sb, _if1, if2) = two_ifs(&kernel).await;
        sb.add_route(&kernel, if2, Some(tunnel())).await.unwrap();
        assert_eq!(sb.cleanup.len(), 1);
        assert_eq!(sb.ifs[0].broadcast.filter_count(), 1);
        assert_eq!(sb.ifs[1].broadcast.filter_count(), 0);
    }

    #[tokio::test]
    async fn new_if_pulls_existing_routes() {
        let kernel = MockKernel::new();
        let mut sb = Sbridge::init(&kernel, IfName::new("sb0").unwrap()).await.unwrap();
        let p1 = kernel.create_link(&IfName::new("vx0").unwrap(), LinkKind::Dummy).await.unwrap();
        let if1 = sb.add_sbridge_if(&kernel, p1, None).await.unwrap();
        sb.add_route(&kernel, if1, None).await.unwrap();

        let p2 = kernel.create_link(&IfName::new("vx1").unwrap(), LinkKind::Dummy).await.unwrap();
        sb.add_sbridge_if(&kernel, p2, None).await.unwrap();
        assert_eq!(sb.ifs[1].broadcast.filter_count(), 1);
    }

    #[tokio::test]
    async fn route_mac_installs_one_bridge_if_filter() {
        let kernel = MockKernel::new();
        let (mut sb, _if1, if2) = two_ifs(&kernel).await;
        let route = sb.add_route(&kernel, if2, Some(tunnel())).await.unwrap();
        sb.add_route_mac(&kernel, route, Mac([0, 1, 2, 3, 4, 5])).await.unwrap();
        let creates = kernel
            .log()
            .into_iter()
            .filter(|r| matches!(r, crate::kernel::KernelRequest::CreateFlower { at } if at.ifindex == sb.bridge_ifindex().to_u32()))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn removing_route_flushes_broadcast_and_mac_entries() {
        let kernel = MockKernel::new();
        let (mut sb, _if1, if2) = two_ifs(&kernel).await;
        let route = sb.add_route(&kernel, if2, Some(tunnel())).await.unwrap();
        sb.add_route_mac(&kernel, route, Mac([0, 1, 2, 3, 4, 5])).await.unwrap();
        sb.remove_route(&kernel, route, false).await.unwrap();
        assert!(sb.cleanup.is_empty());
        assert_eq!(sb.ifs[0].broadcast.filter_count(), 0);
        assert!(sb.routes.is_empty());
    }

    #[tokio::test]
    async fn removing_sbridge_if_cascades_to_its_routes() {
        let kernel = MockKernel::new();
        let (mut sb, if1, if2) = two_ifs(&kernel).await;
        sb.add_route(&kernel, if2, None).await.unwrap();
        sb.remove_sbridge_if(&kernel, if2, false).await.unwrap();
        assert!(sb.routes.is_empty());
        assert!(sb.cleanup.is_empty());
        assert_eq!(sb.ifs.len(), 1);
        assert_eq!(sb.ifs[0].id, if1);
    }
}
