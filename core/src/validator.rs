// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The validator (C9, spec §4.8): a single read-only pass over the
//! object graph that buffers every [`Problem`] it finds rather than
//! failing on the first one, so one `validate`/`commit` call reports
//! everything wrong with the model at once.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::ids::{NetId, PaId, PhysId, VirtId};
use crate::network::Network;
use crate::pa::PhysAttachment;
use crate::phys::Phys;
use crate::problem::{Problem, ProblemCode, Ref};
use crate::rule::{Direction, VirtRule};
use crate::settings::{EncapKind, Settings};
use crate::state::ObjectState;
use crate::virt::Virt;
use crate::vtable;

/// A read-only view of the pieces of the object graph the validator
/// needs. Constructed by [`crate::context::Context`] right before
/// `validate`/`commit`; kept separate from `Context` itself so this pass
/// can be unit-tested against hand-built graphs.
pub struct ValidatorInput<'a> {
    pub settings: &'a [&'a Settings],
    pub networks: &'a [&'a Network],
    pub physes: &'a [&'a Phys],
    pub pas: &'a [&'a PhysAttachment],
    pub virts: &'a [&'a Virt],
    pub rules: &'a [&'a VirtRule],
}

/// Run the full six-step validation pass of spec §4.8, buffering every
/// fault found into `problems`. Returns `true` iff zero problems were
/// buffered (the model may be committed).
#[must_use]
pub fn validate(input: &ValidatorInput<'_>, problems: &mut Vec<Problem>) -> bool {
    let start = problems.len();

    // Step 1 (state propagation) is the commit engine's job at the start
    // of `commit()` (deleted children force their parents to re-evaluate
    // `should_exist`); the validator only ever reads the state that
    // propagation has already settled, consistent with `validate()` never
    // mutating the graph (spec §4.8 preamble).

    check_net_dupid_and_nettype(input, problems);
    check_virt_rules(input, problems);
    check_phys(input, problems);
    check_virt(input, problems);

    problems.len() == start
}

/// The upper bound (exclusive) of a legal VXLAN/GENEVE vnet-id, spec §3:
/// "`vnet_id` for VXLAN/GENEVE is accepted in `[0, 2²⁴)`".
const VNET_ID_LIMIT: u32 = 1 << 24;

/// Step 2: cross-network duplicate vnet-id / out-of-range vnet-id /
/// incompatible-switching-model port sharing (`NET_DUPID`, `NET_BADID`,
/// `NET_BAD_NETTYPE`).
fn check_net_dupid_and_nettype(input: &ValidatorInput<'_>, problems: &mut Vec<Problem>) {
    let settings_by_id: HashMap<_, _> = input.settings.iter().map(|s| (s.id, *s)).collect();

    // Keyed on (nettype, vnet_id), not (settings object, vnet_id): two
    // networks on distinct settings bundles of the same encapsulation kind
    // still collide on the same kernel-visible VNI (spec §4.8 step 2 /
    // §7 open question iii).
    let mut by_vnet_id: HashMap<(EncapKind, u32), NetId> = HashMap::new();
    for net in committed_networks(input) {
        let Some(settings) = settings_by_id.get(&net.settings) else {
            continue;
        };
        let key = (settings.encap, net.vnet_id);
        if let Some(&other) = by_vnet_id.get(&key) {
            problems.push(Problem::new(ProblemCode::NetDupId, vec![Ref::Net(net.id), Ref::Net(other)]));
        } else {
            by_vnet_id.insert(key, net.id);
        }
        let needs_range_check = matches!(
            settings.encap,
            EncapKind::VxlanMcast | EncapKind::VxlanE2e | EncapKind::VxlanStatic | EncapKind::Geneve
        );
        if needs_range_check && net.vnet_id >= VNET_ID_LIMIT {
            problems.push(Problem::new(ProblemCode::NetBadId, vec![Ref::Net(net.id)]));
        }
    }

    let mut by_port: HashMap<u16, Vec<&Network>> = HashMap::new();
    for net in committed_networks(input) {
        let Some(settings) = settings_by_id.get(&net.settings) else {
            continue;
        };
        if let Some(port) = settings.tunnel_port() {
            by_port.entry(port.as_u16()).or_default().push(net);
        }
    }
    for group in by_port.values() {
        for pair in group.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let sa = settings_by_id[&a.settings];
            let sb = settings_by_id[&b.settings];
            if sa.switching != sb.switching {
                problems.push(Problem::new(ProblemCode::NetBadNettype, vec![Ref::Net(a.id), Ref::Net(b.id)]));
            }
        }
    }
}

fn committed_networks<'a>(input: &'a ValidatorInput<'a>) -> impl Iterator<Item = &'a Network> + 'a {
    input
        .networks
        .iter()
        .copied()
        .filter(|n| n.state != ObjectState::Delete)
}

/// Step 3/4: per-network virt MAC duplicates and virt-rule schema
/// conflicts (`VIRT_DUPATTR`, `VR_INCOMPATIBLE_MATCH`, `VR_DUPLICATE_RULE`).
fn check_virt_rules(input: &ValidatorInput<'_>, problems: &mut Vec<Problem>) {
    let mut by_mac: HashMap<(NetId, [u8; 6]), VirtId> = HashMap::new();
    for virt in live_virts(input) {
        let Some(mac) = virt.mac else { continue };
        let key = (virt.network, mac.0);
        if let Some(&other) = by_mac.get(&key) {
            problems.push(Problem::new(
                ProblemCode::VirtDupAttr,
                vec![Ref::Virt(virt.id), Ref::Virt(other)],
            ));
        } else {
            by_mac.insert(key, virt.id);
        }
    }

    let mut groups: HashMap<(VirtId, Direction, u16), Vec<&VirtRule>> = HashMap::new();
    for rule in input.rules {
        groups.entry((rule.virt, rule.direction, rule.priority)).or_default().push(rule);
    }
    for group in groups.values() {
        let Some(first) = group.first() else { continue };
        let schema = first.schema();
        let mut seen_keys: HashMap<Vec<_>, usize> = HashMap::new();
        for (i, rule) in group.iter().enumerate() {
            if rule.schema() != schema {
                problems.push(Problem::new(ProblemCode::VrIncompatibleMatch, vec![Ref::Virt(rule.virt)]));
            }
            let key = rule.masked_key();
            if let Some(&other) = seen_keys.get(&key) {
                let _ = other;
                problems.push(Problem::new(ProblemCode::VrDuplicateRule, vec![Ref::Virt(rule.virt)]));
            } else {
                seen_keys.insert(key, i);
            }
        }
    }
}

fn live_virts<'a>(input: &'a ValidatorInput<'a>) -> impl Iterator<Item = &'a Virt> + 'a {
    input.virts.iter().copied().filter(|v| v.state != ObjectState::Delete)
}

/// Step 5: per-phys attachment preconditions (`PHYS_NOATTR`,
/// `PHYS_DUPATTR`, `PHYS_INCOMPATIBLE_IPV`, `PHYS_NOT_ATTACHED`), plus the
/// kind-specific [`vtable::validate_pa`] hook.
fn check_phys(input: &ValidatorInput<'_>, problems: &mut Vec<Problem>) {
    let physes_by_id: HashMap<PhysId, &Phys> = input.physes.iter().map(|p| (p.id, *p)).collect();
    let networks_by_id: HashMap<NetId, &Network> = input.networks.iter().map(|n| (n.id, *n)).collect();
    let settings_by_id: HashMap<_, _> = input.settings.iter().map(|s| (s.id, *s)).collect();

    for pa in live_pas(input) {
        let Some(phys) = physes_by_id.get(&pa.phys) else { continue };
        if phys.is_local && phys.iface.is_none() {
            problems.push(Problem::new(ProblemCode::PhysNoAttr, vec![Ref::Phys(pa.phys)]));
        }
        if !pa.explicitly_attached && !pa.connected_virts.is_empty() {
            // A PA that exists purely to carry a connected virt, but whose
            // phys was never explicitly attached to the network, violates
            // invariant 3's "connect requires (eventual) attach".
            problems.push(Problem::new(
                ProblemCode::PhysNotAttached,
                vec![Ref::Phys(pa.phys), Ref::Net(pa.network), Ref::Net(pa.network)],
            ));
        }
        if let Some(net) = networks_by_id.get(&pa.network) {
            if let Some(settings) = settings_by_id.get(&net.settings) {
                if !vtable::validate_pa(settings.encap) {
                    problems.push(Problem::new(ProblemCode::PhysNoAttr, vec![Ref::Phys(pa.phys)]));
                }
            }
        }
    }

    let mut ip_by_phys: HashMap<IpAddr, PhysId> = HashMap::new();
    for phys in input.physes.iter().copied().filter(|p| p.state != ObjectState::Delete) {
        let Some(ip) = phys.ip else { continue };
        if let Some(&other) = ip_by_phys.get(&ip) {
            problems.push(Problem::new(ProblemCode::PhysDupAttr, vec![Ref::Phys(phys.id), Ref::Phys(other)]));
        } else {
            ip_by_phys.insert(ip, phys.id);
        }
    }

    for net in committed_networks(input) {
        let mut saw_v4 = false;
        let mut saw_v6 = false;
        for pa_id in &net.attachments {
            let Some(pa) = find_pa(input, *pa_id) else { continue };
            let Some(phys) = physes_by_id.get(&pa.phys) else { continue };
            match phys.ip_is_v4() {
                Some(true) => saw_v4 = true,
                Some(false) => saw_v6 = true,
                None => {}
            }
        }
        if saw_v4 && saw_v6 {
            problems.push(Problem::new(ProblemCode::PhysIncompatibleIpv, vec![Ref::Net(net.id)]));
        }
    }
}

fn live_pas<'a>(input: &'a ValidatorInput<'a>) -> impl Iterator<Item = &'a PhysAttachment> + 'a {
    input.pas.iter().copied().filter(|p| p.state != ObjectState::Delete)
}

fn find_pa<'a>(input: &'a ValidatorInput<'a>, id: PaId) -> Option<&'a PhysAttachment> {
    input.pas.iter().copied().find(|p| p.id == id)
}

/// Step 6: per-virt `VIRT_NOIF` (a virt connected through a PA that is
/// both explicitly attached and local must have a resolved interface,
/// mirroring `validate_virts_pa`'s `pa->explicitly_attached &&
/// pa->phys->is_local` gate — a virt reached only through a remote or
/// implicitly-attached PA has no local interface to resolve in the first
/// place) plus [`vtable::validate_virt`].
fn check_virt(input: &ValidatorInput<'_>, problems: &mut Vec<Problem>) {
    let networks_by_id: HashMap<NetId, &Network> = input.networks.iter().map(|n| (n.id, *n)).collect();
    let settings_by_id: HashMap<_, _> = input.settings.iter().map(|s| (s.id, *s)).collect();
    let physes_by_id: HashMap<PhysId, &Phys> = input.physes.iter().map(|p| (p.id, *p)).collect();

    for virt in live_virts(input) {
        if let Some(conn) = &virt.connected {
            if let Some(pa) = find_pa(input, conn.pa) {
                let phys_is_local = physes_by_id.get(&pa.phys).is_some_and(|p| p.is_local);
                if pa.explicitly_attached && phys_is_local && !virt.iface.is_resolved() {
                    problems.push(Problem::new(ProblemCode::VirtNoIf, vec![Ref::Virt(virt.id)]));
                }
            }
        }
        if let Some(net) = networks_by_id.get(&virt.network) {
            if let Some(settings) = settings_by_id.get(&net.settings) {
                if !vtable::validate_virt(settings.encap) {
                    problems.push(Problem::new(ProblemCode::VirtNoAttr, vec![Ref::Virt(virt.id)]));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::ids::SettingsId;

    fn base_network(id: u32, settings: u32, vnet_id: u32) -> Network {
        Network::new(NetId(id), SettingsId(settings), vnet_id)
    }

    #[test]
    fn duplicate_vnet_id_under_same_settings_is_flagged() {
        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let a = base_network(0, 0, 42);
        let b = base_network(1, 0, 42);
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&a, &b],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        assert!(problems.iter().any(|p| p.code == ProblemCode::NetDupId));
    }

    #[test]
    fn duplicate_vnet_id_across_distinct_settings_of_same_nettype_is_flagged() {
        let a_settings =
            Settings::vxlan_e2e(SettingsId(0), "a".to_string(), net_types::port::UdpPort::VXLAN_DEFAULT);
        let b_settings =
            Settings::vxlan_e2e(SettingsId(1), "b".to_string(), net_types::port::UdpPort::GENEVE_DEFAULT);
        let a = base_network(0, 0, 42);
        let b = base_network(1, 1, 42);
        let input = ValidatorInput {
            settings: &[&a_settings, &b_settings],
            networks: &[&a, &b],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        assert!(problems.iter().any(|p| p.code == ProblemCode::NetDupId));
    }

    #[test]
    fn distinct_vnet_ids_are_not_flagged() {
        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let a = base_network(0, 0, 1);
        let b = base_network(1, 0, 2);
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&a, &b],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(validate(&input, &mut problems));
    }

    #[test]
    fn out_of_range_vxlan_vnet_id_is_flagged_badid() {
        let settings = Settings::vxlan_e2e(SettingsId(0), "s".to_string(), net_types::port::UdpPort::VXLAN_DEFAULT);
        let net = base_network(0, 0, VNET_ID_LIMIT);
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&net],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        assert!(problems.iter().any(|p| p.code == ProblemCode::NetBadId));
    }

    #[test]
    fn direct_nettype_ignores_vnet_id_range() {
        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let net = base_network(0, 0, u32::MAX);
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&net],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(validate(&input, &mut problems));
    }

    #[test]
    fn virt_noif_fires_only_for_explicitly_attached_local_pa() {
        use crate::ids::VirtId;
        use crate::virt::{Connection, Virt};

        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let net = base_network(0, 0, 1);

        let mut local_phys = Phys::new(PhysId(0));
        local_phys.is_local = true;
        let mut remote_phys = Phys::new(PhysId(1));
        remote_phys.is_local = false;

        let mut attached_pa = PhysAttachment::new(PaId(0), PhysId(0), NetId(0));
        attached_pa.explicitly_attached = true;
        let mut implicit_pa = PhysAttachment::new(PaId(1), PhysId(1), NetId(0));
        implicit_pa.explicitly_attached = false;

        let mut unresolved_local = Virt::new(VirtId(0), NetId(0));
        unresolved_local.connected = Some(Connection { phys: PhysId(0), pa: PaId(0) });

        let mut unresolved_remote = Virt::new(VirtId(1), NetId(0));
        unresolved_remote.connected = Some(Connection { phys: PhysId(1), pa: PaId(1) });

        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&net],
            physes: &[&local_phys, &remote_phys],
            pas: &[&attached_pa, &implicit_pa],
            virts: &[&unresolved_local, &unresolved_remote],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        let noif: Vec<_> = problems.iter().filter(|p| p.code == ProblemCode::VirtNoIf).collect();
        assert_eq!(noif.len(), 1);
        assert_eq!(noif[0].refs, vec![Ref::Virt(VirtId(0))]);
    }

    #[test]
    fn phys_missing_iface_is_flagged_noattr() {
        let mut phys = Phys::new(PhysId(0));
        phys.ip = Some(IpAddr::from([10, 0, 0, 1]));
        phys.is_local = true;
        let net = base_network(0, 0, 1);
        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let mut pa = PhysAttachment::new(PaId(0), PhysId(0), NetId(0));
        pa.explicitly_attached = true;
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&net],
            physes: &[&phys],
            pas: &[&pa],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        assert!(problems.iter().any(|p| p.code == ProblemCode::PhysNoAttr));
    }

    #[test]
    fn remote_phys_missing_iface_is_not_flagged() {
        let mut phys = Phys::new(PhysId(0));
        phys.ip = Some(IpAddr::from([10, 0, 0, 1]));
        phys.is_local = false;
        let net = base_network(0, 0, 1);
        let settings = Settings::direct(SettingsId(0), "s".to_string());
        let mut pa = PhysAttachment::new(PaId(0), PhysId(0), NetId(0));
        pa.explicitly_attached = true;
        let input = ValidatorInput {
            settings: &[&settings],
            networks: &[&net],
            physes: &[&phys],
            pas: &[&pa],
            virts: &[],
            rules: &[],
        };
        let mut problems = Vec::new();
        assert!(validate(&input, &mut problems));
        assert!(!problems.iter().any(|p| p.code == ProblemCode::PhysNoAttr));
    }

    #[test]
    fn rules_with_same_kind_but_different_mask_are_flagged_incompatible() {
        use crate::ids::VirtId;
        use crate::rule::MatchTarget;
        use net_types::ip::Ipv4Match;
        use std::net::Ipv4Addr;

        let mut a = VirtRule::new(VirtId(0), 0, Direction::In).unwrap();
        a.add_target(MatchTarget::SrcIpv4(Ipv4Match::host(Ipv4Addr::new(10, 0, 0, 1))))
            .unwrap();
        let mut b = VirtRule::new(VirtId(1), 0, Direction::In).unwrap();
        b.add_target(MatchTarget::SrcIpv4(
            Ipv4Match::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 0)).unwrap(),
        ))
        .unwrap();

        let input = ValidatorInput {
            settings: &[],
            networks: &[],
            physes: &[],
            pas: &[],
            virts: &[],
            rules: &[&a, &b],
        };
        let mut problems = Vec::new();
        assert!(!validate(&input, &mut problems));
        assert!(problems.iter().any(|p| p.code == ProblemCode::VrIncompatibleMatch));
    }
}
