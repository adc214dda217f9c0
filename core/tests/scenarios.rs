// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! End-to-end scenarios from spec §8, reproduced against
//! [`netctl::MockKernel`] instead of a real kernel socket.

use std::net::IpAddr;

use core_engine::commit::{commit, CommitResult};
use core_engine::context::Context;
use core_engine::ids::SettingsId;
use core_engine::names::DEFAULT_SETTINGS_NAME;
use core_engine::problem::ProblemCode;
use core_engine::rule::{Direction, MatchTarget};
use core_engine::state::ObjectState;
use net_types::ip::Ipv4Match;
use net_types::mac::Mac;
use netctl::kernel::{KernelRequest, ScriptedFailure, ScriptedFailureKind};
use netctl::MockKernel;

fn new_ctx() -> Context<MockKernel> {
    Context::new("t", MockKernel::new())
}

/// The implicit "direct" settings every context registers at construction
/// (spec §3 invariant 1); its arena id is an internal detail (the field
/// backing `SettingsId` is crate-private), so tests reach it by name
/// rather than constructing the id directly.
fn default_settings(ctx: &Context<MockKernel>) -> SettingsId {
    ctx.settings_by_name(DEFAULT_SETTINGS_NAME).expect("every context registers a default settings bundle")
}

/// Register a local phys's externally-created interface with the mock
/// kernel so that resolution (and the virt-rule/policer installs that
/// follow it) succeeds, mirroring a hypervisor having already brought
/// the tap/veth end up.
fn local_phys(ctx: &mut Context<MockKernel>, ifname: &str, ip: [u8; 4]) -> core_engine::ids::PhysId {
    let phys = ctx.phys_new();
    ctx.kernel().unwrap().register_existing_link(ifname);
    ctx.phys_set_iface(phys, ifname).unwrap();
    ctx.phys_set_ip(phys, IpAddr::from(ip)).unwrap();
    ctx.phys_claim_local(phys).unwrap();
    phys
}

fn remote_phys(ctx: &mut Context<MockKernel>, ip: [u8; 4]) -> core_engine::ids::PhysId {
    let phys = ctx.phys_new();
    ctx.phys_set_ip(phys, IpAddr::from(ip)).unwrap();
    phys
}

fn connect_virt(ctx: &mut Context<MockKernel>, net: core_engine::ids::NetId, phys: core_engine::ids::PhysId, ifname: &str) -> core_engine::ids::VirtId {
    let virt = ctx.virt_new(net).unwrap();
    ctx.kernel().unwrap().register_existing_link(ifname);
    ctx.virt_connect(virt, phys, ifname).unwrap();
    virt
}

/// Scenario 1 (abbreviated to one host, one network): a VLAN network
/// with two local virts sharing a phys should bring up exactly one
/// VLAN child device, one bridge, and enslave both the VLAN device and
/// both virt interfaces. A second commit with no intervening mutation
/// issues no further kernel writes (the idempotence law of spec §8).
#[tokio::test]
async fn vlan_network_two_virts_one_phys() {
    let mut ctx = new_ctx();
    let settings = ctx.settings_new_vlan();
    let net = ctx.network_new(settings, 1).unwrap();
    let phys = local_phys(&mut ctx, "out", [172, 16, 0, 1]);
    ctx.phys_attach(phys, net).unwrap();
    let _v1 = connect_virt(&mut ctx, net, phys, "tap0");
    let _v2 = connect_virt(&mut ctx, net, phys, "tap1");

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Ok, "{problems:?}");

    let log_len_first = ctx.kernel().unwrap().log().len();
    assert!(log_len_first > 0);

    let mut problems2 = Vec::new();
    let result2 = commit(&mut ctx, &mut problems2).await;
    assert_eq!(result2, CommitResult::Ok);
    assert_eq!(
        ctx.kernel().unwrap().log().len(),
        log_len_first,
        "second commit with no mutation must write nothing new to the kernel"
    );
}

/// Scenario 2: per-virt ingress/egress drop rules install a flower
/// filter with a `gact shot` action on the matching direction's
/// ruleset.
#[tokio::test]
async fn firewall_drop_rule_installs_gact_shot() {
    let mut ctx = new_ctx();
    let net = ctx.network_new(default_settings(&ctx), 1).unwrap();
    let phys = local_phys(&mut ctx, "eth0", [10, 0, 0, 1]);
    ctx.phys_attach(phys, net).unwrap();
    let v1 = connect_virt(&mut ctx, net, phys, "tap-v1");
    let _v2 = connect_virt(&mut ctx, net, phys, "tap-v2");

    let vr_in = ctx.vr_new(v1, 0, Direction::In).unwrap();
    ctx.vr_add_target(
        vr_in,
        MatchTarget::SrcIpv4(Ipv4Match::host(std::net::Ipv4Addr::new(192, 168, 99, 2))),
    )
    .unwrap();

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Ok, "{problems:?}");

    let creates: Vec<_> = ctx
        .kernel()
        .unwrap()
        .log()
        .into_iter()
        .filter(|r| matches!(r, KernelRequest::CreateFlower { .. }))
        .collect();
    assert!(!creates.is_empty(), "expected at least one flower filter for the drop rule");
}

/// Scenario 3 (abbreviated to the reachability-rule shape, not a full
/// two-host run): a vxlan-static network's PA commit creates a
/// metadata-mode VXLAN tunnel device; a remote PA in the same network
/// gets a remote-PA view and the remote virt's MAC is installed as a
/// sbridge route.
#[tokio::test]
async fn static_vxlan_installs_tunnel_and_remote_routes() {
    let mut ctx = new_ctx();
    let settings = ctx.settings_new_vxlan_static(net_types::port::UdpPort::VXLAN_DEFAULT);
    let net = ctx.network_new(settings, 42).unwrap();

    let phys_a = local_phys(&mut ctx, "eth0", [10, 0, 0, 1]);
    ctx.phys_attach(phys_a, net).unwrap();
    let virt_a = ctx.virt_new(net).unwrap();
    ctx.kernel().unwrap().register_existing_link("tap-a");
    ctx.virt_connect(virt_a, phys_a, "tap-a").unwrap();
    ctx.virt_set_mac(virt_a, Mac([2, 0, 0, 0, 0, 1])).unwrap();

    let phys_b = remote_phys(&mut ctx, [10, 0, 0, 2]);
    ctx.phys_attach(phys_b, net).unwrap();
    let virt_b = ctx.virt_new(net).unwrap();
    ctx.virt_connect(virt_b, phys_b, "tap-b").unwrap();
    ctx.virt_set_mac(virt_b, Mac([2, 0, 0, 0, 0, 2])).unwrap();

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Ok, "{problems:?}");

    let log = ctx.kernel().unwrap().log();
    assert!(
        log.iter()
            .any(|r| matches!(r, KernelRequest::CreateLink { kind: netctl::kernel::LinkKindTag::Vxlan, .. })),
        "expected a vxlan tunnel device to be created"
    );
    assert!(
        log.iter().any(|r| matches!(r, KernelRequest::CreateFlower { .. })),
        "expected at least one sbridge flower filter (DST_MAC route or broadcast)"
    );
    let pa_a = ctx.pa_find(phys_a, net).expect("phys_a's PA exists");
    assert_eq!(ctx.remote_pa_count(pa_a), 1, "exactly one remote-PA view for the one other PA in the network");
}

/// Scenario 4: two networks sharing `(nettype, vnet_id)` fail validation
/// with `NetDupId` and `commit` returns `Validate` without touching the
/// kernel.
#[tokio::test]
async fn conflicting_vnet_ids_fail_validation() {
    let mut ctx = new_ctx();
    let settings = ctx.settings_new_vlan();
    let _net1 = ctx.network_new(settings, 7).unwrap();
    let _net2 = ctx.network_new(settings, 7).unwrap();

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Validate);
    assert!(problems.iter().any(|p| p.code == ProblemCode::NetDupId));
    assert!(ctx.kernel().unwrap().log().is_empty(), "validation failure must not touch the kernel");
}

/// Scenario 5: a netlink error injected on the 3rd `create_qdisc` call
/// (each virt's `init_virt_kernel` issues two, so this is the second
/// virt's first) marks that virt `Err`, leaves later virts under the
/// same PA untouched (still `New`), and `commit` returns `Commit`. The
/// scripted failure only fires on an exact call count, so a second
/// `commit` naturally moves past it and finishes the remaining virts.
#[tokio::test]
async fn mid_commit_failure_localises_to_one_virt_and_is_retriable() {
    let mut ctx = new_ctx();
    let net = ctx.network_new(default_settings(&ctx), 1).unwrap();
    let phys = local_phys(&mut ctx, "eth0", [10, 0, 0, 1]);
    ctx.phys_attach(phys, net).unwrap();
    let v1 = connect_virt(&mut ctx, net, phys, "tap0");
    let v2 = connect_virt(&mut ctx, net, phys, "tap1");
    let v3 = connect_virt(&mut ctx, net, phys, "tap2");

    ctx.kernel().unwrap().fail_on(
        "create_qdisc",
        ScriptedFailure {
            on_nth_call: 3,
            kind: ScriptedFailureKind::Netlink,
        },
    );

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Commit);
    assert_eq!(ctx.virt_state(v1), Some(ObjectState::Ok));
    assert_eq!(ctx.virt_state(v2), Some(ObjectState::Err));
    assert_eq!(ctx.virt_state(v3), Some(ObjectState::New));

    let mut problems2 = Vec::new();
    let result2 = commit(&mut ctx, &mut problems2).await;
    assert_eq!(result2, CommitResult::Ok, "{problems2:?}");
    assert_eq!(ctx.virt_state(v2), Some(ObjectState::Ok));
    assert_eq!(ctx.virt_state(v3), Some(ObjectState::Ok));
}

/// Scenario 6: a netlink error on `remove_virt`'s decommit path marks
/// the virt `Fail` and the whole context `inconsistent`; `commit`
/// returns `Inconsistent`. The explicitly-attached phys keeps the PA
/// alive after the virt is freed, so decommit only unenslaves the
/// virt's interface (`link_set_master`, the 3rd call overall: once for
/// the phys's own enslavement and once for the virt's during the first
/// commit) rather than tearing down the whole PA.
#[tokio::test]
async fn decommit_failure_marks_context_inconsistent() {
    let mut ctx = new_ctx();
    let net = ctx.network_new(default_settings(&ctx), 1).unwrap();
    let phys = local_phys(&mut ctx, "eth0", [10, 0, 0, 1]);
    ctx.phys_attach(phys, net).unwrap();
    let v1 = connect_virt(&mut ctx, net, phys, "tap0");

    let mut problems = Vec::new();
    let result = commit(&mut ctx, &mut problems).await;
    assert_eq!(result, CommitResult::Ok, "{problems:?}");

    ctx.virt_free(v1).unwrap();
    ctx.kernel().unwrap().fail_on(
        "link_set_master",
        ScriptedFailure {
            on_nth_call: 3,
            kind: ScriptedFailureKind::Netlink,
        },
    );

    let mut problems2 = Vec::new();
    let result2 = commit(&mut ctx, &mut problems2).await;
    assert_eq!(result2, CommitResult::Inconsistent);
    assert!(ctx.is_inconsistent());
    assert!(problems2.iter().any(|p| p.code == ProblemCode::CommitNetlinkCleanup));
}
