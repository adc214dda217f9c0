// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The commit engine (C10, spec §4.9): a two-phase diff-and-apply pass
//! over the object graph, driven through the [`crate::vtable`] dispatch
//! functions against one [`netctl::KernelHandle`].
//!
//! Phase D (decommit) walks every object whose state demands it —
//! `Delete` (tear down and free) or `Renew` (tear down the stale kernel
//! state so Phase R can lay down the new one) — innermost-first: virt,
//! then PA, then network, then phys, then settings. Phase R (recommit)
//! walks outward-in the opposite order: for every local phys's
//! explicitly-attached PA, `create_pa`, then `add_virt` + policers for
//! each connected virt, then `add_remote_pa`/`add_remote_virt` for every
//! other PA (and its virts) in the same network, then the virt rule
//! groups. A final Ack phase transitions every object that committed
//! without error from `New`/`Renew` to `Ok`.
//!
//! Startup hooks registered on a settings bundle fire once at the very
//! start of `commit()` for every (local phys × attached network) pair
//! using those settings; shutdown hooks fire symmetrically at the start
//! of Phase D, scoped to the pairs whose PA is about to be decommitted.

use netctl::KernelHandle;

use crate::context::{encap_of, Context};
use crate::error::{CommitOutcome, LsdnError};
use crate::ids::{NetId, PaId, PhysId, SettingsId, VirtId};
use crate::pa::{PaKernelState, PhysAttachment, RemotePaKernelState};
use crate::problem::{Problem, ProblemCode, Ref};
use crate::rule::Direction;
use crate::state::ObjectState;
use crate::vtable::{self, PaCreateArgs};

/// `commit()`'s four return codes (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    /// Nothing to report; every touched object reached `Ok`.
    Ok,
    /// `validate()` found at least one problem; commit was not attempted.
    Validate,
    /// At least one object ended in `Err`; a retry is meaningful.
    Commit,
    /// At least one object ended in `Fail`; the context is inconsistent.
    Inconsistent,
}

/// Run `validate()` then, if clean, the full two-phase commit. Every
/// [`Problem`] found (by the validator or by a failing kernel request) is
/// appended to `problems`.
pub async fn commit<K: KernelHandle>(ctx: &mut Context<K>, problems: &mut Vec<Problem>) -> CommitResult {
    ctx.resolve_local_virt_ifaces().await;
    if !ctx.validate(problems) {
        return CommitResult::Validate;
    }
    if ctx.is_inconsistent() {
        problems.push(Problem::new(ProblemCode::NoNlSock, vec![]));
        return CommitResult::Inconsistent;
    }

    invoke_startup_hooks(ctx);

    propagate_deletions(ctx);

    decommit_phase(ctx, problems).await;
    if ctx.is_inconsistent() {
        return CommitResult::Inconsistent;
    }

    recommit_phase(ctx, problems).await;

    let mut any_err = false;
    let mut any_fail = ctx.is_inconsistent();
    for (_, virt) in ctx.virts.iter() {
        any_fail |= virt.state == ObjectState::Fail;
        any_err |= virt.state == ObjectState::Err;
    }
    for (_, pa) in ctx.pas.iter() {
        any_fail |= pa.state == ObjectState::Fail;
        any_err |= pa.state == ObjectState::Err;
    }
    for (_, net) in ctx.networks.iter() {
        any_fail |= net.state == ObjectState::Fail;
        any_err |= net.state == ObjectState::Err;
    }

    ack_phase(ctx);

    if any_fail {
        CommitResult::Inconsistent
    } else if any_err {
        CommitResult::Commit
    } else {
        CommitResult::Ok
    }
}

/// The `(local phys, attached network, settings)` triples a startup/
/// shutdown hook call is scoped to (spec §4.9: "for each (local phys ×
/// attached network) pair"): one entry per PA whose phys is local and
/// which passes `filter`.
fn attached_pairs<K: KernelHandle>(
    ctx: &Context<K>,
    filter: impl Fn(&PhysAttachment) -> bool,
) -> Vec<(PhysId, NetId, SettingsId)> {
    let mut pairs = Vec::new();
    for (_, pa) in ctx.pas.iter() {
        if !filter(pa) {
            continue;
        }
        let Some(phys) = ctx.physes.get(pa.phys.0) else { continue };
        if !phys.is_local {
            continue;
        }
        let Some(net) = ctx.networks.get(pa.network.0) else { continue };
        pairs.push((pa.phys, pa.network, net.settings));
    }
    pairs
}

/// Fire every settings' registered startup hook once for each currently
/// (local phys × attached network) pair (spec §4.9). Run at the very
/// start of `commit()`, ahead of any kernel state changes.
fn invoke_startup_hooks<K: KernelHandle>(ctx: &mut Context<K>) {
    for (phys_id, net_id, settings_id) in attached_pairs(ctx, |pa| pa.explicitly_attached) {
        if let Some(startup) = ctx
            .settings
            .get_mut(settings_id.0)
            .and_then(|s| s.hooks.as_mut())
            .and_then(|h| h.startup.as_mut())
        {
            startup(net_id, phys_id);
        }
    }
}

/// Fire every settings' registered shutdown hook, symmetrically, for each
/// (local phys × attached network) pair whose PA is about to be torn down
/// this commit (`Delete`/`Renew`). Run at the start of Phase D.
///
/// Scoped to PA state rather than `explicitly_attached`: `detach` clears
/// that flag immediately (before the next `commit()` runs), so by Phase D
/// it no longer distinguishes a once-attached pair from one that never
/// was; the PA's presence in `Delete`/`Renew` is the only signal left that
/// a pair is being torn down.
fn invoke_shutdown_hooks<K: KernelHandle>(ctx: &mut Context<K>) {
    let filter = |pa: &PhysAttachment| pa.state == ObjectState::Delete || pa.state == ObjectState::Renew;
    for (phys_id, net_id, settings_id) in attached_pairs(ctx, filter) {
        if let Some(shutdown) = ctx
            .settings
            .get_mut(settings_id.0)
            .and_then(|s| s.hooks.as_mut())
            .and_then(|h| h.shutdown.as_mut())
        {
            shutdown(net_id, phys_id);
        }
    }
}

/// Step 1 of §4.8/§4.9: a deleted parent forces every child that exists
/// only because of it to re-evaluate `should_exist` and transition to
/// `Delete` too, bottom-up from virt disconnection already having run
/// eagerly in the object API. Here the propagation that remains is
/// top-down: a network or phys marked `Delete` drags its PAs along.
///
/// `ObjectState::mark_deleted` leaves a `New` object's state at `New`
/// (spec: never-committed objects have nothing for Phase D to tear
/// down), so a PA/virt cascaded in here while still `New` is removed
/// from the arena immediately rather than left to `decommit_phase`'s
/// `Delete`/`Renew` filter, which would never see it.
fn propagate_deletions<K: KernelHandle>(ctx: &mut Context<K>) {
    let deleted_nets: Vec<NetId> = ctx
        .networks
        .iter()
        .filter(|(_, n)| n.state == ObjectState::Delete)
        .map(|(i, _)| NetId(i))
        .collect();
    let deleted_physes: Vec<PhysId> = ctx
        .physes
        .iter()
        .filter(|(_, p)| p.state == ObjectState::Delete)
        .map(|(i, _)| PhysId(i))
        .collect();

    let mut gone_pas: Vec<PaId> = Vec::new();
    let to_cascade: Vec<PaId> = ctx
        .pas
        .iter()
        .filter(|(_, p)| p.state != ObjectState::Delete)
        .filter(|(_, p)| deleted_nets.contains(&p.network) || deleted_physes.contains(&p.phys))
        .map(|(i, _)| PaId(i))
        .collect();
    for pa_id in to_cascade {
        let was_new = ctx.pas.existing_mut(pa_id.0).state.mark_deleted();
        if was_new {
            free_uncommitted_pa(ctx, pa_id);
            gone_pas.push(pa_id);
        }
    }

    let deleted_pas: Vec<PaId> = ctx
        .pas
        .iter()
        .filter(|(_, p)| p.state == ObjectState::Delete)
        .map(|(i, _)| PaId(i))
        .chain(gone_pas)
        .collect();
    let to_cascade: Vec<VirtId> = ctx
        .virts
        .iter()
        .filter(|(_, v)| v.state != ObjectState::Delete)
        .filter(|(_, v)| v.connected.as_ref().is_some_and(|c| deleted_pas.contains(&c.pa)))
        .map(|(i, _)| VirtId(i))
        .collect();
    for virt_id in to_cascade {
        let was_new = ctx.virts.existing_mut(virt_id.0).state.mark_deleted();
        if was_new {
            free_uncommitted_virt(ctx, virt_id);
        }
    }
}

/// Remove a `New` (never committed) PA from the arena and every place it
/// is referenced, since Phase D has nothing of its to tear down.
fn free_uncommitted_pa<K: KernelHandle>(ctx: &mut Context<K>, pa_id: PaId) {
    let Some(pa) = ctx.pas.remove(pa_id.0) else { return };
    if let Some(net) = ctx.networks.get_mut(pa.network.0) {
        net.attachments.retain(|p| *p != pa_id);
    }
    if let Some(phys) = ctx.physes.get_mut(pa.phys.0) {
        phys.attachments.retain(|p| *p != pa_id);
    }
}

/// Remove a `New` (never committed) virt from the arena, its owning
/// network's bookkeeping, and purge its still-unreferenced virt rules.
fn free_uncommitted_virt<K: KernelHandle>(ctx: &mut Context<K>, virt_id: VirtId) {
    let Some(virt) = ctx.virts.remove(virt_id.0) else { return };
    if let Some(net) = ctx.networks.get_mut(virt.network.0) {
        net.virts.retain(|v| *v != virt_id);
        net.virt_names.remove(&virt.name);
    }
    for rule_id in virt.rules {
        ctx.rules.remove(rule_id.0);
    }
}

async fn decommit_phase<K: KernelHandle>(ctx: &mut Context<K>, problems: &mut Vec<Problem>) {
    invoke_shutdown_hooks(ctx);

    let virt_ids: Vec<VirtId> = ctx
        .virts
        .iter()
        .filter(|(_, v)| v.state == ObjectState::Delete || v.state == ObjectState::Renew)
        .map(|(i, _)| VirtId(i))
        .collect();
    for virt_id in virt_ids {
        decommit_virt(ctx, virt_id, problems).await;
        if ctx.is_inconsistent() {
            return;
        }
    }

    let pa_ids: Vec<PaId> = ctx
        .pas
        .iter()
        .filter(|(_, p)| p.state == ObjectState::Delete || p.state == ObjectState::Renew)
        .map(|(i, _)| PaId(i))
        .collect();
    for pa_id in pa_ids {
        decommit_pa(ctx, pa_id, problems).await;
        if ctx.is_inconsistent() {
            return;
        }
    }

    let to_free: Vec<NetId> = ctx
        .networks
        .iter()
        .filter(|(_, n)| n.state == ObjectState::Delete)
        .map(|(i, _)| NetId(i))
        .collect();
    for net_id in to_free {
        ctx.networks.remove(net_id.0);
    }
}

/// Tear down a committed virt's own ingress/egress rulesets (§4.7 rule
/// groups and policers) ahead of detaching it from its PA's bridge.
/// Leaves `virt.kernel` at `None` either way, since both `Delete` and
/// `Renew` want Phase R to lay the ruleset down fresh (a migrated virt's
/// rule set does not change, but re-deriving it from `virt.rules` is
/// simpler than diffing against what is already installed).
///
/// Returns `false` if a kernel failure aborted cleanup partway through
/// (the caller should stop, having already recorded a problem).
async fn decommit_virt_rules<K: KernelHandle>(ctx: &mut Context<K>, virt_id: VirtId, problems: &mut Vec<Problem>) -> bool {
    let rule_ids = ctx.virts.get(virt_id.0).map(|v| v.rules.clone()).unwrap_or_default();
    let policers = ctx.virts.get(virt_id.0).map(|v| v.committed_policers).unwrap_or_default();
    let Some(kernel) = ctx.kernel.as_ref() else { return true };
    let Some(mut kstate) = ctx.virts.get_mut(virt_id.0).and_then(|v| v.kernel.take()) else {
        return true;
    };

    for vr_id in rule_ids {
        let Some((direction, priority, fields)) = ctx.rules.get(vr_id.0).map(|r| {
            (r.direction, r.priority, r.targets.iter().map(|t| t.to_match_field()).collect::<Vec<_>>())
        }) else {
            continue;
        };
        if let Err(outcome) = vtable::remove_virt_rule(kernel, &mut kstate, direction, priority, fields, ctx.decommit_disabled).await {
            apply_decommit_outcome(ctx, problems, virt_id_as_ref(virt_id), outcome);
            return false;
        }
    }
    if policers.rate_in_installed {
        if let Err(outcome) = vtable::remove_policer(kernel, &mut kstate, Direction::In, ctx.decommit_disabled).await {
            apply_decommit_outcome(ctx, problems, virt_id_as_ref(virt_id), outcome);
            return false;
        }
    }
    if policers.rate_out_installed {
        if let Err(outcome) = vtable::remove_policer(kernel, &mut kstate, Direction::Out, ctx.decommit_disabled).await {
            apply_decommit_outcome(ctx, problems, virt_id_as_ref(virt_id), outcome);
            return false;
        }
    }
    true
}

async fn decommit_virt<K: KernelHandle>(ctx: &mut Context<K>, virt_id: VirtId, problems: &mut Vec<Problem>) {
    if !decommit_virt_rules(ctx, virt_id, problems).await {
        return;
    }
    let Some(virt) = ctx.virts.get(virt_id.0) else { return };
    let Some(committed_to) = virt.committed_to else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };
    let Some(conn) = virt.connected.clone() else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };
    if conn.phys != committed_to {
        // Migration: the virt will be re-added under its new phys during
        // Phase R; here we only tear down the old location.
    }
    let Some(virt_ifindex) = virt.iface.ifindex() else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };

    let Some(pa) = ctx.pas.get_mut(conn.pa.0) else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };
    let Some(kernel_state) = pa.kernel.as_mut() else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };
    let Some(kernel) = ctx.kernel.as_ref() else {
        finish_virt_decommit(ctx, virt_id);
        return;
    };

    match vtable::remove_virt(kernel, kernel_state, virt_ifindex, ctx.decommit_disabled).await {
        Ok(()) => finish_virt_decommit(ctx, virt_id),
        Err(outcome) => apply_decommit_outcome(ctx, problems, virt_id_as_ref(virt_id), outcome),
    }
}

fn finish_virt_decommit<K: KernelHandle>(ctx: &mut Context<K>, virt_id: VirtId) {
    let Some(virt) = ctx.virts.get_mut(virt_id.0) else { return };
    if virt.state == ObjectState::Delete {
        let net_id = virt.network;
        let name = virt.name.clone();
        // Usually already empty (`virt_free` purges rules eagerly at the
        // API level), but a virt cascade-deleted via `propagate_deletions`
        // never went through `virt_free`, so still-attached rules would
        // otherwise leak in `ctx.rules` forever.
        let rule_ids = std::mem::take(&mut virt.rules);
        for rule_id in rule_ids {
            ctx.rules.remove(rule_id.0);
        }
        ctx.virts.remove(virt_id.0);
        if let Some(net) = ctx.networks.get_mut(net_id.0) {
            net.virts.retain(|v| *v != virt_id);
            net.virt_names.remove(&name);
        }
    } else if virt.state == ObjectState::Renew {
        virt.state = ObjectState::New;
        virt.committed_to = None;
        virt.committed_policers = crate::virt::CommittedPolicers::default();
    }
}

async fn decommit_pa<K: KernelHandle>(ctx: &mut Context<K>, pa_id: PaId, problems: &mut Vec<Problem>) {
    let remote_pa_ids = ctx.pas.get(pa_id.0).map(|p| p.remote_pas.clone()).unwrap_or_default();
    for remote_id in remote_pa_ids {
        decommit_remote_pa(ctx, pa_id, remote_id, problems).await;
        if ctx.is_inconsistent() {
            return;
        }
    }

    let Some(pa) = ctx.pas.get(pa_id.0) else { return };
    if pa.state != ObjectState::Delete {
        // Renew: the stale kernel state is freed here; Phase R will call
        // `create_pa` again from scratch.
        let Some(kernel_state) = ctx.pas.get_mut(pa_id.0).and_then(|p| p.kernel.take()) else {
            return;
        };
        let Some(kernel) = ctx.kernel.as_ref() else { return };
        if let Err(outcome) = vtable::remove_pa(kernel, kernel_state, ctx.decommit_disabled).await {
            apply_decommit_outcome(ctx, problems, pa_id_as_ref(pa_id), outcome);
            return;
        }
        if let Some(pa) = ctx.pas.get_mut(pa_id.0) {
            pa.state = ObjectState::New;
        }
        return;
    }

    let kernel_state = ctx.pas.get_mut(pa_id.0).and_then(|p| p.kernel.take());
    if let Some(kernel_state) = kernel_state {
        let Some(kernel) = ctx.kernel.as_ref() else { return };
        if let Err(outcome) = vtable::remove_pa(kernel, kernel_state, ctx.decommit_disabled).await {
            apply_decommit_outcome(ctx, problems, pa_id_as_ref(pa_id), outcome);
            return;
        }
    }
    if let Some(pa) = ctx.pas.get(pa_id.0) {
        let phys_id = pa.phys;
        let net_id = pa.network;
        ctx.pas.remove(pa_id.0);
        if let Some(net) = ctx.networks.get_mut(net_id.0) {
            net.attachments.retain(|p| *p != pa_id);
        }
        if let Some(phys) = ctx.physes.get_mut(phys_id.0) {
            phys.attachments.retain(|p| *p != pa_id);
        }
    }
}

async fn decommit_remote_pa<K: KernelHandle>(
    ctx: &mut Context<K>,
    pa_id: PaId,
    remote_id: crate::ids::RemotePaId,
    problems: &mut Vec<Problem>,
) {
    let Some(view) = ctx.remote_pas.get(remote_id.0) else { return };
    let remote_virt_ids = view.remote_virts.clone();
    for remote_virt_id in remote_virt_ids {
        let Some(rv) = ctx.remote_virts.get(remote_virt_id.0) else { continue };
        if !rv.kernel.mac_installed {
            ctx.remote_virts.remove(remote_virt_id.0);
            continue;
        }
        let mac = ctx
            .virts
            .get(rv.remote_virt.0)
            .and_then(|v| v.mac)
            .unwrap_or(net_types::mac::Mac::ZERO);
        let remote_kernel = ctx.remote_pas.get(remote_id.0).map(|v| v.kernel).unwrap_or(RemotePaKernelState::None);
        let Some(kernel) = ctx.kernel.as_ref() else { return };
        let Some(pa) = ctx.pas.get_mut(pa_id.0) else { return };
        let Some(kernel_state) = pa.kernel.as_mut() else { continue };
        if let Err(outcome) = vtable::remove_remote_virt(kernel, kernel_state, &remote_kernel, mac).await {
            apply_decommit_outcome(ctx, problems, pa_id_as_ref(pa_id), outcome);
            return;
        }
        ctx.remote_virts.remove(remote_virt_id.0);
    }

    let Some(view) = ctx.remote_pas.get(remote_id.0) else { return };
    let remote_state = view.kernel;
    let Some(kernel) = ctx.kernel.as_ref() else { return };
    let Some(pa) = ctx.pas.get_mut(pa_id.0) else { return };
    let Some(kernel_state) = pa.kernel.as_mut() else { return };
    let tunnel_if = match kernel_state {
        PaKernelState::Lbridge { tunnel_if, .. } => *tunnel_if,
        PaKernelState::Sbridge { tunnel_if, .. } => Some(*tunnel_if),
    };
    if let Err(outcome) = vtable::remove_remote_pa(kernel, kernel_state, remote_state, tunnel_if, ctx.decommit_disabled).await {
        apply_decommit_outcome(ctx, problems, pa_id_as_ref(pa_id), outcome);
        return;
    }
    ctx.remote_pas.remove(remote_id.0);
    if let Some(pa) = ctx.pas.get_mut(pa_id.0) {
        pa.remote_pas.retain(|r| *r != remote_id);
    }
}

/// Record a Phase D failure. Spec §7: "Phase D errors are treated as
/// unrecoverable" — unlike Phase R, there is no `Netlink`/`NoMem` vs.
/// `Inconsistent` distinction here: whatever the kernel-call outcome, the
/// object's kernel state is now of unknown shape (the decommit was
/// interrupted partway through), so every Phase D failure promotes the
/// object straight to `Fail` and the whole context to inconsistent.
fn apply_decommit_outcome<K: KernelHandle>(
    ctx: &mut Context<K>,
    problems: &mut Vec<Problem>,
    subject: Ref,
    outcome: CommitOutcome,
) {
    let _ = outcome;
    problems.push(Problem::new(ProblemCode::CommitNetlinkCleanup, vec![subject.clone()]));
    ctx.inconsistent = true;
    set_object_state(ctx, &subject, ObjectState::Fail);
}

fn virt_id_as_ref(id: VirtId) -> Ref {
    Ref::Virt(id)
}

fn pa_id_as_ref(id: PaId) -> Ref {
    Ref::Pa(id)
}

async fn recommit_phase<K: KernelHandle>(ctx: &mut Context<K>, problems: &mut Vec<Problem>) {
    let local_phys: Vec<PhysId> = ctx
        .physes
        .iter()
        .filter(|(_, p)| p.is_local)
        .map(|(i, _)| PhysId(i))
        .collect();

    for phys_id in local_phys {
        let pa_ids: Vec<PaId> = ctx
            .pas
            .iter()
            .filter(|(_, pa)| {
                pa.phys == phys_id && pa.explicitly_attached && pa.state.needs_commit()
            })
            .map(|(i, _)| PaId(i))
            .collect();
        for pa_id in pa_ids {
            recommit_pa(ctx, pa_id, problems).await;
        }
    }
}

async fn recommit_pa<K: KernelHandle>(ctx: &mut Context<K>, pa_id: PaId, problems: &mut Vec<Problem>) {
    let Some(pa) = ctx.pas.get(pa_id.0) else { return };
    let phys_id = pa.phys;
    let net_id = pa.network;
    let Some(encap) = encap_of(ctx, net_id) else { return };

    if ctx.pas.get(pa_id.0).map(|p| p.kernel.is_none()).unwrap_or(false) {
        let Some(phys) = ctx.physes.get(phys_id.0) else { return };
        let Some(phys_if) = phys.iface.as_ref().and_then(|h| h.ifindex()) else {
            fail_commit(ctx, problems, Ref::Phys(phys_id), CommitOutcome::Inconsistent);
            return;
        };
        let Some(net) = ctx.networks.get(net_id.0) else { return };
        let Some(settings) = ctx.settings.get(net.settings.0) else { return };
        let group = match &settings.params {
            crate::settings::EncapParams::VxlanMcast { group, .. } => *group,
            #[allow(clippy::expect_used)] // 239.1.1.1 is a multicast address by construction
            _ => net_types::ip::MulticastIpv4Addr::new(std::net::Ipv4Addr::new(239, 1, 1, 1))
                .expect("239.1.1.1 is a valid multicast address"),
        };
        let port = settings.tunnel_port().unwrap_or(net_types::port::UdpPort::VXLAN_DEFAULT);
        let args = PaCreateArgs {
            ctx_name: &ctx.name,
            settings_name: &settings.name,
            pa_index: pa_id.0,
            phys_if,
            local_ip: phys.ip,
            vnet_id: net.vnet_id,
            group,
            port,
        };
        let Some(kernel) = ctx.kernel.as_ref() else { return };
        match vtable::create_pa(kernel, encap, &args).await {
            Ok(state) => {
                if let Some(pa) = ctx.pas.get_mut(pa_id.0) {
                    pa.kernel = Some(state);
                }
            }
            Err(outcome) => {
                fail_commit(ctx, problems, Ref::Pa(pa_id), outcome);
                return;
            }
        }
    }

    let connected_virts = ctx.pas.get(pa_id.0).map(|p| p.connected_virts.clone()).unwrap_or_default();
    for virt_id in connected_virts {
        recommit_virt(ctx, pa_id, virt_id, problems).await;
        let virt_failed = ctx
            .virts
            .get(virt_id.0)
            .map(|v| matches!(v.state, ObjectState::Err | ObjectState::Fail))
            .unwrap_or(true);
        if virt_failed || ctx.is_inconsistent() {
            // Spec §8 scenario 5: stop attempting further virts under this
            // PA once one fails, so they remain untouched (still `New`)
            // for the next `commit` to retry.
            return;
        }
    }

    let other_pas: Vec<PaId> = ctx
        .networks
        .get(net_id.0)
        .map(|n| n.attachments.iter().copied().filter(|p| *p != pa_id).collect())
        .unwrap_or_default();
    for other_id in other_pas {
        recommit_remote_pa(ctx, pa_id, other_id, encap, problems).await;
    }

    if let Some(pa) = ctx.pas.get_mut(pa_id.0) {
        if pa.state != ObjectState::Err && pa.state != ObjectState::Fail {
            pa.state = ObjectState::Ok;
        }
    }
}

async fn recommit_virt<K: KernelHandle>(ctx: &mut Context<K>, pa_id: PaId, virt_id: VirtId, problems: &mut Vec<Problem>) {
    let Some(virt) = ctx.virts.get(virt_id.0) else { return };
    if !virt.state.needs_commit() {
        return;
    }
    let Some(phys_id) = ctx.pas.get(pa_id.0).map(|p| p.phys) else { return };
    let Some(kernel) = ctx.kernel.as_ref() else { return };
    let Some(virt) = ctx.virts.get_mut(virt_id.0) else { return };
    let virt_ifindex = match virt.iface.resolve(kernel).await {
        Ok(idx) => idx,
        Err(_) => {
            fail_commit(ctx, problems, Ref::Virt(virt_id), CommitOutcome::Inconsistent);
            return;
        }
    };

    {
        let Some(pa) = ctx.pas.get_mut(pa_id.0) else { return };
        let Some(kernel_state) = pa.kernel.as_mut() else { return };
        if let Err(outcome) = vtable::add_virt(kernel, kernel_state, virt_ifindex).await {
            fail_commit(ctx, problems, Ref::Virt(virt_id), outcome);
            return;
        }
    }

    if !commit_virt_kernel_state(ctx, virt_id, virt_ifindex, problems).await {
        return;
    }

    if let Some(virt) = ctx.virts.get_mut(virt_id.0) {
        virt.committed_to = Some(phys_id);
        virt.state = ObjectState::Ok;
    }
}

/// Bring a virt's own ingress/egress rulesets up to date with its current
/// rule set and rate limits (§4.7): initialize [`crate::vtable::init_virt_kernel`]
/// on first commit, then commit every live rule group and any
/// not-yet-installed policer. Returns `false` on kernel failure (a
/// problem has already been recorded).
async fn commit_virt_kernel_state<K: KernelHandle>(
    ctx: &mut Context<K>,
    virt_id: VirtId,
    virt_ifindex: netctl::IfIndex,
    problems: &mut Vec<Problem>,
) -> bool {
    let Some(kernel) = ctx.kernel.as_ref() else { return true };

    if ctx.virts.get(virt_id.0).map(|v| v.kernel.is_none()).unwrap_or(false) {
        match vtable::init_virt_kernel(kernel, virt_ifindex).await {
            Ok(state) => {
                if let Some(virt) = ctx.virts.get_mut(virt_id.0) {
                    virt.kernel = Some(state);
                }
            }
            Err(outcome) => {
                fail_commit(ctx, problems, Ref::Virt(virt_id), outcome);
                return false;
            }
        }
    }

    let rule_ids = ctx.virts.get(virt_id.0).map(|v| v.rules.clone()).unwrap_or_default();
    for vr_id in rule_ids {
        let Some((direction, priority, fields)) = ctx.rules.get(vr_id.0).map(|r| {
            (r.direction, r.priority, r.targets.iter().map(|t| t.to_match_field()).collect::<Vec<_>>())
        }) else {
            continue;
        };
        let Some(virt) = ctx.virts.get_mut(virt_id.0) else { return true };
        let Some(kstate) = virt.kernel.as_mut() else { return true };
        if let Err(outcome) = vtable::commit_virt_rule(kernel, kstate, direction, priority, fields).await {
            fail_commit(ctx, problems, Ref::Virt(virt_id), outcome);
            return false;
        }
    }

    let (rate_in, rate_out, installed) = ctx
        .virts
        .get(virt_id.0)
        .map(|v| (v.rate_in, v.rate_out, v.committed_policers))
        .unwrap_or_default();

    if let Some(rate) = rate_in {
        if !installed.rate_in_installed {
            let Some(virt) = ctx.virts.get_mut(virt_id.0) else { return true };
            let Some(kstate) = virt.kernel.as_mut() else { return true };
            if let Err(outcome) = vtable::commit_policer(kernel, kstate, Direction::In, rate).await {
                fail_commit(ctx, problems, Ref::Virt(virt_id), outcome);
                return false;
            }
            if let Some(virt) = ctx.virts.get_mut(virt_id.0) {
                virt.committed_policers.rate_in_installed = true;
            }
        }
    }
    if let Some(rate) = rate_out {
        if !installed.rate_out_installed {
            let Some(virt) = ctx.virts.get_mut(virt_id.0) else { return true };
            let Some(kstate) = virt.kernel.as_mut() else { return true };
            if let Err(outcome) = vtable::commit_policer(kernel, kstate, Direction::Out, rate).await {
                fail_commit(ctx, problems, Ref::Virt(virt_id), outcome);
                return false;
            }
            if let Some(virt) = ctx.virts.get_mut(virt_id.0) {
                virt.committed_policers.rate_out_installed = true;
            }
        }
    }

    true
}

async fn recommit_remote_pa<K: KernelHandle>(
    ctx: &mut Context<K>,
    pa_id: PaId,
    other_id: PaId,
    encap: crate::settings::EncapKind,
    problems: &mut Vec<Problem>,
) {
    let already_linked = ctx
        .pas
        .get(pa_id.0)
        .map(|p| {
            p.remote_pas
                .iter()
                .any(|r| ctx.remote_pas.get(r.0).map(|v| v.remote_pa == other_id).unwrap_or(false))
        })
        .unwrap_or(true);
    if already_linked {
        return;
    }

    let Some(other_phys_id) = ctx.pas.get(other_id.0).map(|p| p.phys) else { return };
    let Some(remote_ip) = ctx.physes.get(other_phys_id.0).and_then(|p| p.ip) else { return };
    let Some(phys_id) = ctx.pas.get(pa_id.0).map(|p| p.phys) else { return };
    let local_ip = ctx.physes.get(phys_id.0).and_then(|p| p.ip);
    let Some(net_id) = ctx.pas.get(pa_id.0).map(|p| p.network) else { return };
    let Some(net) = ctx.networks.get(net_id.0) else { return };
    let raw_vnet_id = net.vnet_id;
    let Some(settings) = ctx.settings.get(net.settings.0) else { return };
    let port = settings.tunnel_port().unwrap_or(net_types::port::UdpPort::VXLAN_DEFAULT);

    let Some(kernel) = ctx.kernel.as_ref() else { return };
    let Some(pa) = ctx.pas.get_mut(pa_id.0) else { return };
    let Some(kernel_state) = pa.kernel.as_mut() else { return };
    let remote_kernel_state = match vtable::add_remote_pa(kernel, encap, kernel_state, local_ip, remote_ip, raw_vnet_id, port).await {
        Ok(state) => state,
        Err(outcome) => {
            fail_commit(ctx, problems, Ref::Pa(pa_id), outcome);
            return;
        }
    };

    let view_id = ctx.remote_pas.insert(crate::pa::RemotePaView {
        id: crate::ids::RemotePaId(0),
        local_pa: pa_id,
        remote_pa: other_id,
        remote_virts: Vec::new(),
        kernel: remote_kernel_state,
    });
    let view_real = crate::ids::RemotePaId(view_id);
    ctx.remote_pas.existing_mut(view_id).id = view_real;
    ctx.pas.existing_mut(pa_id.0).remote_pas.push(view_real);

    let other_virts = ctx.pas.get(other_id.0).map(|p| p.connected_virts.clone()).unwrap_or_default();
    for remote_virt_id in other_virts {
        recommit_remote_virt(ctx, pa_id, view_real, remote_virt_id, problems).await;
    }
}

async fn recommit_remote_virt<K: KernelHandle>(
    ctx: &mut Context<K>,
    pa_id: PaId,
    view_id: crate::ids::RemotePaId,
    remote_virt_id: VirtId,
    problems: &mut Vec<Problem>,
) {
    let Some(mac) = ctx.virts.get(remote_virt_id.0).and_then(|v| v.mac) else {
        return;
    };
    let remote_kernel = ctx.remote_pas.get(view_id.0).map(|v| v.kernel).unwrap_or(RemotePaKernelState::None);
    let Some(kernel) = ctx.kernel.as_ref() else { return };
    let Some(pa) = ctx.pas.get_mut(pa_id.0) else { return };
    let Some(kernel_state) = pa.kernel.as_mut() else { return };
    let installed = match vtable::add_remote_virt(kernel, kernel_state, &remote_kernel, mac).await {
        Ok(installed) => installed,
        Err(outcome) => {
            fail_commit(ctx, problems, Ref::Pa(pa_id), outcome);
            return;
        }
    };
    let raw = ctx.remote_virts.insert(crate::pa::RemoteVirtView {
        id: crate::ids::RemoteVirtId(0),
        remote_pa_view: view_id,
        remote_virt: remote_virt_id,
        kernel: crate::pa::RemoteVirtKernelState { mac_installed: installed },
    });
    let real = crate::ids::RemoteVirtId(raw);
    ctx.remote_virts.existing_mut(raw).id = real;
    if let Some(view) = ctx.remote_pas.get_mut(view_id.0) {
        view.remote_virts.push(real);
    }
}

/// Record a Phase R failure: a recoverable `Netlink`/`NoMem` outcome
/// localises to the object (→ `Err`, retriable on the next `commit`, spec
/// §7 "Commit errors are localised per object in Phase R"); `Inconsistent`
/// is unrecoverable (→ `Fail`, context-wide).
fn fail_commit<K: KernelHandle>(ctx: &mut Context<K>, problems: &mut Vec<Problem>, subject: Ref, outcome: CommitOutcome) {
    let code = match outcome {
        CommitOutcome::Netlink | CommitOutcome::Inconsistent => ProblemCode::CommitNetlink,
        CommitOutcome::NoMem => ProblemCode::CommitNoMem,
    };
    problems.push(Problem::new(code, vec![subject.clone()]));
    let target_state = match outcome {
        CommitOutcome::Netlink | CommitOutcome::NoMem => ObjectState::Err,
        CommitOutcome::Inconsistent => {
            ctx.inconsistent = true;
            ObjectState::Fail
        }
    };
    set_object_state(ctx, &subject, target_state);
}

/// Apply a state transition to whichever arena the given [`Ref`] names.
/// `fail_commit`/`apply_decommit_outcome` only ever pass `Phys`/`Pa`/`Virt`
/// refs (the three kinds Phase D/R can individually fail); other variants
/// are no-ops here since nothing in the commit engine ever fails against
/// them directly.
fn set_object_state<K: KernelHandle>(ctx: &mut Context<K>, subject: &Ref, state: ObjectState) {
    match subject {
        Ref::Phys(id) => {
            if let Some(phys) = ctx.physes.get_mut(id.0) {
                phys.state = state;
            }
        }
        Ref::Pa(id) => {
            if let Some(pa) = ctx.pas.get_mut(id.0) {
                pa.state = state;
            }
        }
        Ref::Virt(id) => {
            if let Some(virt) = ctx.virts.get_mut(id.0) {
                virt.state = state;
            }
        }
        _ => {}
    }
}

fn ack_phase<K: KernelHandle>(ctx: &mut Context<K>) {
    for (_, s) in ctx.settings.iter_mut() {
        if matches!(s.state, ObjectState::New | ObjectState::Renew) {
            s.state = ObjectState::Ok;
        }
    }
    for (_, n) in ctx.networks.iter_mut() {
        if matches!(n.state, ObjectState::New | ObjectState::Renew) {
            n.state = ObjectState::Ok;
        }
    }
    for (_, p) in ctx.physes.iter_mut() {
        if matches!(p.state, ObjectState::New | ObjectState::Renew) {
            p.state = ObjectState::Ok;
            p.committed_as_local = p.is_local;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::ids::SettingsId;
    use netctl::MockKernel;
    use std::net::IpAddr;

    fn new_ctx() -> Context<MockKernel> {
        Context::new("t", MockKernel::new())
    }

    #[tokio::test]
    async fn direct_network_two_phys_commits_cleanly() {
        let mut ctx = new_ctx();
        let net = ctx.network_new(SettingsId(0), 1).unwrap();

        let phys_a = ctx.phys_new();
        ctx.phys_set_iface(phys_a, "eth0").unwrap();
        ctx.phys_set_ip(phys_a, IpAddr::from([10, 0, 0, 1])).unwrap();
        ctx.phys_claim_local(phys_a).unwrap();
        ctx.phys_attach(phys_a, net).unwrap();
        {
            let phys = ctx.physes.get_mut(phys_a.0).unwrap();
            phys.iface = Some(crate::iface::IfaceHandle::Resolved(
                netctl::IfName::new("eth0").unwrap(),
                netctl::IfIndex::new(5),
            ));
        }

        let phys_b = ctx.phys_new();
        ctx.phys_set_ip(phys_b, IpAddr::from([10, 0, 0, 2])).unwrap();
        ctx.phys_attach(phys_b, net).unwrap();

        let mut problems = Vec::new();
        let result = commit(&mut ctx, &mut problems).await;
        assert_eq!(result, CommitResult::Ok, "{problems:?}");
        assert!(ctx.pas.iter().all(|(_, p)| p.state == ObjectState::Ok));
    }

    #[tokio::test]
    async fn startup_hook_fires_once_per_local_phys_attached_network_pair() {
        use crate::settings::UserHooks;
        use std::cell::RefCell;
        use std::rc::Rc;

        let calls: Rc<RefCell<Vec<(NetId, PhysId)>>> = Rc::new(RefCell::new(Vec::new()));
        let recorded = calls.clone();

        let mut ctx = new_ctx();
        ctx.settings_register_hooks(
            SettingsId(0),
            UserHooks {
                startup: Some(Box::new(move |net, phys| recorded.borrow_mut().push((net, phys)))),
                shutdown: None,
            },
        );

        let net = ctx.network_new(SettingsId(0), 1).unwrap();
        let phys = ctx.phys_new();
        ctx.phys_claim_local(phys).unwrap();
        ctx.phys_attach(phys, net).unwrap();
        {
            let phys = ctx.physes.get_mut(phys.0).unwrap();
            phys.iface = Some(crate::iface::IfaceHandle::Resolved(
                netctl::IfName::new("eth0").unwrap(),
                netctl::IfIndex::new(5),
            ));
        }

        let mut problems = Vec::new();
        commit(&mut ctx, &mut problems).await;
        assert_eq!(*calls.borrow(), vec![(net, phys)]);

        // A second commit with nothing new to do still fires startup once
        // for the still-attached pair (spec §4.9: "once at the beginning
        // of commit", not "once ever").
        commit(&mut ctx, &mut problems).await;
        assert_eq!(*calls.borrow(), vec![(net, phys), (net, phys)]);
    }

    #[tokio::test]
    async fn shutdown_hook_fires_when_attachment_is_decommitted() {
        use crate::settings::UserHooks;
        use std::cell::RefCell;
        use std::rc::Rc;

        let calls: Rc<RefCell<Vec<(NetId, PhysId)>>> = Rc::new(RefCell::new(Vec::new()));
        let recorded = calls.clone();

        let mut ctx = new_ctx();
        ctx.settings_register_hooks(
            SettingsId(0),
            UserHooks {
                startup: None,
                shutdown: Some(Box::new(move |net, phys| recorded.borrow_mut().push((net, phys)))),
            },
        );

        let net = ctx.network_new(SettingsId(0), 1).unwrap();
        let phys = ctx.phys_new();
        ctx.phys_claim_local(phys).unwrap();
        ctx.phys_attach(phys, net).unwrap();
        {
            let phys = ctx.physes.get_mut(phys.0).unwrap();
            phys.iface = Some(crate::iface::IfaceHandle::Resolved(
                netctl::IfName::new("eth0").unwrap(),
                netctl::IfIndex::new(5),
            ));
        }

        let mut problems = Vec::new();
        commit(&mut ctx, &mut problems).await;
        assert!(calls.borrow().is_empty());

        ctx.phys_detach(phys, net).unwrap();
        commit(&mut ctx, &mut problems).await;
        assert_eq!(*calls.borrow(), vec![(net, phys)]);
    }

    #[tokio::test]
    async fn scripted_kernel_failure_leaves_object_in_err() {
        let mut ctx = new_ctx();
        let net = ctx.network_new(SettingsId(0), 1).unwrap();
        let phys = ctx.phys_new();
        ctx.phys_claim_local(phys).unwrap();
        ctx.phys_attach(phys, net).unwrap();
        {
            let phys = ctx.physes.get_mut(phys.0).unwrap();
            phys.iface = Some(crate::iface::IfaceHandle::Resolved(
                netctl::IfName::new("eth0").unwrap(),
                netctl::IfIndex::new(5),
            ));
        }
        ctx.kernel.as_ref().unwrap().fail_on(
            "create_link",
            netctl::kernel::ScriptedFailure {
                on_nth_call: 1,
                kind: netctl::kernel::ScriptedFailureKind::Netlink,
            },
        );
        let mut problems = Vec::new();
        let result = commit(&mut ctx, &mut problems).await;
        assert_eq!(result, CommitResult::Commit);
        assert!(problems.iter().any(|p| p.code == ProblemCode::CommitNetlink));
        let pa = ctx.pas.iter().next().expect("one pa").1;
        assert_eq!(pa.state, ObjectState::Err);
    }
}
