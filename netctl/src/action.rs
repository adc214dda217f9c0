// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! TC action vocabulary.
//!
//! Grounded on the teacher's `tc/action/{mirred,gact,tunnel_key}.rs`: one
//! variant per action kind the compiler (§6.2) must be able to emit,
//! carrying exactly the kind-specific parameters a flower filter's action
//! list can hold.

use net_types::ip::UnicastIpv4Addr;
use net_types::port::UdpPort;
use net_types::vnet_id::VnetId;

/// Which mirred direction/mode an action requests.
///
/// Named after the TCA_* mirred constants (`TCA_EGRESS_REDIR = 1`,
/// `TCA_EGRESS_MIRROR = 2`, `TCA_INGRESS_REDIR = 3`,
/// `TCA_INGRESS_MIRROR = 4`); only redirect/mirror variants the broadcast
/// replicator and virt-rule compiler need are modeled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirredMode {
    /// Redirect the packet to the target interface's egress (steals the
    /// packet from its original path).
    EgressRedirect,
    /// Redirect the packet to the target interface's ingress.
    IngressRedirect,
    /// Mirror (copy) the packet to the target interface's egress, original
    /// packet continues on its own path.
    EgressMirror,
}

/// A final verdict a `gact` action can render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GactVerdict {
    /// Drop the packet (`TC_ACT_SHOT`).
    Shot,
    /// Continue evaluating remaining actions/filters (`TC_ACT_PIPE`).
    Pipe,
    /// Continue to the next filter in priority order (`TC_ACT_UNSPEC`
    /// with the continue bit, i.e. fall through to the next action).
    Continue,
    /// Jump to another TC chain (`TC_ACT_GOTO_CHAIN`).
    GotoChain(u32),
}

/// Tunnel metadata to stamp on egress (VXLAN/GENEVE encapsulation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelKeySet {
    /// The encapsulation source IP (the local PA's tunnel endpoint).
    pub src: UnicastIpv4Addr,
    /// The encapsulation destination IP (the remote PA's tunnel endpoint).
    pub dst: UnicastIpv4Addr,
    /// The VXLAN VNI / GENEVE VNI to stamp into the tunnel header.
    pub vni: VnetId,
    /// The UDP destination port of the tunnel.
    pub dst_port: UdpPort,
}

/// Policer parameters (`police` action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Police {
    /// Average rate, in bytes/sec, scaled to kernel timer ticks at emission time.
    pub avg_rate: u64,
    /// Burst size in bytes.
    pub burst: u32,
    /// Peak rate in bytes/sec (0 disables peak-rate policing).
    pub peakrate: u64,
    /// MTU used to size the policer's internal token buckets.
    pub mtu: u32,
    /// Verdict when the packet conforms to the rate.
    pub conform: GactVerdict,
    /// Verdict when the packet exceeds the rate.
    pub exceed: GactVerdict,
}

/// One action in a flower filter's ordered action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Redirect/mirror to another interface, by kernel ifindex.
    Mirred { mode: MirredMode, to_ifindex: u32 },
    /// Stamp tunnel encapsulation metadata (encap direction only; this
    /// model never needs a decap `tunnel_key unset`, since decapsulation
    /// is implicit in vxlan/geneve device RX).
    TunnelKeySet(TunnelKeySet),
    /// Rate-limit and render a verdict.
    Police(Police),
    /// Render a bare verdict with no side effect.
    Gact(GactVerdict),
}

impl Action {
    /// Convenience constructor for the broadcast replicator and sbridge
    /// helper, which only ever redirect to an egress.
    #[must_use]
    pub fn egress_redirect(to_ifindex: u32) -> Action {
        Action::Mirred {
            mode: MirredMode::EgressRedirect,
            to_ifindex,
        }
    }

    /// The `gact continue` action packed as the last entry of a replicator
    /// chain when it has not exhausted the interface list.
    #[must_use]
    pub fn continue_() -> Action {
        Action::Gact(GactVerdict::Continue)
    }

    /// The `gact shot` (drop) action emitted by virt-rule `drop` targets.
    #[must_use]
    pub fn drop() -> Action {
        Action::Gact(GactVerdict::Shot)
    }
}
