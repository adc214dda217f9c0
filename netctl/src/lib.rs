// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The kernel-programming layer (§6.2's operation catalogue plus C3-C6 of
//! the component design): a pluggable [`kernel::KernelHandle`] trait, a
//! ruleset compiler, a broadcast replicator, and the two bridging helpers
//! (Linux-bridge and static-bridge) the core crate's network-type vtable
//! drives.
//!
//! Grounded on the teacher's `interface-manager` crate (concrete
//! rtnetlink/TC vocabulary) collapsed into a synchronous request surface,
//! per `SPEC_FULL.md` §4.C.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod action;
pub mod broadcast;
pub mod error;
pub mod filter;
pub mod ifindex;
pub mod kernel;
pub mod lbridge;
pub mod psched;
pub mod ruleset;
pub mod sbridge;

pub use action::{Action, GactVerdict, MirredMode, Police, TunnelKeySet};
pub use broadcast::{Broadcast, BroadcastEntryId};
pub use error::NetlinkOpError;
pub use filter::{ChainIndex, FlowerKey, MacMatch, MatchField, Priority};
pub use ifindex::{IfIndex, IfName};
pub use kernel::{FdbKey, FdbTarget, KernelHandle, LinkKind, MockKernel, QdiscKind, RtnetlinkKernel};
pub use lbridge::Lbridge;
pub use psched::{tick_rate, TickRate};
pub use ruleset::{RuleError, Ruleset};
pub use sbridge::{RouteId, Sbridge, SbridgeIfId};
