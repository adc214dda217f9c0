// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The overlay network controller's object graph and commit engine:
//! the declarative model (settings/network/phys/PA/virt/virt-rule), the
//! validator (C9), and the two-phase commit engine (C10) that drives the
//! whole graph against one [`netctl::KernelHandle`].

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod arena;
pub mod commit;
pub mod context;
pub mod error;
pub mod ids;
pub mod iface;
pub mod names;
pub mod network;
pub mod pa;
pub mod phys;
pub mod problem;
pub mod rule;
pub mod settings;
pub mod state;
pub mod validator;
pub mod virt;
pub mod vtable;

pub use commit::{commit, CommitResult};
pub use context::Context;
pub use error::{CommitOutcome, LsdnError};
pub use ids::{NetId, PaId, PhysId, RemotePaId, RemoteVirtId, SettingsId, VirtId, VrId};
pub use problem::{Problem, ProblemCode, Ref, MAX_PROBLEM_REFS};
pub use rule::{Direction, MatchTarget, RuleAction, VirtRule, MAX_MATCH_TARGETS, MAX_PRIORITY};
pub use settings::{EncapKind, Settings, SwitchingModel, UserHooks};
pub use state::ObjectState;
pub use virt::{Rate, Virt, MTU_UNKNOWN};
