// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Arena handle types (C1-C2's "interface handle" generalized to every
//! entity kind).
//!
//! Per `SPEC_FULL.md` §3 / DESIGN NOTES §9 ("keep the graph in per-kind
//! arenas... reference other nodes by typed indices"), every cross-link
//! in the object graph (§3's `⊕` references) is one of these `u32`-backed
//! newtypes rather than a shared pointer. Back-references (phys → PA →
//! phys) are arena lookups, not pointers, which keeps the graph free of
//! reference cycles.

use std::fmt::{Debug, Display, Formatter};

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(pub(crate) u32);

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                Display::fmt(&self.0, f)
            }
        }
    };
}

arena_id!(SettingsId);
arena_id!(NetId);
arena_id!(PhysId);
arena_id!(PaId);
arena_id!(VirtId);
arena_id!(VrId);
arena_id!(RemotePaId);
arena_id!(RemoteVirtId);
