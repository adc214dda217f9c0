// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface handle (C2): the triple state every named kernel interface
//! reference carries — unset, named-only, or resolved to a kernel
//! ifindex.

use netctl::{IfIndex, IfName, KernelHandle, NetlinkOpError};

/// A reference to a kernel interface, named by the user and optionally
/// resolved to a live `ifindex`.
#[derive(Debug, Clone, Default)]
pub enum IfaceHandle {
    #[default]
    Unset,
    Named(IfName),
    Resolved(IfName, IfIndex),
}

impl IfaceHandle {
    #[must_use]
    pub fn name(&self) -> Option<&IfName> {
        match self {
            IfaceHandle::Unset => None,
            IfaceHandle::Named(n) | IfaceHandle::Resolved(n, _) => Some(n),
        }
    }

    #[must_use]
    pub fn ifindex(&self) -> Option<IfIndex> {
        match self {
            IfaceHandle::Resolved(_, idx) => Some(*idx),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, IfaceHandle::Resolved(..))
    }

    /// Resolve a named-only handle to a live ifindex by querying the
    /// kernel. Idempotent once successful: calling again on an already
    /// `Resolved` handle is a no-op that returns the cached index.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError::NoSuchInterface`] if the named interface
    /// cannot be found.
    pub async fn resolve(&mut self, kernel: &impl KernelHandle) -> Result<IfIndex, NetlinkOpError> {
        match self {
            IfaceHandle::Unset => Err(NetlinkOpError::NoSuchInterface("<unset>".to_string())),
            IfaceHandle::Resolved(_, idx) => Ok(*idx),
            IfaceHandle::Named(name) => {
                let idx = resolve_by_name(kernel, name).await?;
                *self = IfaceHandle::Resolved(name.clone(), idx);
                Ok(idx)
            }
        }
    }
}

/// Look an interface up by name via [`KernelHandle::resolve_link`],
/// which fails with `NoSuchInterface` exactly when the name does not
/// resolve (spec §4.1: "fails with `NoIf` if the named interface does
/// not exist").
async fn resolve_by_name(kernel: &impl KernelHandle, name: &IfName) -> Result<IfIndex, NetlinkOpError> {
    kernel.resolve_link(name).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;

    #[test]
    fn unset_has_no_name_or_index() {
        let h = IfaceHandle::Unset;
        assert!(h.name().is_none());
        assert!(h.ifindex().is_none());
        assert!(!h.is_resolved());
    }

    #[test]
    fn named_has_name_but_no_index() {
        let h = IfaceHandle::Named(IfName::new("eth0").unwrap());
        assert!(h.name().is_some());
        assert!(h.ifindex().is_none());
    }

    #[test]
    fn resolved_has_both() {
        let h = IfaceHandle::Resolved(IfName::new("eth0").unwrap(), IfIndex::new(3));
        assert!(h.name().is_some());
        assert_eq!(h.ifindex().unwrap().to_u32(), 3);
        assert!(h.is_resolved());
    }
}
