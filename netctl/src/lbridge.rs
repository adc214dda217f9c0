// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The Linux-bridge helper (C5).
//!
//! Wraps a kernel `bridge` device: creation, port enslavement, and
//! teardown. Used by the `direct`, `vlan`, `vxlan-mcast`, and `vxlan-e2e`
//! network types (§4.6), which rely on the kernel's own learning-switch
//! forwarding rather than the flower-based static bridge (C6).

use crate::error::NetlinkOpError;
use crate::ifindex::{IfIndex, IfName};
use crate::kernel::{KernelHandle, LinkKind};

/// A Linux bridge device plus the set of interfaces currently enslaved to it.
pub struct Lbridge {
    ifindex: IfIndex,
    name: IfName,
    members: Vec<IfIndex>,
}

impl Lbridge {
    /// Create a new kernel bridge device named `name` and bring it up.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if link creation or `link_set_up` fails.
    pub async fn init(kernel: &impl KernelHandle, name: IfName) -> Result<Lbridge, NetlinkOpError> {
        let ifindex = kernel
            .create_link(&name, LinkKind::Bridge { vlan_filtering: false })
            .await?;
        kernel.link_set_up(ifindex).await?;
        tracing::debug!(target: "netops", bridge = name.as_str(), "lbridge initialized");
        Ok(Lbridge {
            ifindex,
            name,
            members: Vec::new(),
        })
    }

    /// The bridge device's kernel ifindex.
    #[must_use]
    pub fn ifindex(&self) -> IfIndex {
        self.ifindex
    }

    /// The bridge device's name.
    #[must_use]
    pub fn name(&self) -> &IfName {
        &self.name
    }

    /// Enslave `iface` to this bridge and bring it up.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `link_set_master` or `link_set_up` fails.
    pub async fn add(&mut self, kernel: &impl KernelHandle, iface: IfIndex) -> Result<(), NetlinkOpError> {
        kernel.link_set_master(iface, self.ifindex).await?;
        kernel.link_set_up(iface).await?;
        self.members.push(iface);
        Ok(())
    }

    /// Unenslave `iface` from this bridge (sets its master to itself,
    /// i.e. detaches it; the interface is not deleted).
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `link_set_master` fails.
    pub async fn remove(&mut self, kernel: &impl KernelHandle, iface: IfIndex) -> Result<(), NetlinkOpError> {
        kernel.link_set_master(iface, iface).await?;
        self.members.retain(|m| *m != iface);
        Ok(())
    }

    /// Delete the bridge device. Elided (no kernel write, members list
    /// just cleared) when `decommit_disabled` is set.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if `delete_link` fails.
    pub async fn free(mut self, kernel: &impl KernelHandle, decommit_disabled: bool) -> Result<(), NetlinkOpError> {
        if !decommit_disabled {
            kernel.delete_link(self.ifindex).await?;
        }
        self.members.clear();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::kernel::{KernelRequest, MockKernel};

    #[tokio::test]
    async fn init_creates_and_brings_up_bridge() {
        let kernel = MockKernel::new();
        let bridge = Lbridge::init(&kernel, IfName::new("br-a").unwrap()).await.unwrap();
        let log = kernel.log();
        assert!(matches!(log[0], KernelRequest::CreateLink { .. }));
        assert!(matches!(log[1], KernelRequest::LinkSetUp { ifindex } if ifindex == bridge.ifindex().to_u32()));
    }

    #[tokio::test]
    async fn add_enslaves_and_brings_up_member() {
        let kernel = MockKernel::new();
        let mut bridge = Lbridge::init(&kernel, IfName::new("br-a").unwrap()).await.unwrap();
        let member = kernel.create_link(&IfName::new("veth0").unwrap(), crate::kernel::LinkKind::Dummy).await.unwrap();
        bridge.add(&kernel, member).await.unwrap();
        let log = kernel.log();
        assert!(matches!(log.last(), Some(KernelRequest::LinkSetUp { .. })));
    }

    #[tokio::test]
    async fn free_deletes_device_unless_decommit_disabled() {
        let kernel = MockKernel::new();
        let bridge = Lbridge::init(&kernel, IfName::new("br-a").unwrap()).await.unwrap();
        let before = kernel.log().len();
        bridge.free(&kernel, true).await.unwrap();
        assert_eq!(kernel.log().len(), before);
    }
}
