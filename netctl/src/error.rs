// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors raised by the kernel-programming layer.

use net_types::mac::Mac;

/// A failure while issuing a request against the kernel interface.
///
/// This is the error type every [`crate::kernel::KernelHandle`] method
/// returns; the commit engine above classifies it into `Netlink`/`NoMem`
/// outcomes per the object state machine.
#[derive(Debug, thiserror::Error)]
pub enum NetlinkOpError {
    /// The underlying rtnetlink request failed.
    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),
    /// Failed to open the rtnetlink socket.
    #[error("failed to open rtnetlink socket: {0}")]
    Io(#[from] std::io::Error),
    /// The kernel reported ENOMEM (or the mock simulated it).
    #[error("kernel reported out of memory")]
    NoMem,
    /// A referenced interface does not exist.
    #[error("no such interface: {0}")]
    NoSuchInterface(String),
    /// A referenced FDB entry does not exist.
    #[error("no such fdb entry: ifindex={ifindex} mac={mac}")]
    NoSuchFdbEntry {
        /// The interface index the entry was expected to live on.
        ifindex: u32,
        /// The entry's MAC key.
        mac: Mac,
    },
}
