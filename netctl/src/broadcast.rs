// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The broadcast replicator (C4).
//!
//! Each kernel filter admits at most [`Broadcast::ACT_MAX`] actions; a
//! [`Broadcast`] packs up to [`Broadcast::MAX_REPLICAS_PER_FILTER`]
//! (`ACT_MAX - 1`) replication entries into one filter, reserving the last
//! action slot for an unconditional `continue`, and overflows into
//! additional filters at ascending priorities within the same chain.
//!
//! Grounded on the ruleset compiler (C3, `ruleset.rs`)'s
//! create/update/delete write protocol; a `Broadcast` is, in effect, a
//! single always-matching `Prio` whose "rule" entries are never deduped by
//! key (every entry is a distinct replica, not a distinct destination).

use crate::action::Action;
use crate::error::NetlinkOpError;
use crate::filter::{ActionEntry, ChainIndex, FlowerKey, FlowerRule, Priority};
use crate::kernel::FilterLocation;
use crate::kernel::KernelHandle;

/// An opaque handle to one replication entry previously added with
/// [`Broadcast::add`]. Used to remove exactly that entry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BroadcastEntryId(u64);

struct Entry {
    id: BroadcastEntryId,
    actions: Vec<Action>,
}

struct Filter {
    priority: u16,
    entries: Vec<Entry>,
}

impl Filter {
    fn used_slots(&self) -> usize {
        self.entries.iter().map(|e| e.actions.len()).sum()
    }

    fn free_slots(&self) -> usize {
        Broadcast::MAX_REPLICAS_PER_FILTER.saturating_sub(self.used_slots())
    }

    /// The flattened action list actually written to the kernel: every
    /// entry's actions, insertion order, followed by a trailing
    /// unconditional continue occupying the filter's reserved slot.
    fn rule(&self) -> FlowerRule {
        let mut sources = Vec::with_capacity(self.entries.len() + 1);
        for (i, entry) in self.entries.iter().enumerate() {
            sources.push(ActionEntry {
                sub_priority: i as u32,
                actions: entry.actions.clone(),
            });
        }
        sources.push(ActionEntry {
            sub_priority: self.entries.len() as u32,
            actions: vec![Action::continue_()],
        });
        FlowerRule {
            key: FlowerKey::new(Vec::new()),
            sources,
        }
    }
}

/// An ordered chain of flower filters implementing broadcast replication
/// to up to an unbounded number of destinations, all within one chain id
/// on one interface.
pub struct Broadcast {
    ifindex: u32,
    chain: ChainIndex,
    prio_start: u16,
    filters: Vec<Filter>,
    next_id: u64,
}

impl Broadcast {
    /// The kernel's hard cap on actions per filter (`TCA_ACT_MAX_PRIO`).
    pub const ACT_MAX: usize = 32;
    /// Replication actions a filter can hold once one slot is reserved
    /// for the trailing `continue`.
    pub const MAX_REPLICAS_PER_FILTER: usize = Broadcast::ACT_MAX - 1;

    /// Bind a new broadcast replicator to `ifindex`/`chain`, with its
    /// first filter allocated at priority `prio_start`.
    #[must_use]
    pub fn new(ifindex: u32, chain: ChainIndex, prio_start: u16) -> Broadcast {
        Broadcast {
            ifindex,
            chain,
            prio_start,
            filters: Vec::new(),
            next_id: 0,
        }
    }

    /// Each broadcast filter occupies a priority of its own (never shared
    /// with another masked key), so a fixed handle identifies it.
    const HANDLE: u32 = 1;

    fn location(&self, priority: u16) -> Option<FilterLocation> {
        Some(FilterLocation {
            ifindex: self.ifindex,
            chain: self.chain,
            priority: Priority::new(std::num::NonZero::new(priority)?),
            handle: Broadcast::HANDLE,
        })
    }

    /// Add one replication entry, whose action list occupies `actions.len()`
    /// of a filter's reserved slots. Finds the first filter in chain order
    /// with enough free slots, or allocates a new filter at the next
    /// priority.
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if the kernel write fails.
    pub async fn add(
        &mut self,
        kernel: &impl KernelHandle,
        actions: Vec<Action>,
    ) -> Result<BroadcastEntryId, NetlinkOpError> {
        let needed = actions.len();
        let id = BroadcastEntryId(self.next_id);
        self.next_id += 1;

        let slot = self.filters.iter().position(|f| f.free_slots() >= needed);
        match slot {
            Some(i) => {
                self.filters[i].entries.push(Entry { id, actions });
                let rule = self.filters[i].rule();
                let at = self
                    .location(self.filters[i].priority)
                    .ok_or(NetlinkOpError::NoMem)?;
                kernel.update_flower(at, &rule).await?;
            }
            None => {
                let priority = self.prio_start + self.filters.len() as u16;
                let filter = Filter {
                    priority,
                    entries: vec![Entry { id, actions }],
                };
                let rule = filter.rule();
                let at = self.location(priority).ok_or(NetlinkOpError::NoMem)?;
                kernel.create_flower(at, &rule).await?;
                self.filters.push(filter);
            }
        }
        Ok(id)
    }

    /// Remove the replication entry identified by `id`. Re-emits the
    /// owning filter as an update, or deletes it if it becomes empty.
    /// When `decommit_disabled` is set the in-memory bookkeeping is still
    /// updated but no kernel write is issued (matching the context-wide
    /// decommit-disable flag's contract).
    ///
    /// # Errors
    ///
    /// Returns [`NetlinkOpError`] if the kernel write fails.
    pub async fn remove(
        &mut self,
        kernel: &impl KernelHandle,
        id: BroadcastEntryId,
        decommit_disabled: bool,
    ) -> Result<(), NetlinkOpError> {
        let Some(i) = self.filters.iter().position(|f| f.entries.iter().any(|e| e.id == id)) else {
            return Ok(());
        };
        self.filters[i].entries.retain(|e| e.id != id);
        if self.filters[i].entries.is_empty() {
            if !decommit_disabled {
                let at = self.location(self.filters[i].priority).ok_or(NetlinkOpError::NoMem)?;
                kernel.delete_flower(at).await?;
            }
            self.filters.remove(i);
        } else if !decommit_disabled {
            let rule = self.filters[i].rule();
            let at = self.location(self.filters[i].priority).ok_or(NetlinkOpError::NoMem)?;
            kernel.update_flower(at, &rule).await?;
        }
        Ok(())
    }

    /// The number of filters currently materialized (for test assertions:
    /// "a broadcast with 63 destinations occupies exactly 3 filters").
    #[must_use]
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::kernel::{KernelRequest, MockKernel};

    fn one_action() -> Vec<Action> {
        vec![Action::egress_redirect(7)]
    }

    #[tokio::test]
    async fn single_filter_holds_31_replicas() {
        let kernel = MockKernel::new();
        let mut bc = Broadcast::new(10, ChainIndex(1), 1);
        for _ in 0..Broadcast::MAX_REPLICAS_PER_FILTER {
            bc.add(&kernel, one_action()).await.unwrap();
        }
        assert_eq!(bc.filter_count(), 1);
    }

    #[tokio::test]
    async fn thirty_second_replica_overflows_to_new_filter() {
        let kernel = MockKernel::new();
        let mut bc = Broadcast::new(10, ChainIndex(1), 1);
        for _ in 0..=Broadcast::MAX_REPLICAS_PER_FILTER {
            bc.add(&kernel, one_action()).await.unwrap();
        }
        assert_eq!(bc.filter_count(), 2);
    }

    #[tokio::test]
    async fn sixty_three_destinations_occupy_exactly_three_filters() {
        let kernel = MockKernel::new();
        let mut bc = Broadcast::new(10, ChainIndex(1), 1);
        for _ in 0..63 {
            bc.add(&kernel, one_action()).await.unwrap();
        }
        assert_eq!(bc.filter_count(), 3);
    }

    #[tokio::test]
    async fn removing_last_entry_deletes_filter() {
        let kernel = MockKernel::new();
        let mut bc = Broadcast::new(10, ChainIndex(1), 1);
        let id = bc.add(&kernel, one_action()).await.unwrap();
        bc.remove(&kernel, id, false).await.unwrap();
        assert_eq!(bc.filter_count(), 0);
        assert!(matches!(kernel.log().last().unwrap(), KernelRequest::DeleteFlower { .. }));
    }

    #[tokio::test]
    async fn decommit_disabled_elides_kernel_write_on_removal() {
        let kernel = MockKernel::new();
        let mut bc = Broadcast::new(10, ChainIndex(1), 1);
        let id = bc.add(&kernel, one_action()).await.unwrap();
        let before = kernel.log().len();
        bc.remove(&kernel, id, true).await.unwrap();
        assert_eq!(bc.filter_count(), 0);
        assert_eq!(kernel.log().len(), before);
    }
}
