// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The ruleset compiler (C3).
//!
//! A [`Ruleset`] is bound to one interface and one chain inside a parent
//! qdisc handle. It reserves a priority window `[prio_start, prio_start +
//! prio_count)` and contains any number of [`Prio`] blocks, each pinning a
//! match schema (the set of match-field kinds and masks shared by every
//! rule in that `Prio`). Within a `Prio`, rules whose masked key-tuples
//! are identical are packed into one flower filter as an ordered,
//! sub-priority-sorted action list; rules with distinct masked key-tuples
//! become distinct flower filters (distinct kernel handles) at the same
//! priority.
//!
//! Grounded on the teacher's `tc/{chain,filter/mod}.rs` request shaping
//! (`Create`/`Update`/`Remove` against `Manager<Filter>`), adapted into a
//! plain async API over [`KernelHandle`] since this workspace's diffing
//! lives in the core crate's commit engine, not here.

use std::collections::HashMap;
use std::num::NonZero;

use crate::action::Action;
use crate::error::NetlinkOpError;
use crate::filter::{ActionEntry, ChainIndex, FlowerKey, FlowerRule, MatchField, Priority};
use crate::kernel::FilterLocation;
use crate::kernel::KernelHandle;

/// The set of match-field *kinds* (not values) a `Prio` pins. Two match
/// fields have the same kind iff they are the same enum variant.
fn field_kind(field: &MatchField) -> u8 {
    match field {
        MatchField::SrcMac(_) => 0,
        MatchField::DstMac(_) => 1,
        MatchField::SrcIpv4(_) => 2,
        MatchField::DstIpv4(_) => 3,
        MatchField::SrcIpv6(_) => 4,
        MatchField::DstIpv6(_) => 5,
        MatchField::EthType(_) => 6,
        MatchField::EncKeyId(_) => 7,
    }
}

/// Error raised when a rule's fields don't match the `Prio`'s pinned schema.
#[derive(Debug, thiserror::Error)]
#[error("rule's match-field schema does not match this priority's pinned schema")]
pub struct SchemaMismatch;

/// Error raised when a `prio_offset` falls outside the ruleset's reserved window.
#[derive(Debug, thiserror::Error)]
#[error("priority offset {0} is outside the reserved window")]
pub struct PriorityOutOfRange(pub u16);

/// Error raised when a rule is added at a sub-priority that already has an
/// entry for the same masked key (spec §4.2 Failures).
#[derive(Debug, thiserror::Error)]
#[error("sub-priority {0} already has an entry at this key")]
pub struct Duplicate(pub u32);

struct Prio {
    schema: Vec<u8>,
    rules: HashMap<FlowerKey, (u32, FlowerRule)>,
}

impl Prio {
    fn new(schema: Vec<u8>) -> Prio {
        Prio {
            schema,
            rules: HashMap::new(),
        }
    }

    fn matches_schema(&self, fields: &[MatchField]) -> bool {
        let kinds: Vec<u8> = fields.iter().map(field_kind).collect();
        kinds == self.schema
    }
}

/// A compiler-owned allocator for flower filter handles, unique within one
/// `(ifindex, chain)`.
struct HandleAllocator {
    next: u32,
}

impl HandleAllocator {
    fn new() -> HandleAllocator {
        HandleAllocator { next: 1 }
    }

    fn alloc(&mut self) -> u32 {
        let handle = self.next;
        self.next += 1;
        handle
    }
}

/// A ruleset compiler bound to one interface and chain.
pub struct Ruleset {
    ifindex: u32,
    chain: ChainIndex,
    prio_start: u16,
    prio_count: u16,
    prios: HashMap<u16, Prio>,
    handles: HandleAllocator,
}

impl Ruleset {
    /// Bind a new ruleset to `ifindex`/`chain`, reserving the priority
    /// window `[prio_start, prio_start + prio_count)`.
    #[must_use]
    pub fn new(ifindex: u32, chain: ChainIndex, prio_start: u16, prio_count: u16) -> Ruleset {
        Ruleset {
            ifindex,
            chain,
            prio_start,
            prio_count,
            prios: HashMap::new(),
            handles: HandleAllocator::new(),
        }
    }

    fn priority_for(&self, prio_offset: u16) -> Result<Priority, PriorityOutOfRange> {
        if prio_offset >= self.prio_count {
            return Err(PriorityOutOfRange(prio_offset));
        }
        let raw = self.prio_start + prio_offset;
        NonZero::new(raw)
            .map(Priority::new)
            .ok_or(PriorityOutOfRange(prio_offset))
    }

    /// Add one rule at sub-priority `sub_priority` within the `Prio` at
    /// `prio_offset`. The first rule added to a `Prio` pins its schema;
    /// subsequent rules at the same `prio_offset` must share that schema
    /// (invariant 6 of the data model: match-target set and masks must be
    /// identical within one priority).
    ///
    /// # Errors
    ///
    /// Returns [`PriorityOutOfRange`] if `prio_offset` falls outside the
    /// reserved window, [`SchemaMismatch`] if `fields`' kinds differ from
    /// the `Prio`'s pinned schema, [`Duplicate`] if `sub_priority` already
    /// has an entry at this masked key, or [`NetlinkOpError`] if the kernel
    /// write fails.
    pub async fn add_rule(
        &mut self,
        kernel: &impl KernelHandle,
        prio_offset: u16,
        fields: Vec<MatchField>,
        sub_priority: u32,
        actions: Vec<Action>,
    ) -> Result<(), RuleError> {
        let priority = self.priority_for(prio_offset)?;
        let prio = self
            .prios
            .entry(self.prio_start + prio_offset)
            .or_insert_with(|| Prio::new(fields.iter().map(field_kind).collect()));
        if !prio.matches_schema(&fields) {
            return Err(RuleError::Schema(SchemaMismatch));
        }
        let key = FlowerKey::new(fields);
        let entry = ActionEntry {
            sub_priority,
            actions,
        };
        match prio.rules.get_mut(&key) {
            Some((handle, rule)) => {
                if rule.sources.iter().any(|e| e.sub_priority == sub_priority) {
                    return Err(RuleError::Duplicate(Duplicate(sub_priority)));
                }
                let pos = rule
                    .sources
                    .iter()
                    .position(|e| e.sub_priority > sub_priority)
                    .unwrap_or(rule.sources.len());
                rule.sources.insert(pos, entry);
                let at = FilterLocation {
                    ifindex: self.ifindex,
                    chain: self.chain,
                    priority,
                    handle: *handle,
                };
                kernel.update_flower(at, rule).await?;
            }
            None => {
                let handle = self.handles.alloc();
                let rule = FlowerRule {
                    key: key.clone(),
                    sources: vec![entry],
                };
                let at = FilterLocation {
                    ifindex: self.ifindex,
                    chain: self.chain,
                    priority,
                    handle,
                };
                kernel.create_flower(at, &rule).await?;
                prio.rules.insert(key, (handle, rule));
            }
        }
        Ok(())
    }

    /// Remove the rule at sub-priority `sub_priority` from the `Prio` at
    /// `prio_offset` matching `fields`' masked key. If the flower filter
    /// still has sources after removal, it is re-emitted as an update; if
    /// empty, it is deleted.
    ///
    /// # Errors
    ///
    /// Returns [`PriorityOutOfRange`] if `prio_offset` is out of range,
    /// or [`NetlinkOpError`] if the kernel write fails. A no-op (returns
    /// `Ok`) if no such rule exists.
    pub async fn remove_rule(
        &mut self,
        kernel: &impl KernelHandle,
        prio_offset: u16,
        fields: Vec<MatchField>,
        sub_priority: u32,
    ) -> Result<(), RuleError> {
        let priority = self.priority_for(prio_offset)?;
        let Some(prio) = self.prios.get_mut(&(self.prio_start + prio_offset)) else {
            return Ok(());
        };
        let key = FlowerKey::new(fields);
        let Some((handle, rule)) = prio.rules.get_mut(&key) else {
            return Ok(());
        };
        rule.sources.retain(|e| e.sub_priority != sub_priority);
        let at = FilterLocation {
            ifindex: self.ifindex,
            chain: self.chain,
            priority,
            handle: *handle,
        };
        if rule.sources.is_empty() {
            kernel.delete_flower(at).await?;
            prio.rules.remove(&key);
        } else {
            kernel.update_flower(at, rule).await?;
        }
        Ok(())
    }
}

/// Errors a ruleset write can raise.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error(transparent)]
    PriorityOutOfRange(#[from] PriorityOutOfRange),
    #[error(transparent)]
    Schema(#[from] SchemaMismatch),
    #[error(transparent)]
    Duplicate(#[from] Duplicate),
    #[error(transparent)]
    Kernel(#[from] NetlinkOpError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;
    use crate::kernel::MockKernel;
    use net_types::ip::Ipv4Match;
    use std::net::Ipv4Addr;

    fn src_ip(addr: Ipv4Addr) -> Vec<MatchField> {
        vec![MatchField::SrcIpv4(Ipv4Match::host(addr))]
    }

    #[tokio::test]
    async fn distinct_keys_become_distinct_filters() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0, vec![Action::drop()])
            .await
            .unwrap();
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 2)), 0, vec![Action::drop()])
            .await
            .unwrap();
        let creates = kernel
            .log()
            .into_iter()
            .filter(|r| matches!(r, crate::kernel::KernelRequest::CreateFlower { .. }))
            .count();
        assert_eq!(creates, 2);
    }

    #[tokio::test]
    async fn identical_keys_pack_into_one_filter_as_update() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0, vec![Action::drop()])
            .await
            .unwrap();
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 1, vec![Action::continue_()])
            .await
            .unwrap();
        let log = kernel.log();
        assert!(matches!(log[0], crate::kernel::KernelRequest::CreateFlower { .. }));
        assert!(matches!(log[1], crate::kernel::KernelRequest::UpdateFlower { .. }));
    }

    #[tokio::test]
    async fn remove_last_source_deletes_filter() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0, vec![Action::drop()])
            .await
            .unwrap();
        ruleset
            .remove_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0)
            .await
            .unwrap();
        let log = kernel.log();
        assert!(matches!(
            log.last().unwrap(),
            crate::kernel::KernelRequest::DeleteFlower { .. }
        ));
    }

    #[tokio::test]
    async fn priority_out_of_window_is_rejected() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 2);
        let err = ruleset
            .add_rule(&kernel, 5, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0, vec![Action::drop()])
            .await;
        assert!(matches!(err, Err(RuleError::PriorityOutOfRange(_))));
    }

    #[tokio::test]
    async fn sources_stay_sorted_by_sub_priority_regardless_of_insertion_order() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        ruleset
            .add_rule(&kernel, 0, src_ip(addr), 5, vec![Action::drop()])
            .await
            .unwrap();
        ruleset
            .add_rule(&kernel, 0, src_ip(addr), 1, vec![Action::continue_()])
            .await
            .unwrap();
        ruleset
            .add_rule(&kernel, 0, src_ip(addr), 3, vec![Action::drop()])
            .await
            .unwrap();
        let prio = ruleset.prios.get(&1).unwrap();
        let key = FlowerKey::new(src_ip(addr));
        let (_, rule) = prio.rules.get(&key).unwrap();
        let sub_prios: Vec<u32> = rule.sources.iter().map(|e| e.sub_priority).collect();
        assert_eq!(sub_prios, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn same_sub_priority_collision_is_rejected_as_duplicate() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        ruleset
            .add_rule(&kernel, 0, src_ip(addr), 0, vec![Action::drop()])
            .await
            .unwrap();
        let err = ruleset
            .add_rule(&kernel, 0, src_ip(addr), 0, vec![Action::continue_()])
            .await;
        assert!(matches!(err, Err(RuleError::Duplicate(_))));
    }

    #[tokio::test]
    async fn distinct_filters_at_one_priority_get_distinct_handles() {
        let kernel = MockKernel::new();
        let mut ruleset = Ruleset::new(10, ChainIndex(0), 1, 10);
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 1)), 0, vec![Action::drop()])
            .await
            .unwrap();
        ruleset
            .add_rule(&kernel, 0, src_ip(Ipv4Addr::new(10, 0, 0, 2)), 0, vec![Action::drop()])
            .await
            .unwrap();
        let log = kernel.log();
        let handles: Vec<u32> = log
            .iter()
            .filter_map(|r| match r {
                crate::kernel::KernelRequest::CreateFlower { at } => Some(at.handle),
                _ => None,
            })
            .collect();
        assert_eq!(handles.len(), 2);
        assert_ne!(handles[0], handles[1]);
    }
}
