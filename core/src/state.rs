// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The object state machine (spec §3's "State enum").

/// The commit-lifecycle state every mutable model object carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Created this session, never committed.
    New,
    /// Committed once (`Ok`), then mutated; the previous kernel state is
    /// stale and must be decommitted before the new one is installed.
    Renew,
    /// Committed and believed to match the installed kernel state.
    Ok,
    /// Marked for removal by the user; awaiting the decommit phase.
    Delete,
    /// A recoverable per-object commit error; kernel state is unchanged
    /// from before the attempt. Retriable on the next `commit`.
    Err,
    /// An unrecoverable decommit error. The owning context is marked
    /// inconsistent; the object's kernel state is of unknown shape.
    Fail,
}

impl ObjectState {
    /// Apply a user mutation: `Ok` → `Renew`, `New`/`Renew` are no-ops,
    /// anything else (mutating a deleted/failed/errored object) is also
    /// a no-op on state — callers are expected to reject mutations on
    /// objects in those states before reaching here.
    pub fn mark_mutated(&mut self) {
        if *self == ObjectState::Ok {
            *self = ObjectState::Renew;
        }
    }

    /// Apply a user delete. Returns `true` if the object should be freed
    /// immediately (it was `New`, so there is nothing to decommit),
    /// `false` if it should transition to `Delete` and await Phase D.
    #[must_use]
    pub fn mark_deleted(&mut self) -> bool {
        if *self == ObjectState::New {
            true
        } else {
            *self = ObjectState::Delete;
            false
        }
    }

    /// Whether this object should be visited by Phase R (recommit) of the
    /// commit engine. `Err` is included: it is the retriable per-object
    /// failure state, and the next `commit` must attempt it again.
    #[must_use]
    pub fn needs_commit(&self) -> bool {
        matches!(self, ObjectState::New | ObjectState::Renew | ObjectState::Err)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mutating_ok_transitions_to_renew() {
        let mut s = ObjectState::Ok;
        s.mark_mutated();
        assert_eq!(s, ObjectState::Renew);
    }

    #[test]
    fn mutating_new_is_a_noop() {
        let mut s = ObjectState::New;
        s.mark_mutated();
        assert_eq!(s, ObjectState::New);
    }

    #[test]
    fn deleting_new_frees_immediately() {
        let mut s = ObjectState::New;
        assert!(s.mark_deleted());
    }

    #[test]
    fn deleting_ok_transitions_to_delete() {
        let mut s = ObjectState::Ok;
        assert!(!s.mark_deleted());
        assert_eq!(s, ObjectState::Delete);
    }
}
