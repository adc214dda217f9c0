// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Identifier & naming (C1): a unique-name registry per scope, plus
//! `Context`'s auto-generated-name counter.

use std::collections::HashMap;

/// The outcome of registering a name into a [`NameRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameResult {
    Ok,
    Duplicate,
}

/// A scope's set of unique names, each mapped to the `u32` arena id of
/// the object it names. One registry exists per (context, kind) or per
/// (network, kind=virt) per spec §4.1/invariant 1.
#[derive(Debug, Default, Clone)]
pub struct NameRegistry {
    by_name: HashMap<String, u32>,
}

impl NameRegistry {
    #[must_use]
    pub fn new() -> NameRegistry {
        NameRegistry::default()
    }

    /// Register `name` → `id`. Returns [`NameResult::Duplicate`] without
    /// mutating the registry if `name` is already taken.
    pub fn insert(&mut self, name: &str, id: u32) -> NameResult {
        if self.by_name.contains_key(name) {
            return NameResult::Duplicate;
        }
        self.by_name.insert(name.to_string(), id);
        NameResult::Ok
    }

    /// Re-register an existing id under a new name, atomically failing
    /// (leaving the old name bound) if the new name collides with a
    /// *different* id.
    pub fn rename(&mut self, old: &str, new: &str, id: u32) -> NameResult {
        if old == new {
            return NameResult::Ok;
        }
        if let Some(existing) = self.by_name.get(new) {
            if *existing != id {
                return NameResult::Duplicate;
            }
        }
        self.by_name.remove(old);
        self.by_name.insert(new.to_string(), id);
        NameResult::Ok
    }

    pub fn remove(&mut self, name: &str) {
        self.by_name.remove(name);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

/// The name reserved for "the user did not specify settings for a
/// network" (spec §3 invariant 1).
pub const DEFAULT_SETTINGS_NAME: &str = "default";

/// `generate_name(ctx, kind)`: `"<ctxname>-<kind>-<counter++>"`, with a
/// monotone per-`(Context)` counter that is never reused even across
/// free/new cycles within one process (spec §5 supplement item 3).
#[derive(Debug, Default, Clone)]
pub struct NameGenerator {
    counter: u64,
}

impl NameGenerator {
    #[must_use]
    pub fn new() -> NameGenerator {
        NameGenerator::default()
    }

    #[must_use]
    pub fn generate(&mut self, ctx_name: &str, kind: &str) -> String {
        let n = self.counter;
        self.counter += 1;
        format!("{ctx_name}-{kind}-{n}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut r = NameRegistry::new();
        assert_eq!(r.insert("a", 1), NameResult::Ok);
        assert_eq!(r.insert("a", 2), NameResult::Duplicate);
    }

    #[test]
    fn generated_names_increment_and_never_repeat() {
        let mut gen = NameGenerator::new();
        assert_eq!(gen.generate("ctx", "net"), "ctx-net-0");
        assert_eq!(gen.generate("ctx", "net"), "ctx-net-1");
    }

    #[test]
    fn counter_does_not_reset_across_different_kinds() {
        let mut gen = NameGenerator::new();
        assert_eq!(gen.generate("ctx", "net"), "ctx-net-0");
        assert_eq!(gen.generate("ctx", "phys"), "ctx-phys-1");
    }

    #[test]
    fn rename_to_same_name_is_a_noop_ok() {
        let mut r = NameRegistry::new();
        r.insert("a", 1);
        assert_eq!(r.rename("a", "a", 1), NameResult::Ok);
    }

    #[test]
    fn rename_colliding_with_other_id_is_rejected() {
        let mut r = NameRegistry::new();
        r.insert("a", 1);
        r.insert("b", 2);
        assert_eq!(r.rename("a", "b", 1), NameResult::Duplicate);
        assert_eq!(r.get("a"), Some(1));
    }
}
