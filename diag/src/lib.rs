// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Process-lifetime diagnostics gate.
//!
//! Reads `LSDN_DEBUG` once, behind a one-shot gate, and wires a
//! [`tracing`] subscriber accordingly. There is no live reconfiguration:
//! the control-socket daemon that would otherwise flip categories at
//! runtime is out of scope here, so the filter is fixed for the process
//! lifetime once [`init`] has run.

use std::process;
use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// A diagnostics category. Target modules emit events under one of these
/// via [`tracing::event!(target: "netops", ...)`]-style calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Network-type vtable hook invocations: create/remove/validate calls
    /// issued against phys attachments and virts.
    NetOps,
    /// Ruleset compiler and broadcast replicator writes: flower filter
    /// and action emission.
    Rules,
}

impl Category {
    const ALL: [Category; 2] = [Category::NetOps, Category::Rules];

    /// The `tracing` target string this category is emitted under.
    #[must_use]
    pub const fn target(self) -> &'static str {
        match self {
            Category::NetOps => "netops",
            Category::Rules => "rules",
        }
    }

    fn from_name(name: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| c.target() == name)
    }
}

static INIT: Once = Once::new();

/// Initialize the global `tracing` subscriber from `LSDN_DEBUG`.
///
/// Idempotent: only the first call has any effect, matching the one-shot
/// gate the rest of the engine uses for lazily-initialized process state
/// (the rtnetlink socket, the `/proc/net/psched` tick-rate read).
///
/// # Process exit
///
/// If `LSDN_DEBUG` names a category that is not in [`Category::ALL`],
/// this prints an error to stderr and terminates the process
/// (`std::process::exit(1)`) rather than returning an error, matching the
/// documented contract that unknown values abort the process.
pub fn init() {
    INIT.call_once(|| {
        let enabled = parse_env();
        let mut filter = EnvFilter::new("info");
        for category in enabled {
            let directive = format!("{}=debug", category.target());
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_line_number(true);
        let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            tracing::warn!("diagnostics subscriber already installed, LSDN_DEBUG ignored");
        }
    });
}

fn parse_env() -> Vec<Category> {
    let Ok(raw) = std::env::var("LSDN_DEBUG") else {
        return Vec::new();
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    if raw == "all" {
        return Category::ALL.to_vec();
    }
    let mut categories = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match Category::from_name(name) {
            Some(category) => categories.push(category),
            None => {
                eprintln!("LSDN_DEBUG: unknown diagnostics category '{name}'");
                process::exit(1);
            }
        }
    }
    categories
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn category_target_strings() {
        assert_eq!(Category::NetOps.target(), "netops");
        assert_eq!(Category::Rules.target(), "rules");
    }

    #[test]
    fn from_name_roundtrips() {
        assert_eq!(Category::from_name("netops"), Some(Category::NetOps));
        assert_eq!(Category::from_name("rules"), Some(Category::Rules));
        assert_eq!(Category::from_name("bogus"), None);
    }
}
