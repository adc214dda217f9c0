// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The kernel TC tick-rate, read once per process from `/proc/net/psched`
//! (spec §4.7/§5: "rates are scaled to kernel-timer ticks (read from
//! `/proc/net/psched` once per process)").
//!
//! Grounded on the same `tc`/iproute2 convention the teacher's
//! `interface-manager` policer helpers assume: the file holds four
//! space-separated hex `u32`s, `t2us us2t clock_res mult`, of which only
//! the first two matter for converting a byte rate into the kernel's
//! internal tick-scaled rate representation used by `police`'s rate
//! table.

use std::fs;
use std::sync::OnceLock;

/// The kernel clock's tick/microsecond conversion factors, as exposed by
/// `/proc/net/psched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRate {
    /// Ticks-to-microseconds numerator.
    t2us: u32,
    /// Microseconds-to-ticks numerator.
    us2t: u32,
}

/// A 1:1 fallback used when `/proc/net/psched` cannot be read (absent on
/// non-Linux test hosts, or a sandboxed process without `/proc`): rates
/// pass through unscaled.
const IDENTITY: TickRate = TickRate { t2us: 1, us2t: 1 };

impl TickRate {
    /// Parse the four-hex-field format `/proc/net/psched` exposes.
    #[must_use]
    fn parse(contents: &str) -> Option<TickRate> {
        let mut fields = contents.split_whitespace();
        let t2us = u32::from_str_radix(fields.next()?, 16).ok()?;
        let us2t = u32::from_str_radix(fields.next()?, 16).ok()?;
        if t2us == 0 || us2t == 0 {
            return None;
        }
        Some(TickRate { t2us, us2t })
    }

    /// Scale a byte-per-second rate into the kernel's tick-scaled internal
    /// units the `police` action's rate table expects. A clean passthrough
    /// when `/proc/net/psched` was unreadable or gave a degenerate ratio.
    #[must_use]
    pub fn scale_rate(self, bytes_per_sec: u64) -> u64 {
        bytes_per_sec.saturating_mul(u64::from(self.t2us)) / u64::from(self.us2t)
    }
}

static TICK_RATE: OnceLock<TickRate> = OnceLock::new();

/// The process-global tick rate, read from `/proc/net/psched` on first
/// use and cached for the remainder of the process lifetime (spec §5:
/// "the once-per-process TC tick-rate initialisation... guarded by a
/// one-shot gate").
#[must_use]
pub fn tick_rate() -> TickRate {
    *TICK_RATE.get_or_init(|| {
        fs::read_to_string("/proc/net/psched")
            .ok()
            .and_then(|s| TickRate::parse(&s))
            .unwrap_or(IDENTITY)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // valid in test code
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        let rate = TickRate::parse("000003e8 00000040 000f4240 3b9aca00").unwrap();
        assert_eq!(rate.t2us, 0x3e8);
        assert_eq!(rate.us2t, 0x40);
    }

    #[test]
    fn rejects_zero_fields() {
        assert!(TickRate::parse("00000000 00000040 0 0").is_none());
    }

    #[test]
    fn identity_is_a_passthrough() {
        assert_eq!(IDENTITY.scale_rate(1_000_000), 1_000_000);
    }

    #[test]
    fn malformed_input_yields_none() {
        assert!(TickRate::parse("not hex").is_none());
    }
}
