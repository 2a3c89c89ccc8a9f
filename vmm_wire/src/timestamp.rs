// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::time::{SystemTime, UNIX_EPOCH};

/// A wall-clock timestamp expressed as whole seconds since the Unix epoch
/// plus a picosecond fraction, matching the precision the console wire
/// vocabulary uses for `History` cursors and `Data` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timestamp {
    pub secs: u64,
    pub picos: u64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, picos: 0 };

    pub fn new(secs: u64, picos: u64) -> Self {
        Self { secs, picos }
    }

    /// The current wall-clock time. Implementers of a console clock must
    /// use a source that is at least non-decreasing during steady state;
    /// `SystemTime` satisfies that on any sane system clock.
    pub fn now() -> Self {
        let dur = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: dur.as_secs(),
            picos: u64::from(dur.subsec_nanos()) * 1_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_on_secs_then_picos() {
        let a = Timestamp::new(1, 500);
        let b = Timestamp::new(1, 600);
        let c = Timestamp::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn now_is_nonzero_on_a_real_clock() {
        assert!(Timestamp::now() > Timestamp::ZERO);
    }
}
