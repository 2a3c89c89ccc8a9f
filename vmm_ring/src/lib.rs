// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Fixed-capacity circular buffer of timestamped lines, as described by
//! spec.md's console ring: single-producer/single-consumer within one
//! event loop, so no internal locking is needed.

use std::collections::VecDeque;

pub use vmm_wire::Timestamp;

/// A bounded circular buffer of `(Timestamp, String)` entries.
///
/// Entries are always non-decreasing in timestamp as long as the caller
/// only ever calls `write` with a non-decreasing clock source; the ring
/// itself does not enforce this (spec.md's "Clock" note puts that burden
/// on the caller).
pub struct Ring {
    capacity: usize,
    entries: VecDeque<(Timestamp, String)>,
}

impl Ring {
    /// Creates an empty ring with the given fixed capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends `line` timestamped at `ts`. Never fails: if the ring is at
    /// capacity, the oldest entry is overwritten.
    pub fn write(&mut self, ts: Timestamp, line: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((ts, line));
    }

    /// Returns, in chronological order, all entries whose timestamp is
    /// strictly greater than `since`. If `since` predates the oldest
    /// retained entry, every retained entry is returned. Duplicate
    /// timestamps equal to `since` are excluded.
    pub fn read_history(&self, since: Timestamp) -> Vec<(Timestamp, String)> {
        self.entries
            .iter()
            .filter(|(ts, _)| *ts > since)
            .cloned()
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
