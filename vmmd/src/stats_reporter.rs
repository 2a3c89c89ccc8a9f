// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The stats reporter: a background thread that periodically logs a
//! one-line summary of the daemon's lifetime activity (spec.md §4.4:
//! "periodically logs a summary: uptime, VMs created, VMs destroyed,
//! currently running"). This is deliberately just a log line, not a metrics
//! endpoint -- the wider `stat.sock` helper fan-out is the channel for
//! anything a monitoring system would consume.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Shared counters updated by the engine-owner thread as `Create`s finalize
/// and VMs are reaped, and read back by the reporter thread. Plain atomics
/// rather than a channel: these are monotonic counters with no ordering
/// requirement relative to anything else, unlike the engine's own state.
pub struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    running: AtomicUsize,
    started_at: Instant,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            started_at: Instant::now(),
        })
    }

    /// Called once per successfully finalized `Create` (phase 2 completed).
    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per VM the reaper removes from the table, regardless of
    /// whether that was triggered by an explicit `Destroy` or the child
    /// exiting on its own.
    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.running.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Spawns the reporter thread, logging a summary line every
/// [`REPORT_INTERVAL`] until the process exits.
pub fn spawn(counters: Arc<Counters>) {
    thread::Builder::new()
        .name("stats-reporter".into())
        .spawn(move || run(counters))
        .expect("failed to spawn stats reporter thread");
}

fn run(counters: Arc<Counters>) {
    loop {
        thread::sleep(REPORT_INTERVAL);
        info!(
            "uptime={}s created={} destroyed={} running={}",
            counters.started_at.elapsed().as_secs(),
            counters.created.load(Ordering::Relaxed),
            counters.destroyed.load(Ordering::Relaxed),
            counters.running.load(Ordering::Relaxed),
        );
    }
}
