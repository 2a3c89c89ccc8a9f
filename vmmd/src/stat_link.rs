// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connection to the stats helper daemon. Optional, unlike
//! [`crate::console_link`] and [`crate::log_link`]: if nothing is
//! listening at startup, vmmd logs a warning and carries on with stat
//! effects silently dropped, per spec.md's "connect to stats helper
//! (optional -- missing stats degrades silently)." A write error after a
//! successful connection is logged and suppressed (spec.md §7), not
//! fatal: the writer thread simply stops, and every subsequent `Stat`
//! effect is dropped at the supervisor's bounded-queue `try_send`, the
//! same as while never connected.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use log::{debug, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 512;

/// Attempts one connection to the stats helper. Spawns a writer thread on
/// success; on failure, logs a warning and returns a sender whose
/// receiving end is immediately dropped, so every send silently fails --
/// the same observable behavior as a helper that later disconnects.
pub fn spawn(socket_path: &Path) -> SyncSender<Vec<u8>> {
    match UnixStream::connect(socket_path) {
        Ok(stream) => {
            let (tx, rx) = mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);
            thread::Builder::new()
                .name("stat-link".into())
                .spawn(move || run(stream, rx))
                .expect("failed to spawn stat link thread");
            tx
        }
        Err(e) => {
            warn!("stats helper unavailable at {socket_path:?}: {e}; stats will be dropped");
            let (tx, _rx_dropped_immediately) = mpsc::sync_channel(1);
            tx
        }
    }
}

fn run(mut stream: UnixStream, outbound_rx: Receiver<Vec<u8>>) {
    for line in outbound_rx.iter() {
        if let Err(e) = stream.write_all(&line) {
            warn!("stat link write failed: {e}; dropping stats helper");
            return;
        }
    }
    debug!("stat link writer stopping: supervisor is shutting down");
}
