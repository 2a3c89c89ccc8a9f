// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connection to the log helper daemon. Required at startup, exactly
//! like [`crate::console_link`]: `connect` is a single blocking attempt,
//! and the caller aborts the daemon if it fails. Once connected, this is
//! a simplex link -- log lines flow out, nothing is expected back -- so
//! there is only a writer thread, no reader. A write error is fatal to
//! the daemon (spec.md §7: "I/O errors on the console or log helper
//! channels are fatal to the daemon").

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use log::{debug, error};

const OUTBOUND_QUEUE_DEPTH: usize = 512;

/// A single blocking connection attempt -- no retry.
pub fn connect(socket_path: &Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(socket_path)
}

/// Spawns the log link's writer thread over an already established
/// connection, returning the sender used to deliver `Log` effects to it.
pub fn spawn(stream: UnixStream) -> SyncSender<Vec<u8>> {
    let (tx, rx) = mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);
    thread::Builder::new()
        .name("log-link".into())
        .spawn(move || run(stream, rx))
        .expect("failed to spawn log link thread");
    tx
}

fn run(mut stream: UnixStream, outbound_rx: Receiver<Vec<u8>>) {
    for line in outbound_rx.iter() {
        if let Err(e) = stream.write_all(&line) {
            fatal(&format!("log link write failed: {e}"));
        }
    }
    debug!("log link writer stopping: supervisor is shutting down");
}

fn fatal(message: &str) -> ! {
    error!("{message}; log helper is load-bearing, exiting");
    std::process::exit(1);
}
