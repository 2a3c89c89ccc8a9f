// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The connection to the console multiplexer. Required at startup --
//! `connect` is a single blocking attempt, and the caller aborts the
//! daemon with a diagnostic if it fails, per spec.md's "connect to
//! console helper (required -- abort if unavailable)."
//!
//! Once connected, one bounded channel carries `Cons` effects out to
//! `vmm_console`; replies come back as [`SupervisorEvent::ConsoleReply`]
//! in the same order the requests were sent, which is how the
//! engine-owner thread correlates them with pending `Create`s (spec.md's
//! two-phase create protocol). A write or read error on this link is
//! fatal to the daemon -- the console helper is load-bearing, so there is
//! nothing safe to keep running once it's gone.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread;

use log::{debug, error, info};
use vmm_engine::ConsoleAck;
use vmm_wire::{read_frame, Tag};

use crate::supervisor::SupervisorEvent;

const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// A single blocking connection attempt -- no retry. Called once at
/// startup; the caller is responsible for treating failure as fatal.
pub fn connect(socket_path: &Path) -> std::io::Result<UnixStream> {
    UnixStream::connect(socket_path)
}

/// Spawns the console link's reader and writer threads over an already
/// established connection, returning the sender used to deliver `Cons`
/// effects (pre-framed bytes) to it.
pub fn spawn(stream: UnixStream, supervisor_tx: Sender<SupervisorEvent>) -> SyncSender<Vec<u8>> {
    let (tx, rx) = mpsc::sync_channel(OUTBOUND_QUEUE_DEPTH);

    let reader_stream = stream
        .try_clone()
        .unwrap_or_else(|e| fatal(&format!("failed to clone console link socket: {e}")));

    thread::Builder::new()
        .name("console-link-reader".into())
        .spawn(move || run_reader(reader_stream, supervisor_tx))
        .expect("failed to spawn console link reader thread");

    thread::Builder::new()
        .name("console-link-writer".into())
        .spawn(move || run_writer(stream, rx))
        .expect("failed to spawn console link writer thread");

    tx
}

fn run_writer(mut stream: UnixStream, outbound_rx: Receiver<Vec<u8>>) {
    for frame in outbound_rx.iter() {
        if let Err(e) = stream.write_all(&frame) {
            fatal(&format!("console link write failed: {e}"));
        }
    }
    debug!("console link writer stopping: supervisor is shutting down");
}

fn run_reader(mut stream: UnixStream, supervisor_tx: Sender<SupervisorEvent>) {
    loop {
        let (header, payload) = match read_frame(&mut stream) {
            Ok(v) => v,
            Err(e) => fatal(&format!("console link reader failed: {e}")),
        };

        let ack = match header.tag {
            Tag::Success => ConsoleAck::Success,
            Tag::Fail => {
                let message = vmm_wire::read_reply_message(&payload).unwrap_or_default();
                ConsoleAck::Fail(message)
            }
            other => {
                debug!("console link reader: ignoring unexpected tag {other:?}");
                continue;
            }
        };

        if supervisor_tx
            .send(SupervisorEvent::ConsoleReply(ack))
            .is_err()
        {
            info!("console link reader stopping: supervisor is shutting down");
            return;
        }
    }
}

/// Logs a fatal diagnostic and aborts the process. The console link is a
/// load-bearing helper (spec.md §7): an I/O error on it is never
/// recoverable from the supervisor's point of view.
fn fatal(message: &str) -> ! {
    error!("{message}; console helper is load-bearing, exiting");
    std::process::exit(1);
}
