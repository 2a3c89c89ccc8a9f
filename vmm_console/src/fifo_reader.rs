// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! One thread per VM, each blocked reading lines off that VM's console
//! FIFO and forwarding them to the mux loop.
//!
//! The FIFO is opened with `O_NONBLOCK` so `open()` itself never blocks
//! waiting for a writer -- on a FIFO, a non-blocking read-side open
//! succeeds immediately regardless of whether anything has opened the
//! write side yet, while still surfacing real errors (no such file,
//! wrong permissions, not a FIFO) synchronously. This is what lets
//! [`crate::mux`]'s `Add` handler reply with a definite success or
//! failure per spec.md's "open the FIFO ...; if the open fails, reply
//! with an error and do not insert a ring" without deadlocking against
//! the hypervisor, which won't open the write end until *after* it has
//! been spawned -- itself gated on the `Add` reply reaching the engine.
//! Once open, the non-blocking flag is cleared so the reader thread's
//! subsequent reads block normally.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::mpsc::Sender;
use std::thread;

use log::{info, warn};
use nix::fcntl::{self, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use vmm_wire::{Timestamp, VmId};

use crate::mux::MuxEvent;

/// Opens `fifo_path` for reading without blocking on a writer. Returns
/// the open file, ready for blocking line-at-a-time reads.
pub fn open_for_read(fifo_path: &Path) -> io::Result<File> {
    let fd: OwnedFd = fcntl::open(fifo_path, OFlag::O_RDONLY | OFlag::O_NONBLOCK, Mode::empty())
        .map_err(io::Error::from)?;

    // Drop O_NONBLOCK now that the FIFO is open: the reader thread wants
    // ordinary blocking reads from here on.
    let current = fcntl::fcntl(&fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let mut flags = OFlag::from_bits_truncate(current);
    flags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(&fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

    Ok(File::from(fd))
}

/// Spawns the reader thread over an already-opened FIFO handle.
pub fn spawn(id: VmId, file: File, events: Sender<MuxEvent>) {
    thread::Builder::new()
        .name(format!("console-reader-{id}"))
        .spawn(move || run(id, file, events))
        .expect("failed to spawn console reader thread");
}

fn run(id: VmId, file: File, events: Sender<MuxEvent>) {
    info!("console reader for {id} attached");
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break, // writer closed its end of the FIFO
            Ok(_) => {
                let text = line.trim_end_matches('\n').to_string();
                let ts = Timestamp::now();
                if events
                    .send(MuxEvent::Line {
                        id: id.clone(),
                        ts,
                        line: text,
                    })
                    .is_err()
                {
                    break; // mux loop is gone; nothing more to do
                }
            }
            Err(e) => {
                warn!("console reader for {id}: read error: {e}");
                break;
            }
        }
    }

    let _ = events.send(MuxEvent::ReaderDone { id });
}
