// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The console multiplexer: captures each VM's serial console output into
//! a bounded ring buffer and serves it to clients over a Unix socket --
//! live tail (`Attach`/`Detach`) and backlog replay (`History`). A single
//! "mux loop" thread owns every ring and subscriber; everything else
//! (FIFO readers, connection handlers) only ever reaches it by message.

pub mod connection;
pub mod error;
pub mod fifo_reader;
pub mod logging;
pub mod mux;

use std::os::unix::net::UnixListener;
use std::thread;

use log::{info, warn};

pub use error::Error;

/// Binds `socket_path`, removing a stale socket file left over from a
/// previous run, and serves connections until the process is killed.
/// Each accepted connection gets its own reader/writer thread pair; the
/// mux loop itself runs on a separate dedicated thread.
pub fn run_server(socket_path: &str) -> Result<(), Error> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!("console multiplexer listening on {socket_path}");

    let events = mux::spawn();

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let events = events.clone();
                thread::spawn(move || connection::handle(stream, events));
            }
            Err(e) => warn!("failed to accept console connection: {e}"),
        }
    }

    Ok(())
}
