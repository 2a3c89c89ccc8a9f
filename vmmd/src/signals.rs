// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Signal handling: `SIGPIPE` is ignored outright (a client or helper
//! dropping its socket should surface as a write error, not kill the
//! process), and `SIGTERM`/`SIGINT` are turned into a blocking read on a
//! `signalfd`, delivered to the engine-owner thread as an ordinary
//! [`SupervisorEvent::Shutdown`] -- the same style of "treat it as a
//! blocking I/O source" this codebase already uses for sockets and FIFOs.

use std::sync::mpsc::Sender;
use std::thread;

use log::warn;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;

use crate::supervisor::SupervisorEvent;

/// Ignores `SIGPIPE` for the whole process.
pub fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn);
    }
}

/// Blocks `SIGTERM`/`SIGINT` on the calling thread (inherited by every
/// thread spawned afterward) and spawns a dedicated thread that turns
/// their eventual delivery into a single [`SupervisorEvent::Shutdown`].
///
/// Must be called before any other thread is spawned, so the signal mask
/// is in place process-wide by the time it matters.
pub fn spawn_shutdown_listener(events_tx: Sender<SupervisorEvent>) {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.thread_block().expect("failed to block shutdown signals");

    thread::Builder::new()
        .name("shutdown-listener".into())
        .spawn(move || run(mask, events_tx))
        .expect("failed to spawn shutdown listener thread");
}

fn run(mask: SigSet, events_tx: Sender<SupervisorEvent>) {
    let mut sfd = match SignalFd::new(&mask) {
        Ok(sfd) => sfd,
        Err(e) => {
            warn!("failed to create signalfd, shutdown signals will be ignored: {e}");
            return;
        }
    };

    loop {
        match sfd.read_signal() {
            Ok(Some(info)) => {
                log::info!("received signal {}, shutting down", info.ssi_signo);
                let _ = events_tx.send(SupervisorEvent::Shutdown);
                break;
            }
            Ok(None) => continue,
            Err(e) => {
                warn!("signalfd read error: {e}");
                break;
            }
        }
    }
}
