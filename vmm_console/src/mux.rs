// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The console multiplexer's single-owner event loop. One thread (the
//! "mux loop") owns every [`Ring`] and every live subscriber; it is the
//! only thread that ever touches either, so neither needs a lock. Every
//! other thread (FIFO readers, connection handlers) only ever talks to it
//! through [`MuxEvent`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};

use log::{trace, warn};
use vmm_ring::Ring;
use vmm_wire::{Timestamp, VmId};

use crate::fifo_reader;

/// Bound on a subscriber's live-tail outbound queue. A subscriber that
/// falls this far behind starts losing lines rather than stalling the mux
/// loop -- history replay is how a client catches up on what it missed.
const SUBSCRIBER_QUEUE_DEPTH: usize = 256;

/// Capacity of each per-VM ring, in lines.
pub const RING_CAPACITY: usize = 4096;

/// A monotonically increasing id identifying one accepted connection, used
/// only to tell "the subscriber currently attached to this console" apart
/// from "a new connection that just displaced it."
pub type ConnId = u64;

/// Events delivered to the mux loop. Every other thread in this process
/// only ever reaches the mux's state through one of these.
pub enum MuxEvent {
    /// A line was read off a VM's console FIFO.
    Line { id: VmId, ts: Timestamp, line: String },

    /// A FIFO reader thread exited (the hypervisor closed its end, or the
    /// FIFO itself vanished). The ring is kept; only the reader thread
    /// goes away.
    ReaderDone { id: VmId },

    /// Start tailing `fifo_path` for `id`. Replies `Ok(())` once the
    /// reader thread has been spawned (not once the FIFO's write end has
    /// actually been opened by a hypervisor -- that may never happen if
    /// the VM dies immediately, and this request shouldn't block on it).
    Add {
        id: VmId,
        fifo_path: PathBuf,
        reply: Sender<Result<(), String>>,
    },

    /// Subscribe `outbound` to `id`'s live tail, displacing whatever
    /// subscriber was previously attached.
    Attach {
        id: VmId,
        conn: ConnId,
        outbound: SyncSender<Vec<u8>>,
        reply: Sender<Result<(), String>>,
    },

    /// Unsubscribe `conn` from `id`, if it is still the attached
    /// subscriber. Detaching a connection that has already been displaced
    /// is not an error.
    Detach {
        id: VmId,
        conn: ConnId,
        reply: Sender<Result<(), String>>,
    },

    /// Replay every line recorded for `id` strictly after `since` onto
    /// `outbound`, in order.
    History {
        id: VmId,
        since: Timestamp,
        outbound: SyncSender<Vec<u8>>,
        reply: Sender<Result<(), String>>,
    },
}

struct Subscriber {
    conn: ConnId,
    outbound: SyncSender<Vec<u8>>,
}

/// Runs the mux loop until `events`'s sender side is fully dropped (i.e.
/// the process is shutting down). Blocks on `Receiver::recv()` between
/// events; this is the loop's only suspension point.
pub fn run(events: Receiver<MuxEvent>, self_tx: Sender<MuxEvent>) {
    let mut rings: HashMap<VmId, Ring> = HashMap::new();
    let mut subs: HashMap<VmId, Subscriber> = HashMap::new();

    while let Ok(event) = events.recv() {
        match event {
            MuxEvent::Line { id, ts, line } => {
                let ring = rings.entry(id.clone()).or_insert_with(|| Ring::new(RING_CAPACITY));
                ring.write(ts, line.clone());

                if let Some(sub) = subs.get(&id) {
                    let (header, payload) = vmm_wire::data_frame(id.clone(), ts, &line);
                    let frame = vmm_wire::encode_frame(&header, &payload);
                    match sub.outbound.try_send(frame) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            trace!("dropping console line for {id}: subscriber is behind");
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            subs.remove(&id);
                        }
                    }
                }
            }

            MuxEvent::ReaderDone { id } => {
                trace!("console reader for {id} exited");
            }

            MuxEvent::Add {
                id,
                fifo_path,
                reply,
            } => {
                // The open itself is synchronous and non-blocking (see
                // `fifo_reader::open_for_read`): it fails immediately for
                // a missing/bad FIFO and succeeds immediately otherwise,
                // without waiting for a writer. That's what lets this
                // handler give a definite success/failure reply per
                // spec.md §4.2, rather than spawning blind and always
                // acking.
                match fifo_reader::open_for_read(&fifo_path) {
                    Ok(file) => {
                        // Idempotence is not guaranteed (spec.md §4.2): a
                        // second Add for an id already present overwrites
                        // its ring silently rather than being rejected or
                        // merged. The previous reader thread (if any) is
                        // left running until it hits EOF or an I/O error
                        // on its own FIFO handle; it'll just be writing
                        // into an orphaned ring nobody reads through
                        // anymore.
                        rings.insert(id.clone(), Ring::new(RING_CAPACITY));
                        fifo_reader::spawn(id, file, self_tx.clone());
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        warn!("failed to open console FIFO {fifo_path:?} for {id}: {e}");
                        let _ = reply.send(Err(format!("failed to open console FIFO: {e}")));
                    }
                }
            }

            MuxEvent::Attach {
                id,
                conn,
                outbound,
                reply,
            } => {
                subs.insert(id, Subscriber { conn, outbound });
                let _ = reply.send(Ok(()));
            }

            MuxEvent::Detach { id, conn, reply } => {
                if let Some(sub) = subs.get(&id) {
                    if sub.conn == conn {
                        subs.remove(&id);
                    }
                }
                let _ = reply.send(Ok(()));
            }

            MuxEvent::History {
                id,
                since,
                outbound,
                reply,
            } => {
                let Some(ring) = rings.get(&id) else {
                    let _ = reply.send(Err("no console has been recorded for that VM".into()));
                    continue;
                };

                for (ts, line) in ring.read_history(since) {
                    let (header, payload) = vmm_wire::data_frame(id.clone(), ts, &line);
                    let frame = vmm_wire::encode_frame(&header, &payload);
                    if outbound.try_send(frame).is_err() {
                        warn!("history replay for {id} dropped: subscriber queue is gone or full");
                        break;
                    }
                }
                let _ = reply.send(Ok(()));
            }
        }
    }
}

/// Builds the mux's channel pair and spawns its loop on a dedicated
/// thread, returning the sender every connection handler and FIFO reader
/// uses to reach it.
pub fn spawn() -> Sender<MuxEvent> {
    let (tx, rx) = mpsc::channel();
    let loop_tx = tx.clone();
    std::thread::Builder::new()
        .name("console-mux".into())
        .spawn(move || run(rx, loop_tx))
        .expect("failed to spawn console mux thread");
    tx
}

/// Bound applied to a subscriber's own outbound channel. Exposed so
/// connection handlers (which create the channel) and the mux loop (which
/// only ever sees the `SyncSender` half) agree on the same constant.
pub fn subscriber_channel() -> (SyncSender<Vec<u8>>, Receiver<Vec<u8>>) {
    mpsc::sync_channel(SUBSCRIBER_QUEUE_DEPTH)
}
