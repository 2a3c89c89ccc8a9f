// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-connection handling: one reader thread per accepted socket, parsing
//! frames and forwarding them to the mux loop, plus one writer thread
//! draining that connection's outbound queue back onto the socket. Two
//! threads rather than one because a connection that is `Attach`ed can
//! receive frames (live console data) at any time, not just in response to
//! something it sent.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread;

use log::{debug, warn};
use vmm_wire::{
    fail_frame, read_add_console_payload, read_frame, read_history_cursor, success_frame, Tag,
};

use crate::mux::{self, ConnId, MuxEvent};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub fn handle(stream: UnixStream, events: Sender<MuxEvent>) {
    let conn: ConnId = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

    let writer_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("console connection {conn}: failed to clone socket: {e}");
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mux::subscriber_channel();
    let writer = thread::Builder::new()
        .name(format!("console-conn-{conn}-writer"))
        .spawn(move || run_writer(writer_stream, outbound_rx))
        .expect("failed to spawn console connection writer thread");

    run_reader(conn, stream, events, outbound_tx);
    let _ = writer.join();
}

fn run_writer(mut stream: UnixStream, outbound_rx: std::sync::mpsc::Receiver<Vec<u8>>) {
    for frame in outbound_rx.iter() {
        if let Err(e) = stream.write_all(&frame) {
            debug!("console connection writer stopping: {e}");
            break;
        }
    }
}

fn run_reader(
    conn: ConnId,
    mut stream: UnixStream,
    events: Sender<MuxEvent>,
    outbound_tx: std::sync::mpsc::SyncSender<Vec<u8>>,
) {
    // Tracks which console (if any) this connection is currently the live
    // subscriber for, so a dropped connection can clean up after itself
    // instead of leaving a dead sender in the mux's `subs` table forever.
    let mut attached: Option<vmm_wire::VmId> = None;

    loop {
        let (header, payload) = match read_frame(&mut stream) {
            Ok(v) => v,
            Err(vmm_wire::Error::Io(e)) => {
                debug!("console connection {conn} closed: {e}");
                break;
            }
            Err(e) => {
                // A version mismatch, unknown tag, or truncated frame is a
                // protocol error, not a reason to drop the connection
                // (spec.md §6/§7): reply fail and keep reading. The
                // identifier itself never parsed, so there's no better id
                // to reply on than the root.
                debug!("console connection {conn} sent a malformed frame: {e}");
                let frame = encode_fail(vmm_wire::VmId::root(), &e.to_string());
                if outbound_tx.send(frame).is_err() {
                    break;
                }
                continue;
            }
        };

        let reply_frame = match header.tag {
            Tag::AddConsole => match read_add_console_payload(&payload) {
                Ok(fifo_path) => {
                    let (tx, rx) = std::sync::mpsc::channel();
                    let _ = events.send(MuxEvent::Add {
                        id: header.id.clone(),
                        fifo_path: fifo_path.into(),
                        reply: tx,
                    });
                    reply_to_frame(header.id.clone(), "reading", rx.recv())
                }
                Err(e) => encode_fail(header.id.clone(), &format!("bad AddConsole payload: {e}")),
            },

            Tag::AttachConsole => {
                let (tx, rx) = std::sync::mpsc::channel();
                let _ = events.send(MuxEvent::Attach {
                    id: header.id.clone(),
                    conn,
                    outbound: outbound_tx.clone(),
                    reply: tx,
                });
                let result = rx.recv();
                if matches!(result, Ok(Ok(()))) {
                    attached = Some(header.id.clone());
                }
                reply_to_frame(header.id.clone(), "attached", result)
            }

            Tag::DetachConsole => {
                let (tx, rx) = std::sync::mpsc::channel();
                let _ = events.send(MuxEvent::Detach {
                    id: header.id.clone(),
                    conn,
                    reply: tx,
                });
                let result = rx.recv();
                if matches!(result, Ok(Ok(()))) && attached.as_ref() == Some(&header.id) {
                    attached = None;
                }
                reply_to_frame(header.id.clone(), "removed", result)
            }

            Tag::History => {
                let since = match read_history_cursor(&payload) {
                    Ok(ts) => ts,
                    Err(e) => {
                        let frame =
                            encode_fail(header.id.clone(), &format!("bad History payload: {e}"));
                        if outbound_tx.send(frame).is_err() {
                            break;
                        }
                        continue;
                    }
                };
                let (tx, rx) = std::sync::mpsc::channel();
                let _ = events.send(MuxEvent::History {
                    id: header.id.clone(),
                    since,
                    outbound: outbound_tx.clone(),
                    reply: tx,
                });
                reply_to_frame(header.id.clone(), "success", rx.recv())
            }

            other => {
                warn!("console connection {conn}: unexpected tag {other:?}");
                encode_fail(header.id.clone(), "unexpected command tag")
            }
        };

        if outbound_tx.send(reply_frame).is_err() {
            break;
        }
    }

    // If this connection was still the live subscriber for a console when
    // it dropped, tell the mux loop so it releases its `SyncSender` clone
    // -- otherwise the writer thread below would block on `outbound_rx`
    // forever, since the mux's own clone would keep the channel alive.
    if let Some(id) = attached {
        let (tx, rx) = std::sync::mpsc::channel();
        if events.send(MuxEvent::Detach { id, conn, reply: tx }).is_ok() {
            let _ = rx.recv();
        }
    }
}

/// `message` is the literal success text spec.md §4.2 documents for the
/// operation that produced `result` -- "reading", "attached", "removed",
/// or "success" -- not a generic acknowledgement.
fn reply_to_frame(
    id: vmm_wire::VmId,
    message: &str,
    result: Result<Result<(), String>, std::sync::mpsc::RecvError>,
) -> Vec<u8> {
    match result {
        Ok(Ok(())) => encode_success(id, message),
        Ok(Err(msg)) => encode_fail(id, &msg),
        Err(_) => encode_fail(id, "console mux is unavailable"),
    }
}

fn encode_success(id: vmm_wire::VmId, message: &str) -> Vec<u8> {
    let (header, payload) = success_frame(id, Some(message));
    vmm_wire::encode_frame(&header, &payload)
}

fn encode_fail(id: vmm_wire::VmId, message: &str) -> Vec<u8> {
    let (header, payload) = fail_frame(id, message);
    vmm_wire::encode_frame(&header, &payload)
}
