// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The supervisor: owns the one thread that ever touches [`EngineState`],
//! and the thread pool of client connections, the reaper-per-VM threads,
//! and the console link that feed it events. The engine-owner thread's
//! only suspension point is `Receiver::recv()` -- every side effect the
//! pure engine describes is carried out by some *other* thread, driven by
//! what the engine-owner thread hands it.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use vmm_engine::{
    handle_command, handle_shutdown, Continuation, ConsoleAck, CreateContinuation, CreateOutcome,
    EngineState, Effect, VmRecord,
};
use vmm_wire::{fail_frame, read_frame, write_frame, Header, VmId};

use crate::config::Config;
use crate::stats_reporter::Counters;
use crate::{console_link, log_link, stat_link, stats_reporter, Error};

/// Everything the engine-owner thread can be told about. Every other
/// thread in the process only ever reaches the engine through one of
/// these.
pub enum SupervisorEvent {
    /// A full command frame from a client connection, plus the channel to
    /// deliver its (eventual) reply on.
    Client {
        header: Header,
        payload: Vec<u8>,
        reply: SyncSender<Vec<u8>>,
    },

    /// The console helper's reply to the oldest still-pending `AddConsole`
    /// request -- see the module doc on ordering.
    ConsoleReply(ConsoleAck),

    /// A reaper thread observed its child exit.
    ChildExited { id: VmId, description: String },

    /// Graceful shutdown was requested (Ctrl-C/SIGTERM).
    Shutdown,
}

/// How long the engine loop waits, once shutting down, for reapers of
/// still-running VMs to report their child's exit before giving up and
/// exiting anyway.
const SHUTDOWN_REAPER_GRACE: Duration = Duration::from_secs(5);

/// Runs the supervisor until a [`SupervisorEvent::Shutdown`] is received
/// or every sender handle to its event channel is dropped.
pub fn run(config: Config) -> Result<(), Error> {
    std::fs::create_dir_all(&config.runtime_dir)?;

    crate::signals::ignore_sigpipe();

    let (events_tx, events_rx) = mpsc::channel();

    crate::signals::spawn_shutdown_listener(events_tx.clone());

    // Console and log are load-bearing helpers (spec.md §4.4): a single
    // blocking connect attempt here, with startup aborting outright if
    // either is unreachable, rather than the indefinite retry loop that
    // would be appropriate for an optional helper.
    let console_stream =
        console_link::connect(&config.console_socket_path).map_err(|e| Error::HelperUnreachable {
            helper: "console",
            path: config.console_socket_path.clone(),
            source: e,
        })?;
    let log_stream = log_link::connect(&config.log_socket_path).map_err(|e| Error::HelperUnreachable {
        helper: "log",
        path: config.log_socket_path.clone(),
        source: e,
    })?;

    let console_tx = console_link::spawn(console_stream, events_tx.clone());
    let log_tx = log_link::spawn(log_stream);
    let stat_tx = stat_link::spawn(&config.stat_socket_path);

    let listener_shutdown = Arc::new(AtomicBool::new(false));
    spawn_client_listener(&config.socket_path, events_tx.clone(), listener_shutdown.clone())?;

    let counters = Counters::new();
    stats_reporter::spawn(counters.clone());

    let state = EngineState::new(config.tap_count, config.total_mem_mb);
    run_engine(
        state,
        events_rx,
        events_tx,
        console_tx,
        stat_tx,
        log_tx,
        config.runtime_dir,
        config.hypervisor_bin,
        counters,
        config.socket_path,
        listener_shutdown,
    );

    Ok(())
}

/// Accepts client connections until told to stop. There is no
/// timeout-based way to interrupt a blocking `accept()` on a Unix socket,
/// so shutdown uses the standard self-pipe trick: the engine loop flips
/// `shutdown` and then connects to its own socket to unblock `incoming()`
/// one last time; that connection is dropped here rather than handled.
fn spawn_client_listener(
    socket_path: &Path,
    events_tx: Sender<SupervisorEvent>,
    shutdown: Arc<AtomicBool>,
) -> io::Result<()> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    info!("vmmd listening on {socket_path:?}");

    thread::Builder::new()
        .name("client-listener".into())
        .spawn(move || {
            for stream in listener.incoming() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let events_tx = events_tx.clone();
                        thread::spawn(move || handle_client(stream, events_tx));
                    }
                    Err(e) => warn!("failed to accept client connection: {e}"),
                }
            }
            debug!("client listener stopping");
        })
        .expect("failed to spawn client listener thread");

    Ok(())
}

fn handle_client(mut stream: UnixStream, events_tx: Sender<SupervisorEvent>) {
    loop {
        let (header, payload) = match read_frame(&mut stream) {
            Ok(v) => v,
            Err(vmm_wire::Error::Io(e)) => {
                debug!("client connection closed: {e}");
                break;
            }
            Err(e) => {
                // Version mismatches and unknown tags are errors, never
                // fatal to the connection (spec.md §6/§7): reply fail and
                // keep reading. The header itself never parsed, so there
                // is no better identifier to reply on than the root.
                debug!("client sent a malformed frame: {e}");
                let (reply_header, reply_payload) = fail_frame(VmId::root(), &e.to_string());
                if write_frame(&mut stream, &reply_header, &reply_payload).is_err() {
                    break;
                }
                continue;
            }
        };

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        if events_tx
            .send(SupervisorEvent::Client {
                header,
                payload,
                reply: reply_tx,
            })
            .is_err()
        {
            break;
        }

        let Ok(reply) = reply_rx.recv() else {
            break;
        };

        if stream.write_all(&reply).is_err() {
            break;
        }
    }
}

/// One entry in the FIFO of `Create`s awaiting the console helper's
/// `AddConsole` reply: the continuation itself, and the original client's
/// reply channel (so the eventual success/fail reply reaches the right
/// connection, not just "whichever event is current").
struct PendingCreate {
    continuation: CreateContinuation,
    client_reply: SyncSender<Vec<u8>>,
}

#[allow(clippy::too_many_arguments)]
fn run_engine(
    mut state: EngineState,
    events: Receiver<SupervisorEvent>,
    events_tx: Sender<SupervisorEvent>,
    console_tx: SyncSender<Vec<u8>>,
    stat_tx: SyncSender<Vec<u8>>,
    log_tx: SyncSender<Vec<u8>>,
    runtime_dir: PathBuf,
    hypervisor_bin: PathBuf,
    counters: Arc<Counters>,
    client_socket_path: PathBuf,
    listener_shutdown: Arc<AtomicBool>,
) {
    let mut pending_creates: VecDeque<PendingCreate> = VecDeque::new();

    while let Ok(event) = events.recv() {
        match event {
            SupervisorEvent::Client {
                header,
                payload,
                reply,
            } => {
                let (next_state, effects, cont) =
                    handle_command(&state, &header, &payload, &runtime_dir);
                state = next_state;
                dispatch_effects(effects, &console_tx, &stat_tx, &log_tx, Some(&reply));

                match cont {
                    Continuation::End => {}
                    Continuation::Wait { post_effects, .. } => {
                        // The reaper for this VM is already running (it
                        // was spawned when the VM was created); nothing
                        // further to start here.
                        dispatch_effects(post_effects, &console_tx, &stat_tx, &log_tx, None);
                    }
                    Continuation::Create(continuation) => {
                        pending_creates.push_back(PendingCreate {
                            continuation,
                            client_reply: reply,
                        });
                    }
                }
            }

            SupervisorEvent::ConsoleReply(ack) => {
                let Some(pending) = pending_creates.pop_front() else {
                    warn!("received a console reply with no pending create to match it to");
                    continue;
                };

                match pending.continuation.resume(state.clone(), ack) {
                    CreateOutcome::Finalized {
                        state: next_state,
                        effects,
                        record,
                    } => {
                        state = next_state;
                        dispatch_effects(
                            effects,
                            &console_tx,
                            &stat_tx,
                            &log_tx,
                            Some(&pending.client_reply),
                        );
                        counters.record_created();
                        state = spawn_vm(state, record, &hypervisor_bin, &events_tx);
                    }
                    CreateOutcome::RolledBack {
                        state: next_state,
                        effects,
                    } => {
                        state = next_state;
                        dispatch_effects(
                            effects,
                            &console_tx,
                            &stat_tx,
                            &log_tx,
                            Some(&pending.client_reply),
                        );
                    }
                }
            }

            SupervisorEvent::ChildExited { id, description } => {
                let was_present = state.vms.contains_key(&id);
                let (next_state, effects) = handle_shutdown(&state, &id, &description);
                state = next_state;
                if was_present {
                    counters.record_destroyed();
                }
                dispatch_effects(effects, &console_tx, &stat_tx, &log_tx, None);
            }

            SupervisorEvent::Shutdown => {
                info!("shutdown requested: no longer accepting new clients");
                listener_shutdown.store(true, Ordering::SeqCst);
                // Unblock the listener's blocking `accept()` one last time
                // so it observes the flag above and stops; the connection
                // itself is never handled.
                let _ = UnixStream::connect(&client_socket_path);

                let deadline = Instant::now() + SHUTDOWN_REAPER_GRACE;
                while !state.vms.is_empty() {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        break;
                    };
                    match events.recv_timeout(remaining) {
                        Ok(SupervisorEvent::ChildExited { id, description }) => {
                            let (next_state, effects) = handle_shutdown(&state, &id, &description);
                            state = next_state;
                            counters.record_destroyed();
                            dispatch_effects(effects, &console_tx, &stat_tx, &log_tx, None);
                        }
                        Ok(_) => {
                            // Clients and console replies arriving during
                            // the shutdown drain are no longer serviceable.
                        }
                        Err(_) => break,
                    }
                }

                if !state.vms.is_empty() {
                    warn!(
                        "{} VM(s) still running after the shutdown grace period, exiting anyway",
                        state.vms.len()
                    );
                }
                info!("shutdown complete, exiting engine loop");
                break;
            }
        }
    }
}

/// Actually spawns the hypervisor process for a just-finalized `Create`,
/// wiring its pid into the engine's table and starting its reaper.
///
/// The client has already been told the VM was created (the table row
/// exists, per the data model's atomicity requirement) by the time this
/// runs; a spawn failure here is reported through logs, not by retracting
/// that reply -- there is no "undo the already-delivered reply" in this
/// protocol.
fn spawn_vm(
    state: EngineState,
    record: VmRecord,
    hypervisor_bin: &Path,
    events_tx: &Sender<SupervisorEvent>,
) -> EngineState {
    match spawn_hypervisor(hypervisor_bin, &record) {
        Ok(mut child) => {
            let pid = child.id();
            let stdout_fd = child.stdout.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1);
            let next = state.set_pid(&record.id, pid, stdout_fd);
            spawn_reaper(child, record.id, events_tx.clone());
            next
        }
        Err(e) => {
            warn!("failed to spawn hypervisor for {}: {e}", record.id);
            let (next, _removed) = state.remove(&record.id);
            next
        }
    }
}

/// Creates the named FIFO at `path` if it doesn't already exist. A FIFO
/// left behind by a prior `Add` of the same identifier (spec.md's
/// documented non-idempotence of `Add`) is reused rather than recreated.
fn ensure_fifo_exists(path: &Path) {
    match nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600)) {
        Ok(()) => {}
        Err(nix::errno::Errno::EEXIST) => {}
        Err(e) => warn!("failed to create console FIFO {path:?}: {e}"),
    }
}

fn spawn_hypervisor(bin: &Path, record: &VmRecord) -> io::Result<Child> {
    let mut cmd = Command::new(bin);
    cmd.arg("--id")
        .arg(record.id.to_string())
        .arg("--mem-mb")
        .arg(record.mem_mb.to_string())
        .arg("--vcpus")
        .arg(record.vcpus.to_string())
        .arg("--console-fifo")
        .arg(&record.console_fifo);
    for tap in &record.taps {
        cmd.arg("--tap").arg(tap);
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());
    cmd.spawn()
}

fn spawn_reaper(mut child: Child, id: VmId, events_tx: Sender<SupervisorEvent>) {
    thread::Builder::new()
        .name(format!("reaper-{id}"))
        .spawn(move || {
            let description = match child.wait() {
                Ok(status) => format!("exited with {status}"),
                Err(e) => format!("wait() failed: {e}"),
            };
            let _ = events_tx.send(SupervisorEvent::ChildExited { id, description });
        })
        .expect("failed to spawn reaper thread");
}

fn dispatch_effects(
    effects: Vec<Effect>,
    console_tx: &SyncSender<Vec<u8>>,
    stat_tx: &SyncSender<Vec<u8>>,
    log_tx: &SyncSender<Vec<u8>>,
    reply_tx: Option<&SyncSender<Vec<u8>>>,
) {
    for effect in effects {
        match effect {
            Effect::Cons(frame) => {
                // The supervisor -- not the engine, which is pure -- is
                // responsible for the FIFO existing before the console
                // helper is told to open it (spec.md §6: "the supervisor
                // (or the hypervisor spawner) is responsible for creating
                // this FIFO before sending Add"). An `AddConsole` request
                // is the only kind of frame ever sent down this channel.
                if let Ok((header, payload)) = vmm_wire::read_frame(&mut frame.as_slice()) {
                    if header.tag == vmm_wire::Tag::AddConsole {
                        if let Ok(path) = vmm_wire::read_add_console_payload(&payload) {
                            ensure_fifo_exists(Path::new(&path));
                        }
                    }
                }

                // Blocking send: this is the bounded fan-out queue's
                // backpressure in action. Disconnection (helper gone for
                // good) is reported back through `ConsoleReply`, not here.
                let _ = console_tx.send(frame);
            }
            Effect::Stat(frame) => {
                if stat_tx.try_send(frame).is_err() {
                    debug!("dropping a stat line, sink is behind or gone");
                }
            }
            Effect::Log(line) => {
                if log_tx.try_send(line).is_err() {
                    debug!("dropping a log line, sink is behind or gone");
                }
            }
            Effect::Data(frame) => match reply_tx {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => warn!("dropping a reply frame with no client waiting on it"),
            },
            Effect::Kill(pid) => {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("failed to signal pid {pid}: {e}");
                }
            }
        }
    }
}

