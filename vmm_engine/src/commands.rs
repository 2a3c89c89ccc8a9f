// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The engine's pure command dispatch: one function per external request,
//! each a total function from `(state, request)` to `(state', effects,
//! continuation)`. None of these touch the filesystem, a socket, or a pid
//! directly -- that's the supervisor's job, driven by the effects and
//! continuation returned here.

use std::path::PathBuf;

use log::warn;
use vmm_wire::{
    add_console_frame, decode_identifier, encode_identifier, fail_frame, read_u32, read_u64,
    success_frame, write_u32, write_u64, DecodeError, Header, Tag, VmId,
};

use crate::continuation::{Continuation, ConsoleAck, CreateContinuation, CreateOutcome, WaitTask};
use crate::effect::{log_line, Effect};
use crate::error::Error;
use crate::state::{EngineState, VmRecord};

/// The decoded body of a `Create` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub mem_mb: u64,
    pub vcpus: u32,
    pub tap_count: u32,
}

impl CreateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_u64(&mut buf, self.mem_mb);
        write_u32(&mut buf, self.vcpus);
        write_u32(&mut buf, self.tap_count);
        buf
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, DecodeError> {
        let mem_mb = read_u64(&mut payload)?;
        let vcpus = read_u32(&mut payload)?;
        let tap_count = read_u32(&mut payload)?;
        Ok(Self {
            mem_mb,
            vcpus,
            tap_count,
        })
    }
}

/// Builds a `Create` request frame, for callers (the CLI, tests) that want
/// to send one without reaching into `vmm_wire` directly.
pub fn create_request_frame(id: VmId, req: &CreateRequest) -> (Header, Vec<u8>) {
    let payload = req.encode();
    let header = Header::new(Tag::Create, id, payload.len() as u32);
    (header, payload)
}

/// One row of an `Info` reply: enough of a [`VmRecord`] to answer "what's
/// running," without exposing the engine's internal bookkeeping types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoEntry {
    pub id: VmId,
    pub pid: Option<u32>,
    pub mem_mb: u64,
    pub vcpus: u32,
    pub taps: Vec<String>,
}

impl From<&VmRecord> for InfoEntry {
    fn from(record: &VmRecord) -> Self {
        Self {
            id: record.id.clone(),
            pid: record.pid,
            mem_mb: record.mem_mb,
            vcpus: record.vcpus,
            taps: record.taps.clone(),
        }
    }
}

/// Encodes a list of [`InfoEntry`] rows into an `Info` reply payload.
pub fn encode_info_reply(entries: &[InfoEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_u32(&mut buf, entries.len() as u32);
    for entry in entries {
        encode_identifier(&mut buf, &entry.id);
        match entry.pid {
            Some(pid) => {
                buf.push(1);
                write_u32(&mut buf, pid);
            }
            None => {
                buf.push(0);
                write_u32(&mut buf, 0);
            }
        }
        write_u64(&mut buf, entry.mem_mb);
        write_u32(&mut buf, entry.vcpus);
        write_u32(&mut buf, entry.taps.len() as u32);
        for tap in &entry.taps {
            let bytes = tap.as_bytes();
            write_u32(&mut buf, bytes.len() as u32);
            buf.extend_from_slice(bytes);
        }
    }
    buf
}

/// Decodes an `Info` reply payload back into its rows. Used by clients
/// (and tests) reading the reply, never by the engine itself.
pub fn decode_info_reply(mut payload: &[u8]) -> Result<Vec<InfoEntry>, DecodeError> {
    let count = read_u32(&mut payload)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = decode_identifier(&mut payload)?;
        let has_pid = *payload.first().ok_or(DecodeError::Short)?;
        payload = &payload[1..];
        let pid_raw = read_u32(&mut payload)?;
        let pid = if has_pid != 0 { Some(pid_raw) } else { None };
        let mem_mb = read_u64(&mut payload)?;
        let vcpus = read_u32(&mut payload)?;
        let tap_count = read_u32(&mut payload)?;
        let mut taps = Vec::with_capacity(tap_count as usize);
        for _ in 0..tap_count {
            let len = read_u32(&mut payload)? as usize;
            if payload.len() < len {
                return Err(DecodeError::Short);
            }
            let (head, rest) = payload.split_at(len);
            payload = rest;
            taps.push(String::from_utf8(head.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?);
        }
        entries.push(InfoEntry {
            id,
            pid,
            mem_mb,
            vcpus,
            taps,
        });
    }
    Ok(entries)
}

/// The runtime directory FIFO paths are rooted under. Passed in by the
/// supervisor rather than read from `vmmd::config` here, so this crate
/// stays free of a dependency on the binary crate that embeds it.
pub fn console_fifo_path(runtime_dir: &std::path::Path, id: &VmId) -> PathBuf {
    runtime_dir.join(id.fifo_file_name())
}

/// Dispatches one decoded command frame, returning the new state, the
/// effects the supervisor must carry out (in order), and what to do next.
///
/// Frames tagged with a console-multiplexer tag (`AddConsole`,
/// `AttachConsole`, `DetachConsole`, `History`, `Data`, `Success`, `Fail`)
/// never originate from a client of the engine; receiving one here is
/// treated as a protocol error, not a panic.
pub fn handle_command(
    state: &EngineState,
    header: &Header,
    payload: &[u8],
    runtime_dir: &std::path::Path,
) -> (EngineState, Vec<Effect>, Continuation) {
    match header.tag {
        Tag::Create => handle_create(state, header, payload, runtime_dir),
        Tag::Destroy => handle_destroy(state, header),
        Tag::Info => handle_info(state, header),
        other => {
            warn!("rejecting unexpected tag {other:?} as an engine command");
            let message = Error::Protocol("unexpected command tag".into()).to_string();
            let (_, reply) = fail_frame(header.id.clone(), &message);
            (
                state.clone(),
                vec![Effect::Data(reply)],
                Continuation::End,
            )
        }
    }
}

fn handle_create(
    state: &EngineState,
    header: &Header,
    payload: &[u8],
    runtime_dir: &std::path::Path,
) -> (EngineState, Vec<Effect>, Continuation) {
    let id = header.id.clone();

    let req = match CreateRequest::decode(payload) {
        Ok(req) => req,
        Err(e) => return reject_create(state, id, &Error::from(e).to_string()),
    };

    if state.vms.contains_key(&id) {
        return reject_create(state, id, "a VM with that identifier already exists");
    }

    let Some((reserved, taps)) = state.reserve(req.mem_mb, req.tap_count as usize) else {
        let message = Error::Resource("insufficient memory or tap capacity".into()).to_string();
        return reject_create(state, id, &message);
    };

    let console_fifo = console_fifo_path(runtime_dir, &id);
    let (add_header, add_payload) =
        add_console_frame(id.clone(), &console_fifo.to_string_lossy());
    let cons_effect = Effect::Cons(vmm_wire::encode_frame(&add_header, &add_payload));

    let continuation_id = id.clone();
    let continuation_req = req.clone();
    let continuation_fifo = console_fifo.clone();
    let continuation = CreateContinuation::new(move |reserved_state, ack| {
        finish_create(
            reserved_state,
            continuation_id,
            continuation_req,
            continuation_fifo,
            taps,
            ack,
        )
    });

    (
        reserved,
        vec![cons_effect],
        Continuation::Create(continuation),
    )
}

fn reject_create(
    state: &EngineState,
    id: VmId,
    message: &str,
) -> (EngineState, Vec<Effect>, Continuation) {
    let (_, reply) = fail_frame(id, message);
    (state.clone(), vec![Effect::Data(reply)], Continuation::End)
}

/// Phase 2 of `Create`: invoked once the console helper has answered the
/// `AddConsole` request issued in phase 1.
fn finish_create(
    reserved_state: EngineState,
    id: VmId,
    req: CreateRequest,
    console_fifo: PathBuf,
    taps: Vec<String>,
    ack: ConsoleAck,
) -> CreateOutcome {
    match ack {
        ConsoleAck::Fail(msg) => {
            let (_, reply) = fail_frame(id.clone(), &format!("console setup failed: {msg}"));
            CreateOutcome::RolledBack {
                state: reserved_state.release_reservation(req.mem_mb, taps),
                effects: vec![Effect::Data(reply)],
            }
        }
        ConsoleAck::Success => {
            let next = reserved_state.finalize_reserved(
                id.clone(),
                req.mem_mb,
                req.vcpus,
                taps,
                console_fifo,
            );
            let record = next.vms.get(&id).cloned().expect("just inserted");

            let (_, reply) = success_frame(id.clone(), Some("created"));
            let effects = vec![
                Effect::Data(reply),
                log_line(format!("created {id} ({} MiB, {} vcpus)", req.mem_mb, req.vcpus)),
                Effect::Stat(stat_line(&id, "created")),
            ];

            CreateOutcome::Finalized {
                state: next,
                effects,
                record,
            }
        }
    }
}

fn handle_destroy(state: &EngineState, header: &Header) -> (EngineState, Vec<Effect>, Continuation) {
    let id = header.id.clone();

    let Some(record) = state.vms.get(&id) else {
        let (_, reply) = fail_frame(id, &Error::NotFound.to_string());
        return (state.clone(), vec![Effect::Data(reply)], Continuation::End);
    };

    let Some(pid) = record.pid else {
        let (_, reply) = fail_frame(id, "VM is still starting, try again shortly");
        return (state.clone(), vec![Effect::Data(reply)], Continuation::End);
    };

    let (_, reply) = success_frame(id.clone(), Some("destroy requested"));
    let effects = vec![
        Effect::Kill(pid),
        Effect::Data(reply),
        log_line(format!("destroy requested for {id} (pid {pid})")),
    ];

    // Table removal happens in `handle_shutdown`, once the reaper actually
    // observes the child exit -- the record must stay reaped until then,
    // per the data model's "every record has a live reaper" invariant.
    (
        state.clone(),
        effects,
        Continuation::Wait {
            task: WaitTask::ChildExit { id },
            post_effects: Vec::new(),
        },
    )
}

fn handle_info(state: &EngineState, header: &Header) -> (EngineState, Vec<Effect>, Continuation) {
    let query = &header.id;
    let mut entries: Vec<InfoEntry> = if query.is_empty() {
        state.vms.values().map(InfoEntry::from).collect()
    } else {
        state
            .vms
            .values()
            .filter(|r| r.id.has_prefix(query))
            .map(InfoEntry::from)
            .collect()
    };
    entries.sort_by(|a, b| a.id.cmp(&b.id));

    let payload = encode_info_reply(&entries);
    let reply_header = Header::new(Tag::Success, header.id.clone(), payload.len() as u32);
    let effect = Effect::Data(vmm_wire::encode_frame(&reply_header, &payload));

    (state.clone(), vec![effect], Continuation::End)
}

/// Called by the reaper once a child process has actually exited. Removes
/// the VM's table row and returns its taps/memory to the free pools; the
/// console ring for `id` is deliberately left alone (spec's console rings
/// outlive the VM they were recording).
pub fn handle_shutdown(state: &EngineState, id: &VmId, exit_description: &str) -> (EngineState, Vec<Effect>) {
    let (next, removed) = state.remove(id);
    let Some(_record) = removed else {
        // Already reaped (or never existed) -- nothing to do. Can happen
        // if `handle_shutdown` is ever invoked twice for the same id.
        return (next, Vec::new());
    };

    let effects = vec![
        log_line(format!("{id} exited: {exit_description}")),
        Effect::Stat(stat_line(id, "destroyed")),
    ];
    (next, effects)
}

fn stat_line(id: &VmId, event: &str) -> Vec<u8> {
    let (header, payload) = vmm_wire::stat_frame(id.clone(), event);
    vmm_wire::encode_frame(&header, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn runtime_dir() -> &'static Path {
        Path::new("/run/vmmd")
    }

    fn req() -> CreateRequest {
        CreateRequest {
            mem_mb: 256,
            vcpus: 1,
            tap_count: 1,
        }
    }

    fn create_header(id: &str) -> Header {
        let vm_id: VmId = id.parse().unwrap();
        Header::new(Tag::Create, vm_id, 0)
    }

    #[test]
    fn create_reserves_and_waits_for_console_ack() {
        let state = EngineState::new(4, 1024);
        let header = create_header("vm.a");
        let payload = req().encode();

        let (reserved, effects, cont) = handle_command(&state, &header, &payload, runtime_dir());
        assert_eq!(reserved.mem_budget.used_mb, 256);
        // tap_count: 1 reserved immediately out of a pool of 4.
        assert_eq!(reserved.taps.available(), 3);
        assert!(matches!(effects[0], Effect::Cons(_)));
        let create_cont = match cont {
            Continuation::Create(c) => c,
            _ => panic!("expected a Create continuation"),
        };

        let outcome = create_cont.resume(reserved, ConsoleAck::Success);
        match outcome {
            CreateOutcome::Finalized { state, record, .. } => {
                assert_eq!(record.id, "vm.a".parse::<VmId>().unwrap());
                assert!(state.vms.contains_key(&record.id));
                assert!(record.pid.is_none());
                assert_eq!(record.taps.len(), 1);
            }
            CreateOutcome::RolledBack { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn create_rolls_back_on_console_failure() {
        let state = EngineState::new(4, 1024);
        let header = create_header("vm.a");
        let payload = req().encode();

        let (reserved, _effects, cont) = handle_command(&state, &header, &payload, runtime_dir());
        assert_eq!(reserved.taps.available(), 3);
        let create_cont = match cont {
            Continuation::Create(c) => c,
            _ => panic!("expected a Create continuation"),
        };

        let outcome = create_cont.resume(reserved, ConsoleAck::Fail("fifo busy".into()));
        match outcome {
            CreateOutcome::RolledBack { state, .. } => {
                assert!(state.vms.is_empty());
                // The reservation made in phase 1 must be fully undone --
                // a create that fails before phase 2 leaves no residual
                // state (spec.md §7/§8), including the tap names.
                assert_eq!(state.mem_budget.used_mb, 0);
                assert_eq!(state.taps.available(), 4);
            }
            CreateOutcome::Finalized { .. } => panic!("expected rollback"),
        }
    }

    #[test]
    fn overlapping_creates_cannot_both_reserve_the_same_tap() {
        let state = EngineState::new(1, 1024);
        let header_a = create_header("vm.a");
        let header_b = create_header("vm.b");
        let payload = req().encode();

        let (after_a, _effects, cont_a) = handle_command(&state, &header_a, &payload, runtime_dir());
        assert_eq!(after_a.taps.available(), 0);
        assert!(matches!(cont_a, Continuation::Create(_)));

        // A second Create racing against the first, before its console ack
        // has come back, must see the pool as already exhausted rather
        // than being allowed to reserve the same tap name.
        let (after_b, effects_b, cont_b) =
            handle_command(&after_a, &header_b, &payload, runtime_dir());
        assert_eq!(after_b.taps.available(), 0);
        assert!(matches!(cont_b, Continuation::End));
        assert!(matches!(effects_b[0], Effect::Data(_)));
    }

    #[test]
    fn create_over_budget_is_rejected_without_reservation() {
        let state = EngineState::new(4, 128);
        let header = create_header("vm.a");
        let payload = req().encode(); // asks for 256 MiB against a 128 MiB budget

        let (next, effects, cont) = handle_command(&state, &header, &payload, runtime_dir());
        assert_eq!(next.mem_budget.used_mb, 0);
        assert!(matches!(cont, Continuation::End));
        assert!(matches!(effects[0], Effect::Data(_)));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let state = EngineState::new(4, 1024)
            .finalize_create_n("vm.a".parse().unwrap(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into());
        let header = create_header("vm.a");
        let payload = req().encode();

        let (next, _effects, cont) = handle_command(&state, &header, &payload, runtime_dir());
        assert_eq!(next.vms.len(), 1);
        assert!(matches!(cont, Continuation::End));
    }

    #[test]
    fn destroy_unknown_vm_fails_without_changing_state() {
        let state = EngineState::new(4, 1024);
        let header = Header::new(Tag::Destroy, "vm.a".parse().unwrap(), 0);

        let (next, effects, cont) = handle_command(&state, &header, &[], runtime_dir());
        assert!(next.vms.is_empty());
        assert!(matches!(cont, Continuation::End));
        assert!(matches!(effects[0], Effect::Data(_)));
    }

    #[test]
    fn destroy_running_vm_emits_kill_and_waits() {
        let id: VmId = "vm.a".parse().unwrap();
        let state = EngineState::new(4, 1024)
            .finalize_create_n(id.clone(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into())
            .set_pid(&id, 4242, 9);
        let header = Header::new(Tag::Destroy, id.clone(), 0);

        let (next, effects, cont) = handle_command(&state, &header, &[], runtime_dir());
        // The row is still present -- only the reaper removes it.
        assert!(next.vms.contains_key(&id));
        assert!(matches!(effects[0], Effect::Kill(4242)));
        assert!(matches!(
            cont,
            Continuation::Wait {
                task: WaitTask::ChildExit { .. },
                ..
            }
        ));
    }

    #[test]
    fn destroy_starting_vm_without_pid_is_rejected() {
        let id: VmId = "vm.a".parse().unwrap();
        let state = EngineState::new(4, 1024)
            .finalize_create_n(id.clone(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into());
        let header = Header::new(Tag::Destroy, id.clone(), 0);

        let (next, effects, cont) = handle_command(&state, &header, &[], runtime_dir());
        assert!(next.vms.contains_key(&id));
        assert!(matches!(effects[0], Effect::Data(_)));
        assert!(matches!(cont, Continuation::End));
    }

    #[test]
    fn shutdown_removes_the_row_and_frees_resources() {
        let id: VmId = "vm.a".parse().unwrap();
        let state = EngineState::new(4, 1024)
            .finalize_create_n(id.clone(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into())
            .set_pid(&id, 4242, 9);

        let (next, effects) = handle_shutdown(&state, &id, "exited with status 0");
        assert!(!next.vms.contains_key(&id));
        assert_eq!(next.taps.available(), 4);
        assert_eq!(next.mem_budget.used_mb, 0);
        assert_eq!(effects.len(), 2);
    }

    #[test]
    fn double_shutdown_is_a_no_op_the_second_time() {
        let id: VmId = "vm.a".parse().unwrap();
        let state = EngineState::new(4, 1024)
            .finalize_create_n(id.clone(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into())
            .set_pid(&id, 4242, 9);

        let (after_first, _) = handle_shutdown(&state, &id, "exited");
        let (after_second, effects) = handle_shutdown(&after_first, &id, "exited");
        assert_eq!(after_first.vms.len(), after_second.vms.len());
        assert!(effects.is_empty());
    }

    #[test]
    fn info_with_root_identifier_lists_everything() {
        let state = EngineState::new(4, 1024)
            .finalize_create_n("vm.a".parse().unwrap(), 64, 1, 1, "/run/vmmd/vm.a.fifo".into())
            .finalize_create_n("vm.b".parse().unwrap(), 64, 1, 1, "/run/vmmd/vm.b.fifo".into());
        let header = Header::new(Tag::Info, VmId::root(), 0);

        let (_next, effects, cont) = handle_command(&state, &header, &[], runtime_dir());
        assert!(matches!(cont, Continuation::End));
        let Effect::Data(reply) = &effects[0] else {
            panic!("expected a Data effect");
        };
        let (_header, payload) = vmm_wire::read_frame(&mut reply.as_slice()).unwrap();
        let entries = decode_info_reply(&payload).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn info_with_prefix_filters_by_id() {
        let state = EngineState::new(4, 1024)
            .finalize_create_n("prod.web".parse().unwrap(), 64, 1, 1, "/run/vmmd/a.fifo".into())
            .finalize_create_n("prod.db".parse().unwrap(), 64, 1, 1, "/run/vmmd/b.fifo".into())
            .finalize_create_n("staging.web".parse().unwrap(), 64, 1, 1, "/run/vmmd/c.fifo".into());
        let header = Header::new(Tag::Info, "prod".parse().unwrap(), 0);

        let (_next, effects, _cont) = handle_command(&state, &header, &[], runtime_dir());
        let Effect::Data(reply) = &effects[0] else {
            panic!("expected a Data effect");
        };
        let (_header, payload) = vmm_wire::read_frame(&mut reply.as_slice()).unwrap();
        let entries = decode_info_reply(&payload).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn unexpected_tag_is_rejected() {
        let state = EngineState::new(4, 1024);
        let header = Header::new(Tag::AttachConsole, "vm.a".parse().unwrap(), 0);

        let (next, effects, cont) = handle_command(&state, &header, &[], runtime_dir());
        assert!(next.vms.is_empty());
        assert!(matches!(effects[0], Effect::Data(_)));
        assert!(matches!(cont, Continuation::End));
    }
}
