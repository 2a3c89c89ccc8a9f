// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::Write as _;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use vmm_engine::{create_request_frame, CreateRequest};
use vmm_wire::{history_request_frame, read_data_payload, read_frame, read_reply_message, Header, Tag, Timestamp, VmId};
use vmmd::Config;

fn wait_for_socket(path: &std::path::Path) -> UnixStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(stream) = UnixStream::connect(path) {
            return stream;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for socket at {path:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Minimal log-helper stand-in: accepts connections and discards every
/// frame sent to it. The real log helper is out of scope for this crate
/// (spec.md treats it as an opaque subordinate daemon); this just needs
/// to exist so vmmd's required log link can connect.
fn spawn_log_stub(socket_path: PathBuf) {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut stream = stream;
                while read_frame(&mut stream).is_ok() {}
            });
        }
    });
}

fn test_config(runtime_dir: PathBuf) -> Config {
    Config {
        socket_path: runtime_dir.join("vmmd.sock"),
        console_socket_path: runtime_dir.join("cons.sock"),
        stat_socket_path: runtime_dir.join("stat.sock"),
        log_socket_path: runtime_dir.join("log.sock"),
        hypervisor_bin: PathBuf::from("/bin/true"),
        tap_count: 4,
        total_mem_mb: 1024,
        runtime_dir,
    }
}

fn send(stream: &mut UnixStream, header: Header, payload: &[u8]) {
    vmm_wire::write_frame(stream, &header, payload).unwrap();
}

#[test]
fn create_then_console_replay_then_destroy_then_double_destroy() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().to_path_buf();
    std::fs::create_dir_all(&runtime_dir).unwrap();
    let config = test_config(runtime_dir.clone());

    let cons_socket = config.console_socket_path.clone();
    let cons_socket_str = cons_socket.to_string_lossy().to_string();
    thread::spawn(move || vmm_console::run_server(&cons_socket_str).unwrap());
    spawn_log_stub(config.log_socket_path.clone());
    // Stats is optional and deliberately left unconnected here, exercising
    // "missing stats degrades silently."

    let vmmd_socket = config.socket_path.clone();
    thread::spawn(move || vmmd::run(config).unwrap());
    let mut client = wait_for_socket(&vmmd_socket);

    let id: VmId = "vm.a".parse().unwrap();
    let req = CreateRequest {
        mem_mb: 64,
        vcpus: 1,
        tap_count: 1,
    };
    let (header, payload) = create_request_frame(id.clone(), &req);
    send(&mut client, header, &payload);

    let (reply_header, reply_payload) = read_frame(&mut client).unwrap();
    assert_eq!(reply_header.tag, Tag::Success);
    assert_eq!(read_reply_message(&reply_payload).unwrap(), "created");

    // The supervisor must have created the FIFO and the console helper
    // must already be tailing it by the time the create reply landed --
    // otherwise this write would block forever waiting for a reader.
    let fifo_path = runtime_dir.join(format!("{id}.fifo"));
    let mut fifo_writer = std::fs::OpenOptions::new().write(true).open(&fifo_path).unwrap();
    writeln!(fifo_writer, "hello").unwrap();
    writeln!(fifo_writer, "world").unwrap();
    drop(fifo_writer);

    let mut cons_client = wait_for_socket(&cons_socket);
    let (history_header, history_payload) = history_request_frame(id.clone(), Timestamp::ZERO);
    send(&mut cons_client, history_header, &history_payload);

    let mut lines = Vec::new();
    loop {
        let (header, payload) = read_frame(&mut cons_client).unwrap();
        match header.tag {
            Tag::Data => {
                let (_ts, line) = read_data_payload(&payload).unwrap();
                lines.push(line);
            }
            Tag::Success => break,
            other => panic!("unexpected tag while replaying history: {other:?}"),
        }
    }
    assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);

    let destroy_header = Header::new(Tag::Destroy, id.clone(), 0);
    send(&mut client, destroy_header, &[]);
    let (reply_header, _payload) = read_frame(&mut client).unwrap();
    assert_eq!(reply_header.tag, Tag::Success);

    // Give the reaper a moment to observe the (already-exited, since the
    // stub hypervisor is `/bin/true`) child and remove the table row.
    thread::sleep(Duration::from_millis(200));

    let destroy_header = Header::new(Tag::Destroy, id, 0);
    send(&mut client, destroy_header, &[]);
    let (reply_header, reply_payload) = read_frame(&mut client).unwrap();
    assert_eq!(reply_header.tag, Tag::Fail);
    assert_eq!(read_reply_message(&reply_payload).unwrap(), "no such VM");
}

#[test]
fn create_over_budget_leaves_no_vm_and_never_touches_console() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().to_path_buf();
    std::fs::create_dir_all(&runtime_dir).unwrap();
    let mut config = test_config(runtime_dir);
    config.total_mem_mb = 32; // smaller than the request below

    let cons_socket = config.console_socket_path.to_string_lossy().to_string();
    thread::spawn(move || vmm_console::run_server(&cons_socket).unwrap());
    spawn_log_stub(config.log_socket_path.clone());

    let vmmd_socket = config.socket_path.clone();
    thread::spawn(move || vmmd::run(config).unwrap());
    let mut client = wait_for_socket(&vmmd_socket);

    let id: VmId = "vm.big".parse().unwrap();
    let req = CreateRequest {
        mem_mb: 4096,
        vcpus: 1,
        tap_count: 1,
    };
    let (header, payload) = create_request_frame(id, &req);
    send(&mut client, header, &payload);

    let (reply_header, _payload) = read_frame(&mut client).unwrap();
    assert_eq!(reply_header.tag, Tag::Fail);
}

#[test]
fn startup_aborts_when_console_helper_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let runtime_dir = dir.path().to_path_buf();
    std::fs::create_dir_all(&runtime_dir).unwrap();
    let config = test_config(runtime_dir);
    // Neither the console helper nor the log helper is started: the
    // console connect attempt should fail first and vmmd::run should
    // return an error rather than blocking or panicking.
    assert!(vmmd::run(config).is_err());
}
