// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::Write;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use vmm_console::mux::{self, MuxEvent};
use vmm_wire::{Timestamp, VmId};

fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(v) = poll() {
            return v;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for condition");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn add_then_history_replays_lines_written_to_the_fifo() {
    let dir = tempfile::tempdir().unwrap();
    let fifo_path = dir.path().join("vm.a.fifo");
    nix::unistd::mkfifo(&fifo_path, nix::sys::stat::Mode::S_IRWXU).unwrap();

    let events = mux::spawn();
    let id: VmId = "vm.a".parse().unwrap();

    let (add_tx, add_rx) = mpsc::channel();
    events
        .send(MuxEvent::Add {
            id: id.clone(),
            fifo_path: fifo_path.clone(),
            reply: add_tx,
        })
        .unwrap();
    add_rx.recv().unwrap().unwrap();

    let writer_path = fifo_path.clone();
    std::thread::spawn(move || {
        let mut f = std::fs::OpenOptions::new().write(true).open(&writer_path).unwrap();
        writeln!(f, "hello").unwrap();
        writeln!(f, "world").unwrap();
    });

    let lines = wait_for(|| {
        let (history_tx, history_rx) = mpsc::channel();
        let (outbound_tx, outbound_rx) = mux::subscriber_channel();
        events
            .send(MuxEvent::History {
                id: id.clone(),
                since: Timestamp::ZERO,
                outbound: outbound_tx,
                reply: history_tx,
            })
            .unwrap();
        history_rx.recv().unwrap().unwrap();

        let mut lines = Vec::new();
        while let Ok(frame) = outbound_rx.try_recv() {
            let (_header, payload) = vmm_wire::read_frame(&mut frame.as_slice()).unwrap();
            let (_ts, line) = vmm_wire::read_data_payload(&payload).unwrap();
            lines.push(line);
        }

        if lines.len() >= 2 {
            Some(lines)
        } else {
            None
        }
    });

    assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
}

#[test]
fn history_on_an_unknown_console_fails() {
    let events = mux::spawn();
    let (tx, rx) = mpsc::channel();
    let (outbound_tx, _outbound_rx) = mux::subscriber_channel();

    events
        .send(MuxEvent::History {
            id: "vm.nonexistent".parse().unwrap(),
            since: Timestamp::ZERO,
            outbound: outbound_tx,
            reply: tx,
        })
        .unwrap();

    assert!(rx.recv().unwrap().is_err());
}

#[test]
fn attach_then_detach_then_attach_by_another_connection_displaces_cleanly() {
    let events = mux::spawn();
    let id: VmId = "vm.b".parse().unwrap();

    let (tx1, rx1) = mpsc::channel();
    let (out1, _rx_out1) = mux::subscriber_channel();
    events
        .send(MuxEvent::Attach {
            id: id.clone(),
            conn: 1,
            outbound: out1,
            reply: tx1,
        })
        .unwrap();
    rx1.recv().unwrap().unwrap();

    let (tx2, rx2) = mpsc::channel();
    let (out2, rx_out2) = mux::subscriber_channel();
    events
        .send(MuxEvent::Attach {
            id: id.clone(),
            conn: 2,
            outbound: out2,
            reply: tx2,
        })
        .unwrap();
    rx2.recv().unwrap().unwrap();

    // Live lines should now reach connection 2, not connection 1.
    events
        .send(MuxEvent::Line {
            id: id.clone(),
            ts: Timestamp::now(),
            line: "after displacement".into(),
        })
        .unwrap();

    let frame = wait_for(|| rx_out2.try_recv().ok());
    let (_header, payload) = vmm_wire::read_frame(&mut frame.as_slice()).unwrap();
    let (_ts, line) = vmm_wire::read_data_payload(&payload).unwrap();
    assert_eq!(line, "after displacement");
}
