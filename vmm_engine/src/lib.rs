// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The pure VM lifecycle engine: a command dispatcher with no I/O of its
//! own. Every public entry point takes an [`EngineState`] by reference and
//! returns a new one plus a list of [`Effect`]s for the supervisor to carry
//! out -- nothing here opens a socket, forks a process, or writes a file.

pub mod commands;
pub mod continuation;
pub mod effect;
pub mod error;
pub mod state;

pub use commands::{
    console_fifo_path, create_request_frame, decode_info_reply, encode_info_reply,
    handle_command, handle_shutdown, CreateRequest, InfoEntry,
};
pub use continuation::{Continuation, ConsoleAck, CreateContinuation, CreateOutcome, WaitTask};
pub use effect::{log_line, Effect};
pub use error::Error;
pub use state::{Budget, EngineState, RawFd, TapPool, VmRecord};
