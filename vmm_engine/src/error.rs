// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors observable by the engine, per spec.md §7.
#[derive(Debug)]
pub enum Error {
    /// Framing or version problems, surfaced before any command logic
    /// runs.
    Protocol(String),

    /// The payload didn't decode into the structure the command expected.
    Decode(String),

    /// The named VM does not exist.
    NotFound,

    /// A budget (memory, taps) would be exceeded, or the console FIFO
    /// could not be opened.
    Resource(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::NotFound => write!(f, "no such VM"),
            Self::Resource(msg) => write!(f, "resource error: {msg}"),
        }
    }
}

impl From<vmm_wire::DecodeError> for Error {
    fn from(e: vmm_wire::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}
