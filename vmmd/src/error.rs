// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;
use std::path::PathBuf;

/// Errors that can prevent the supervisor from starting or keep it from
/// running to completion. Per-client protocol errors never reach here --
/// those are replied to on their own connection and never interrupt the
/// engine loop.
#[derive(Debug)]
pub enum Error {
    /// The console or log helper -- both load-bearing at startup (spec.md
    /// §4.4) -- could not be connected to.
    HelperUnreachable {
        helper: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// Any other I/O failure: binding the client socket, creating the
    /// runtime directory.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HelperUnreachable { helper, path, source } => {
                write!(f, "{helper} helper unreachable at {path:?}: {source}")
            }
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
