// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::fmt;

/// Errors that can arise while framing or decoding a message on one of the
/// daemon's local stream sockets.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level problems: framing, version, or tag errors that are
    /// detected before the payload is interpreted.
    Protocol(ProtocolError),

    /// Payload bytes could not be decoded into the structure the caller
    /// expected (e.g. a malformed identifier or a non-UTF8 string).
    Decode(DecodeError),

    /// I/O errors reading or writing the underlying stream.
    Io(std::io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    /// The header's version field did not match `CURRENT_VERSION`.
    VersionMismatch(u16),

    /// The tag field did not correspond to any known `Tag` variant.
    UnknownTag(u16),

    /// The connection closed before a complete frame was read.
    Truncated,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VersionMismatch(v) => write!(f, "unsupported wire version {v}"),
            Self::UnknownTag(t) => write!(f, "unknown tag {t}"),
            Self::Truncated => write!(f, "connection closed mid-frame"),
        }
    }
}

#[derive(Debug)]
pub enum DecodeError {
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,

    /// An identifier had zero labels, or a label was empty or too long.
    InvalidIdentifier,

    /// A fixed-size field ran past the end of the payload.
    Short,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::InvalidUtf8 => "invalid UTF-8 in payload",
                Self::InvalidIdentifier => "invalid VM identifier",
                Self::Short => "payload too short for field",
            }
        )
    }
}
