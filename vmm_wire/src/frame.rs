// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use std::io::{Read, Write};

use log::trace;

use crate::error::{DecodeError, Error, ProtocolError};
use crate::id::VmId;
use crate::timestamp::Timestamp;

/// Only wire version this implementation speaks. A mismatch is an error
/// reply, never a reason to drop the connection.
pub const CURRENT_VERSION: u16 = 1;

/// Command/reply tags carried in every frame's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    AddConsole,
    AttachConsole,
    DetachConsole,
    History,
    Data,
    Create,
    Destroy,
    Info,
    Success,
    Fail,
    Log,
    Stat,
}

impl Tag {
    fn to_u16(self) -> u16 {
        match self {
            Self::AddConsole => 0,
            Self::AttachConsole => 1,
            Self::DetachConsole => 2,
            Self::History => 3,
            Self::Data => 4,
            Self::Create => 5,
            Self::Destroy => 6,
            Self::Info => 7,
            Self::Success => 8,
            Self::Fail => 9,
            Self::Log => 10,
            Self::Stat => 11,
        }
    }

    fn from_u16(v: u16) -> Result<Self, ProtocolError> {
        Ok(match v {
            0 => Self::AddConsole,
            1 => Self::AttachConsole,
            2 => Self::DetachConsole,
            3 => Self::History,
            4 => Self::Data,
            5 => Self::Create,
            6 => Self::Destroy,
            7 => Self::Info,
            8 => Self::Success,
            9 => Self::Fail,
            10 => Self::Log,
            11 => Self::Stat,
            other => return Err(ProtocolError::UnknownTag(other)),
        })
    }
}

/// The header present on every framed message: `(version, tag, identifier,
/// payload_len)`, per spec.md's external interface section.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u16,
    pub tag: Tag,
    pub id: VmId,
    pub payload_len: u32,
}

impl Header {
    pub fn new(tag: Tag, id: VmId, payload_len: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            tag,
            id,
            payload_len,
        }
    }
}

/// Writes `header` followed by `payload` to `stream`. `header.payload_len`
/// must equal `payload.len()`; this is a caller invariant, not re-derived
/// here, so that a short write can't silently desync the two.
pub fn write_frame<W: Write>(stream: &mut W, header: &Header, payload: &[u8]) -> Result<(), Error> {
    debug_assert_eq!(header.payload_len as usize, payload.len());

    let mut buf = Vec::with_capacity(2 + 2 + 2 + payload.len() + 32);
    write_u16(&mut buf, header.version);
    write_u16(&mut buf, header.tag.to_u16());
    encode_identifier(&mut buf, &header.id);
    write_u32(&mut buf, header.payload_len);
    buf.extend_from_slice(payload);

    stream.write_all(&buf)?;
    Ok(())
}

/// Reads one complete frame from `stream`: the header, then exactly
/// `payload_len` bytes of payload. A version mismatch is returned as
/// `Error::Protocol` rather than panicking -- the caller decides whether to
/// reply with a fail frame and keep the connection, per spec.md's "version
/// mismatch replies are errors, never fatal to the connection."
pub fn read_frame<R: Read>(stream: &mut R) -> Result<(Header, Vec<u8>), Error> {
    let version = read_u16_stream(stream)?;
    let tag = Tag::from_u16(read_u16_stream(stream)?)?;
    let id = decode_identifier_stream(stream)?;
    let payload_len = read_u32_stream(stream)?;

    let mut payload = vec![0u8; payload_len as usize];
    stream.read_exact(&mut payload).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Protocol(ProtocolError::Truncated)
        } else {
            Error::Io(e)
        }
    })?;

    let header = Header {
        version,
        tag,
        id,
        payload_len,
    };

    if version != CURRENT_VERSION {
        trace!("frame with unsupported version {version}");
        return Err(Error::Protocol(ProtocolError::VersionMismatch(version)));
    }

    Ok((header, payload))
}

// --- primitive encode/decode helpers -------------------------------------

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

pub fn write_timestamp(buf: &mut Vec<u8>, ts: Timestamp) {
    write_u64(buf, ts.secs);
    write_u64(buf, ts.picos);
}

pub fn encode_identifier(buf: &mut Vec<u8>, id: &VmId) {
    write_u16(buf, id.labels().len() as u16);
    for label in id.labels() {
        write_u16(buf, label.len() as u16);
        buf.extend_from_slice(label.as_bytes());
    }
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Short);
    }
    let (head, rest) = buf.split_at(2);
    *buf = rest;
    Ok(u16::from_be_bytes(head.try_into().unwrap()))
}

pub fn read_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.len() < 4 {
        return Err(DecodeError::Short);
    }
    let (head, rest) = buf.split_at(4);
    *buf = rest;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

pub fn read_u64(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    if buf.len() < 8 {
        return Err(DecodeError::Short);
    }
    let (head, rest) = buf.split_at(8);
    *buf = rest;
    Ok(u64::from_be_bytes(head.try_into().unwrap()))
}

pub fn read_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let len = read_u32(buf)? as usize;
    if buf.len() < len {
        return Err(DecodeError::Short);
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(head.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

pub fn read_timestamp(buf: &mut &[u8]) -> Result<Timestamp, DecodeError> {
    let secs = read_u64(buf)?;
    let picos = read_u64(buf)?;
    Ok(Timestamp::new(secs, picos))
}

pub fn decode_identifier(buf: &mut &[u8]) -> Result<VmId, DecodeError> {
    let count = read_u16(buf)?;
    let mut labels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u16(buf)? as usize;
        if buf.len() < len {
            return Err(DecodeError::Short);
        }
        let (head, rest) = buf.split_at(len);
        *buf = rest;
        labels.push(String::from_utf8(head.to_vec()).map_err(|_| DecodeError::InvalidUtf8)?);
    }
    if labels.is_empty() {
        return Ok(VmId::root());
    }
    VmId::from_labels(labels)
}

// Stream-reading variants used only while parsing a `Header` off the wire,
// where the identifier's length isn't known up front so it can't go
// through the slice-based `decode_identifier` above.

fn read_u16_stream<R: Read>(stream: &mut R) -> Result<u16, Error> {
    let mut b = [0u8; 2];
    stream.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32_stream<R: Read>(stream: &mut R) -> Result<u32, Error> {
    let mut b = [0u8; 4];
    stream.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn decode_identifier_stream<R: Read>(stream: &mut R) -> Result<VmId, Error> {
    let count = read_u16_stream(stream)?;
    let mut labels = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u16_stream(stream)?;
        let mut bytes = vec![0u8; len as usize];
        stream.read_exact(&mut bytes)?;
        labels.push(String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?);
    }
    if labels.is_empty() {
        return Ok(VmId::root());
    }
    Ok(VmId::from_labels(labels)?)
}

/// Encodes `header` and `payload` into a standalone byte buffer, for
/// callers that build up a message to hand off to another thread (e.g. a
/// helper fan-out queue) rather than writing directly to a stream.
pub fn encode_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + payload.len());
    write_frame(&mut buf, header, payload).expect("writing to a Vec<u8> cannot fail");
    buf
}

/// Builds a `Success` frame, with an optional human-readable message, per
/// spec.md's "every command receives either a success reply (with an
/// optional message string) or a fail reply."
pub fn success_frame(id: VmId, message: Option<&str>) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_string(&mut payload, message.unwrap_or(""));
    let header = Header::new(Tag::Success, id, payload.len() as u32);
    (header, payload)
}

/// Builds a `Fail` frame carrying a diagnostic string.
pub fn fail_frame(id: VmId, message: &str) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_string(&mut payload, message);
    let header = Header::new(Tag::Fail, id, payload.len() as u32);
    (header, payload)
}

/// Reads the message string out of a `Success`/`Fail` payload.
pub fn read_reply_message(mut payload: &[u8]) -> Result<String, DecodeError> {
    read_string(&mut payload)
}

/// Builds a console `Data` frame: identifier (header) + timestamp + line.
pub fn data_frame(id: VmId, ts: Timestamp, line: &str) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_timestamp(&mut payload, ts);
    write_string(&mut payload, line);
    let header = Header::new(Tag::Data, id, payload.len() as u32);
    (header, payload)
}

/// Reads a `Data` frame's payload back into `(timestamp, line)`.
pub fn read_data_payload(mut payload: &[u8]) -> Result<(Timestamp, String), DecodeError> {
    let ts = read_timestamp(&mut payload)?;
    let line = read_string(&mut payload)?;
    Ok((ts, line))
}

/// Builds an `AddConsole` request frame: identifier (header) + the FIFO
/// path the console helper should open and tail.
pub fn add_console_frame(id: VmId, fifo_path: &str) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_string(&mut payload, fifo_path);
    let header = Header::new(Tag::AddConsole, id, payload.len() as u32);
    (header, payload)
}

/// Reads the FIFO path out of an `AddConsole` request's payload.
pub fn read_add_console_payload(mut payload: &[u8]) -> Result<String, DecodeError> {
    read_string(&mut payload)
}

/// Builds an `AttachConsole` request frame. The identifier alone names the
/// console to subscribe to; the requesting connection itself is the reply
/// channel, so there's no payload.
pub fn attach_console_frame(id: VmId) -> (Header, Vec<u8>) {
    let header = Header::new(Tag::AttachConsole, id, 0);
    (header, Vec::new())
}

/// Builds a `DetachConsole` request frame.
pub fn detach_console_frame(id: VmId) -> (Header, Vec<u8>) {
    let header = Header::new(Tag::DetachConsole, id, 0);
    (header, Vec::new())
}

/// Builds a `History` request frame: identifier (header) + since-cursor.
pub fn history_request_frame(id: VmId, since: Timestamp) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_timestamp(&mut payload, since);
    let header = Header::new(Tag::History, id, payload.len() as u32);
    (header, payload)
}

/// Reads a `History` request's since-cursor out of its payload.
pub fn read_history_cursor(mut payload: &[u8]) -> Result<Timestamp, DecodeError> {
    read_timestamp(&mut payload)
}

/// Builds a `Log` frame: a single line of text, not associated with any
/// particular VM. Carried over the log helper socket, which is just as
/// length-framed as the other three (spec.md §6).
pub fn log_frame(line: &str) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_string(&mut payload, line);
    let header = Header::new(Tag::Log, VmId::root(), payload.len() as u32);
    (header, payload)
}

/// Reads a `Log` frame's payload back into its line.
pub fn read_log_payload(mut payload: &[u8]) -> Result<String, DecodeError> {
    read_string(&mut payload)
}

/// Builds a `Stat` frame: the VM identifier plus an event name. Carried
/// over the stats helper socket, per spec.md §6.
pub fn stat_frame(id: VmId, event: &str) -> (Header, Vec<u8>) {
    let mut payload = Vec::new();
    write_string(&mut payload, event);
    let header = Header::new(Tag::Stat, id, payload.len() as u32);
    (header, payload)
}

/// Reads a `Stat` frame's payload back into its event name.
pub fn read_stat_payload(mut payload: &[u8]) -> Result<String, DecodeError> {
    read_string(&mut payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::VmId;

    #[test]
    fn header_round_trips_through_a_stream() {
        let id: VmId = "vm.a".parse().unwrap();
        let payload = b"hello".to_vec();
        let header = Header::new(Tag::Data, id.clone(), payload.len() as u32);

        let mut buf = Vec::new();
        write_frame(&mut buf, &header, &payload).unwrap();

        let mut cursor = buf.as_slice();
        let (got_header, got_payload) = read_frame(&mut cursor).unwrap();

        assert_eq!(got_header.version, CURRENT_VERSION);
        assert_eq!(got_header.tag, Tag::Data);
        assert_eq!(got_header.id, id);
        assert_eq!(got_payload, payload);
    }

    #[test]
    fn version_mismatch_is_reported_not_panicked() {
        let mut buf = Vec::new();
        write_u16(&mut buf, 99); // bogus version
        write_u16(&mut buf, Tag::Data.to_u16());
        encode_identifier(&mut buf, &VmId::root());
        write_u32(&mut buf, 0);

        let mut cursor = buf.as_slice();
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::VersionMismatch(99))
        ));
    }

    #[test]
    fn unknown_tag_is_reported() {
        let mut buf = Vec::new();
        write_u16(&mut buf, CURRENT_VERSION);
        write_u16(&mut buf, 255); // unknown tag
        encode_identifier(&mut buf, &VmId::root());
        write_u32(&mut buf, 0);

        let mut cursor = buf.as_slice();
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownTag(255))
        ));
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut buf = Vec::new();
        write_u16(&mut buf, CURRENT_VERSION);
        write_u16(&mut buf, Tag::Data.to_u16());
        encode_identifier(&mut buf, &VmId::root());
        write_u32(&mut buf, 10); // claims 10 bytes but provides none

        let mut cursor = buf.as_slice();
        let err = read_frame(&mut cursor).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn data_frame_round_trip() {
        let id: VmId = "vm.a".parse().unwrap();
        let ts = Timestamp::new(42, 7);
        let (_header, payload) = data_frame(id, ts, "hello\n");
        let (got_ts, got_line) = read_data_payload(&payload).unwrap();
        assert_eq!(got_ts, ts);
        assert_eq!(got_line, "hello\n");
    }

    #[test]
    fn add_console_frame_round_trip() {
        let id: VmId = "vm.a".parse().unwrap();
        let (header, payload) = add_console_frame(id, "/run/vmmd/vm.a.fifo");
        assert_eq!(header.tag, Tag::AddConsole);
        assert_eq!(
            read_add_console_payload(&payload).unwrap(),
            "/run/vmmd/vm.a.fifo"
        );
    }

    #[test]
    fn success_and_fail_frames_carry_message() {
        let id = VmId::root();
        let (header, payload) = fail_frame(id, "not found");
        assert_eq!(header.tag, Tag::Fail);
        assert_eq!(read_reply_message(&payload).unwrap(), "not found");
    }
}
