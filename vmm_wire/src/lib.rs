// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Opaque length-framed wire codec shared by the supervisor and the
//! console multiplexer: a header of `(version, tag, identifier,
//! payload_len)` followed by `payload_len` bytes. This crate has no
//! opinion on what a payload *means* -- that's the engine's and the
//! console multiplexer's job -- it only frames and unframes bytes.

pub mod error;
pub mod frame;
pub mod id;
pub mod timestamp;

pub use error::{DecodeError, Error, ProtocolError};
pub use frame::{
    add_console_frame, attach_console_frame, data_frame, decode_identifier, detach_console_frame,
    encode_frame, encode_identifier, fail_frame, history_request_frame, log_frame,
    read_add_console_payload, read_data_payload, read_frame, read_history_cursor,
    read_log_payload, read_reply_message, read_stat_payload, read_string, read_timestamp,
    read_u16, read_u32, read_u64, stat_frame, success_frame, write_frame, write_string,
    write_timestamp, write_u16, write_u32, write_u64, Header, Tag, CURRENT_VERSION,
};
pub use id::VmId;
pub use timestamp::Timestamp;
