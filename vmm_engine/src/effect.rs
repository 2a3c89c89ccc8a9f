// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Side-effect intents returned alongside every state transition. The
//! engine never performs I/O itself; it only describes what the
//! supervisor should do.

/// An ordered side-effect intent. The supervisor dispatches these in the
/// order they appear in a transition's effect list.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Deliver a pre-framed message to the console helper's outbound
    /// queue.
    Cons(Vec<u8>),

    /// Deliver a message to the stats helper's outbound queue. Losing
    /// this helper is non-fatal (spec.md §4.4), so effects of this kind
    /// are best-effort from the supervisor's point of view.
    Stat(Vec<u8>),

    /// Deliver a UTF-8 log line to the log helper's outbound queue.
    Log(Vec<u8>),

    /// Send a pre-framed reply on the client socket that originated the
    /// command.
    Data(Vec<u8>),

    /// Send a termination signal to a pid. This isn't one of spec.md's
    /// four named effect kinds -- the original source issues the kill
    /// syscall inline from within the (impure) command handler. Because
    /// this engine is a pure function with no OS access of its own, the
    /// kill has to travel back to the supervisor as data like every other
    /// effect; this variant is how.
    Kill(u32),
}

/// Builds a framed `Log` line effect. Like every other socket in this
/// system (spec.md §6), the log helper's stream is length-framed binary,
/// not bare text.
pub fn log_line(line: impl Into<String>) -> Effect {
    let (header, payload) = vmm_wire::log_frame(&line.into());
    Effect::Log(vmm_wire::encode_frame(&header, &payload))
}
