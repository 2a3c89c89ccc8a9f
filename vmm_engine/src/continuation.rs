// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use vmm_wire::VmId;

use crate::effect::Effect;
use crate::state::{EngineState, VmRecord};

/// What the supervisor should do after a transition returns.
pub enum Continuation {
    /// Processing is complete; no further action needed.
    End,

    /// Await an external event (used by the reaper: wait for the child
    /// tied to `task` to exit), then emit `post_effects`.
    Wait {
        task: WaitTask,
        post_effects: Vec<Effect>,
    },

    /// A create is pending. The supervisor must deliver the `Cons`
    /// effects already present in this transition's effect list, await
    /// the console helper's reply to the `Add` request, and then invoke
    /// the boxed continuation with that outcome.
    Create(CreateContinuation),
}

/// Identifies the external event a `Wait` continuation is waiting on.
/// Currently only child-process exit, but kept as an enum so a future
/// wait source (e.g. a timer) doesn't require reshaping `Continuation`.
#[derive(Debug, Clone)]
pub enum WaitTask {
    ChildExit { id: VmId },
}

/// The "coroutine-shaped boundary" of the two-phase `Create` protocol
/// (spec.md §9's design note): a boxed closure the supervisor invokes
/// once it has the console helper's reply to the `Add` request it was
/// told to send. Realized as a plain `FnOnce` rather than an actual Rust
/// coroutine/generator, since stable Rust has no such primitive -- this
/// is the idiomatic equivalent spec.md's design note itself suggests
/// ("a closure (or a resumable-state struct)").
pub struct CreateContinuation {
    inner: Box<dyn FnOnce(EngineState, ConsoleAck) -> CreateOutcome + Send>,
}

/// The console helper's answer to the `Add` request issued in phase 1.
pub enum ConsoleAck {
    Success,
    Fail(String),
}

/// What phase 2 (or the phase-1 rollback) produces.
pub enum CreateOutcome {
    /// Phase 2 succeeded: the new state (with the VM record already
    /// inserted, pid/stdout still unset), the follow-on effects (stats
    /// setup, log line, client reply), and the record itself so the
    /// supervisor knows what to spawn.
    Finalized {
        state: EngineState,
        effects: Vec<Effect>,
        record: VmRecord,
    },

    /// The console Add failed (or some other phase-2 precondition
    /// failed): state is rolled back to pre-command, and a fail reply is
    /// the only effect.
    RolledBack {
        state: EngineState,
        effects: Vec<Effect>,
    },
}

impl CreateContinuation {
    pub fn new(
        f: impl FnOnce(EngineState, ConsoleAck) -> CreateOutcome + Send + 'static,
    ) -> Self {
        Self { inner: Box::new(f) }
    }

    /// Invokes the continuation with the phase-1 state (reserved but not
    /// yet finalized) and the console helper's reply.
    pub fn resume(self, reserved_state: EngineState, ack: ConsoleAck) -> CreateOutcome {
        (self.inner)(reserved_state, ack)
    }
}
