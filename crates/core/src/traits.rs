//! Core trait for state machines.

use crate::{Action, Event};
use std::time::Duration;

/// A state machine that processes events.
///
/// This is the core abstraction of the consensus architecture. All protocol
/// logic is implemented as state machines that are:
///
/// - **Synchronous**: No async, no `.await`
/// - **Deterministic**: Same state + event = same actions
/// - **Pure-ish**: Mutates self, but performs no I/O
pub trait StateMachine {
    /// Process an event, returning actions to perform.
    ///
    /// The runner executes the returned actions strictly in order. Actions
    /// may include sending messages, arming timers, persisting log records,
    /// delivering decisions and enqueueing internal events.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current time.
    ///
    /// Called by the runner before each `handle()` call to provide the
    /// current simulation or wall-clock time.
    fn set_time(&mut self, now: Duration);

    /// Get the current time last set via `set_time()`.
    fn now(&self) -> Duration;
}
