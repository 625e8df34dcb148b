//! Request pool and batcher.
//!
//! The pool is the admission layer for client requests: a bounded ordered
//! multiset keyed by request fingerprint, with a three-stage timeout per
//! request (forward to leader → complain about leader → silent eviction).
//! The batcher peeks the pool front and cuts a batch once it is full or the
//! batch timeout elapses.
//!
//! Timeouts are evaluated against an injected clock on pool ticks, so tests
//! can virtualize time.

mod batcher;
mod pool;

pub use batcher::{BatchOutcome, Batcher};
pub use pool::{PoolOptions, RequestPool, SubmitError, TickOutcome};

/// Default request pool capacity.
pub const DEFAULT_POOL_CAPACITY: usize = 200;
