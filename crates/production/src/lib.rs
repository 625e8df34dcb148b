//! Production runner for concord consensus.
//!
//! Hosts the deterministic replica state machine on tokio: an event loop
//! task owns the [`Controller`](concord_bft::Controller) and the write-ahead
//! log, timer tasks feed one-shot timeouts back as events, and a tick
//! demultiplexer fans a single clock into the recurring protocol ticks.
//! Network I/O stays behind the embedding's [`Comm`](concord_core::Comm)
//! implementation.
//!
//! ```text
//! Comm ingest ─┐
//! timers ──────┼─► mpsc ─► Controller::handle() ─► actions ─► comm/wal/app
//! clock fanout ┘
//! ```

mod replica;
mod ticker;
mod timers;

pub use replica::{Replica, ReplicaArgs};
pub use ticker::TickDemultiplexer;
pub use timers::TimerManager;

use tracing_subscriber::EnvFilter;

/// Install a basic structured-logging subscriber honoring `RUST_LOG`.
///
/// Convenience for binaries embedding the library; call once at startup.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
