//! BFT total-order broadcast state machine.
//!
//! This crate provides a synchronous, deterministic implementation of
//! PBFT-style three-phase agreement that can be driven by both the
//! deterministic simulation runner and the tokio production runner.
//!
//! # Architecture
//!
//! The [`Controller`] is the replica state machine. It processes events
//! synchronously:
//!
//! - `Event::SubmitRequest` → admit into the request pool, maybe cut a batch
//! - `Event::MessageReceived` → route to the view, view changer or
//!   heartbeat monitor
//! - `Event::Tick` → pool timeout sweep, heartbeat emission/deadline,
//!   view-change resend
//! - `Event::DeliveryAcknowledged` → advance the view, prune the pool,
//!   re-arm the leader token
//!
//! All I/O is performed by the runner via returned `Action`s, strictly in
//! order; a `Persist` preceding a send is durable before the message leaves
//! the replica.
//!
//! # Terminology
//!
//! - **View**: a configuration `(number v, leader = sort(nodes)[v mod N])`
//!   under which one instance of three-phase agreement runs at a time.
//!
//! - **Sequence**: index of a decision; increases by exactly one per
//!   delivery within a view.
//!
//! - **Quorum (Q)**: `ceil((N + f + 1) / 2)`; any two quorums intersect in
//!   at least `f + 1` replicas.
//!
//! # Protocol
//!
//! ## Normal case
//!
//! The leader pulls a batch from the pool, assembles a proposal and drives
//! Pre-Prepare → Prepare → Commit. Every replica persists its intent to the
//! write-ahead log before each broadcast, so a restarted replica re-enters
//! the same phase and re-broadcasts rather than equivocates.
//!
//! ## Leader failure
//!
//! Request timeouts and heartbeat loss raise complaints; the view changer
//! collects `ViewChange` declarations, the prospective leader assembles a
//! `NewView` from a quorum of `ViewData` snapshots, and the controller
//! installs the new view. An in-flight proposal backed by a prepare
//! certificate survives the transition and is re-proposed.
//!
//! ## Catch-up
//!
//! A replica that detects a sequence gap — through heartbeats, phase
//! messages from the future or the view-change exchange — asks its
//! synchronizer to replicate the missed decisions and resumes at the exact
//! point the network reached.

mod config;
mod controller;
mod heartbeat;
mod persist;
mod view;
mod view_changer;
mod vote_set;

pub use config::Config;
pub use controller::{Controller, ControllerStats, NodeContext};
pub use heartbeat::{HeartbeatMonitor, HeartbeatOutcome};
pub use persist::{restore, RecoveredPhase, RecoveredState, WalEntry};
pub use view::{commit_envelope, InFlightProposal, Phase, View, ViewOutcome};
pub use view_changer::{ViewChanger, ViewChangerOutcome};
pub use vote_set::VoteSet;
