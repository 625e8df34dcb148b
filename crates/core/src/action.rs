//! Action types for the deterministic state machine.

use crate::{Event, TimerId};
use concord_messages::Message;
use concord_types::{NodeId, Proposal, RequestInfo, Signature};
use concord_wal::Record;
use std::time::Duration;

/// Actions the state machine wants to perform.
///
/// Actions are **commands** — they describe something to do. The runner
/// executes actions **in the order returned**; in particular a
/// [`Action::Persist`] preceding a send is durable before the message leaves
/// the replica.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a consensus message to every other replica.
    Broadcast { message: Message },

    /// Send a consensus message to one replica.
    SendConsensus { to: NodeId, message: Message },

    /// Forward a raw client request to another replica (request timeout).
    ForwardRequest { to: NodeId, request: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a one-shot timer. Re-arming an active timer replaces it.
    SetTimer { id: TimerId, duration: Duration },

    /// Cancel a previously armed timer.
    CancelTimer { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Persistence
    // ═══════════════════════════════════════════════════════════════════════
    /// Append a record to the write-ahead log.
    ///
    /// A failed append is fatal: the runner crashes the replica so it
    /// restarts from disk truth instead of proceeding unpersisted.
    Persist { record: Record },

    /// Establish a new log prefix at `index` (checkpoint compaction).
    TruncateLog { index: usize },

    // ═══════════════════════════════════════════════════════════════════════
    // Application
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver a decision to the application, then feed back
    /// [`Event::DeliveryAcknowledged`].
    Deliver {
        proposal: Proposal,
        signatures: Vec<Signature>,
        requests: Vec<RequestInfo>,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal { event: Event },

    /// Ask the synchronizer to catch this replica up to the network.
    ///
    /// The runner performs the application-level replication and feeds back
    /// [`Event::SyncCompleted`] with the latest agreed decision.
    RequestSync,
}

impl Action {
    /// Get the action type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SendConsensus { .. } => "SendConsensus",
            Action::ForwardRequest { .. } => "ForwardRequest",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::Persist { .. } => "Persist",
            Action::TruncateLog { .. } => "TruncateLog",
            Action::Deliver { .. } => "Deliver",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::RequestSync => "RequestSync",
        }
    }

    /// Whether this action sends a message on the network.
    pub fn is_send(&self) -> bool {
        matches!(
            self,
            Action::Broadcast { .. } | Action::SendConsensus { .. } | Action::ForwardRequest { .. }
        )
    }
}
