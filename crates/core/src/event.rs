//! Event types for the deterministic state machine.

use crate::TimerId;
use concord_messages::Message;
use concord_types::{NodeId, Proposal, Signature};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,
    /// Timer events: scheduled by the node itself.
    Timer = 1,
    /// Network events: external inputs from other nodes.
    Network = 2,
    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** — they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// A timer fired. The current time reaches the state machine through
    /// `StateMachine::set_time` before the event is handled.
    Tick { id: TimerId },

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A consensus message arrived from another replica.
    MessageReceived { from: NodeId, message: Message },

    /// A raw client request forwarded by another replica after its request
    /// timeout expired.
    RequestReceived { from: NodeId, request: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a request to this replica.
    SubmitRequest { request: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (priority: Internal)
    // These replace channel sends between the subsystems of the original
    // task-per-component design.
    // ═══════════════════════════════════════════════════════════════════════
    /// The runner finished delivering a decision to the application.
    ///
    /// Fed back after `Action::Deliver`; the controller resumes the view,
    /// prunes the pool and re-arms the leader token on this event.
    DeliveryAcknowledged,

    /// The view changer reached agreement on a new view.
    ViewChangeCompleted {
        view: u64,
        /// First sequence of the new view.
        start_sequence: u64,
        /// Undelivered proposal that must be re-proposed in the new view.
        in_flight: Option<Proposal>,
    },

    /// The synchronizer finished catching this replica up.
    ///
    /// Carries the latest decision the replica now agrees on; fed back after
    /// `Action::RequestSync`.
    SyncCompleted {
        proposal: Proposal,
        signatures: Vec<Signature>,
    },

    /// Shut the replica down. Idempotent.
    Stop,
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::DeliveryAcknowledged
            | Event::ViewChangeCompleted { .. }
            | Event::SyncCompleted { .. }
            | Event::Stop => EventPriority::Internal,

            Event::Tick { .. } => EventPriority::Timer,

            Event::MessageReceived { .. } | Event::RequestReceived { .. } => EventPriority::Network,

            Event::SubmitRequest { .. } => EventPriority::Client,
        }
    }

    /// Get the event type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Tick { .. } => "Tick",
            Event::MessageReceived { .. } => "MessageReceived",
            Event::RequestReceived { .. } => "RequestReceived",
            Event::SubmitRequest { .. } => "SubmitRequest",
            Event::DeliveryAcknowledged => "DeliveryAcknowledged",
            Event::ViewChangeCompleted { .. } => "ViewChangeCompleted",
            Event::SyncCompleted { .. } => "SyncCompleted",
            Event::Stop => "Stop",
        }
    }
}
