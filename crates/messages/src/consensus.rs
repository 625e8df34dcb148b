//! The consensus message envelope and its variants.

use concord_types::{Digest, NodeId, Proposal, Signature};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Leader's proposal for one sequence in one view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    /// View the proposal belongs to.
    pub view: u64,
    /// Sequence the proposal claims.
    pub seq: u64,
    /// The proposed batch.
    pub proposal: Proposal,
    /// Commit signatures of the previous decision, for followers that
    /// missed them.
    pub prev_commit_signatures: Vec<Signature>,
}

/// A replica's endorsement of a proposal digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: u64,
    pub seq: u64,
    /// Digest of the proposal being endorsed.
    pub digest: Digest,
    /// Signature over the canonical `(view, seq, digest)` envelope.
    pub signature: Signature,
}

/// A replica's commitment to a prepared proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: u64,
    pub seq: u64,
    pub digest: Digest,
    /// Signature over the proposal digest; collected into the decision.
    pub signature: Signature,
    /// Set when re-sent to help a lagging replica rather than as a vote.
    pub assist: bool,
}

/// Declaration that the sender wants to move to `next_view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    pub next_view: u64,
    /// Human-readable trigger, for the log of whoever collects this.
    pub reason: String,
}

/// A replica's state snapshot sent to the prospective leader of `next_view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewData {
    pub next_view: u64,
    /// The sender's checkpoint: last delivered proposal.
    pub last_decision: Proposal,
    /// Commit signatures of the last delivered proposal.
    pub last_decision_signatures: Vec<Signature>,
    /// Proposal past Pre-Prepare but not yet delivered, if any.
    pub in_flight: Option<Proposal>,
    /// Prepares collected for the in-flight proposal, by signer.
    pub in_flight_prepares: BTreeMap<NodeId, Prepare>,
}

/// The new leader's announcement assembling a quorum of [`ViewData`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewView {
    pub view: u64,
    /// One envelope per distinct sender, at least a quorum of them.
    pub view_data: Vec<(NodeId, ViewData)>,
}

/// Leader liveness beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeat {
    pub view: u64,
    pub seq: u64,
}

/// Follower's answer to a heartbeat, reporting its own position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatResponse {
    pub view: u64,
    pub seq: u64,
}

/// Request for peers' checkpoint positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferRequest {}

/// A peer's checkpoint position, solicited or assisting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferResponse {
    pub view_id: u64,
    pub seq: u64,
}

/// The consensus wire envelope: exactly one protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
    ViewChange(ViewChange),
    ViewData(ViewData),
    NewView(NewView),
    HeartBeat(HeartBeat),
    HeartBeatResponse(HeartBeatResponse),
    StateTransferRequest(StateTransferRequest),
    StateTransferResponse(StateTransferResponse),
}

impl Message {
    /// View number carried by an agreement-phase message.
    pub fn view(&self) -> Option<u64> {
        match self {
            Message::PrePrepare(m) => Some(m.view),
            Message::Prepare(m) => Some(m.view),
            Message::Commit(m) => Some(m.view),
            _ => None,
        }
    }

    /// Sequence number carried by an agreement-phase message.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Message::PrePrepare(m) => Some(m.seq),
            Message::Prepare(m) => Some(m.seq),
            Message::Commit(m) => Some(m.seq),
            _ => None,
        }
    }

    /// Whether this message is handled by the current view's phase loop.
    pub fn is_view_message(&self) -> bool {
        matches!(
            self,
            Message::PrePrepare(_) | Message::Prepare(_) | Message::Commit(_)
        )
    }

    /// Whether this message is handled by the view changer.
    pub fn is_view_change_message(&self) -> bool {
        matches!(
            self,
            Message::ViewChange(_) | Message::ViewData(_) | Message::NewView(_)
        )
    }

    /// Message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::PrePrepare(_) => "PrePrepare",
            Message::Prepare(_) => "Prepare",
            Message::Commit(_) => "Commit",
            Message::ViewChange(_) => "ViewChange",
            Message::ViewData(_) => "ViewData",
            Message::NewView(_) => "NewView",
            Message::HeartBeat(_) => "HeartBeat",
            Message::HeartBeatResponse(_) => "HeartBeatResponse",
            Message::StateTransferRequest(_) => "StateTransferRequest",
            Message::StateTransferResponse(_) => "StateTransferResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_cover_phase_messages() {
        let prepare = Message::Prepare(Prepare {
            view: 2,
            seq: 9,
            digest: Digest::ZERO,
            signature: Signature::default(),
        });
        assert_eq!(prepare.view(), Some(2));
        assert_eq!(prepare.sequence(), Some(9));
        assert!(prepare.is_view_message());

        let hb = Message::HeartBeat(HeartBeat { view: 2, seq: 9 });
        assert_eq!(hb.view(), None);
        assert!(!hb.is_view_message());
        assert!(!hb.is_view_change_message());
    }
}
