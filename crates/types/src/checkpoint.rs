//! Checkpoint of the latest delivered decision.

use crate::{Proposal, Signature, ViewMetadata};
use tracing::debug;

/// The most recently delivered `(Proposal, signatures)` pair.
///
/// Monotonic in the proposal's `latest_sequence`: attempts to install an
/// older decision are ignored. This is the safe restart point for a replica
/// and the basis of the view changer's catch-up exchange.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    proposal: Proposal,
    signatures: Vec<Signature>,
}

impl Checkpoint {
    /// Latest delivered proposal and its commit signatures.
    pub fn get(&self) -> (Proposal, Vec<Signature>) {
        (self.proposal.clone(), self.signatures.clone())
    }

    /// Metadata of the latest delivered proposal.
    ///
    /// A fresh checkpoint (nothing delivered yet) reports the zero metadata.
    pub fn metadata(&self) -> ViewMetadata {
        if self.proposal.metadata.is_empty() {
            return ViewMetadata::default();
        }
        self.proposal.view_metadata().unwrap_or_default()
    }

    /// Sequence of the latest delivered proposal, 0 if none.
    pub fn sequence(&self) -> u64 {
        self.metadata().latest_sequence
    }

    /// Install a newer decision. Stale decisions are ignored.
    pub fn set(&mut self, proposal: Proposal, signatures: Vec<Signature>) {
        let current = self.sequence();
        let incoming = proposal
            .view_metadata()
            .map(|md| md.latest_sequence)
            .unwrap_or(0);
        if !self.proposal.metadata.is_empty() && incoming <= current {
            debug!(current, incoming, "Ignoring stale checkpoint");
            return;
        }
        self.proposal = proposal;
        self.signatures = signatures;
    }
}
