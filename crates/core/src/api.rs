//! Collaborator interfaces.
//!
//! Everything consensus consumes but does not implement: cryptography,
//! request/proposal inspection, proposal assembly, application delivery,
//! transport and out-of-band synchronization. The library is generic over
//! these; the simulation harness and any embedding application provide them.

use concord_messages::Message;
use concord_types::{NodeId, Proposal, RequestInfo, Signature};

/// A rejected request or proposal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("verification failed: {reason}")]
pub struct VerificationError {
    pub reason: String,
}

impl VerificationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Point-to-point transport between replicas.
///
/// Membership is static: `nodes` presents the N known identities.
pub trait Comm: Send + Sync {
    /// Send a consensus message to one replica. Best effort.
    fn send_consensus(&self, to: NodeId, message: Message);

    /// Forward a raw client request to one replica. Best effort.
    fn send_transaction(&self, to: NodeId, request: Vec<u8>);

    /// The identities of all replicas, including this one.
    fn nodes(&self) -> Vec<NodeId>;
}

/// Produces signatures on behalf of this replica.
pub trait Signer: Send + Sync {
    /// Sign an arbitrary to-be-signed envelope.
    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Sign a proposal, producing this replica's commit signature.
    fn sign_proposal(&self, proposal: &Proposal) -> Signature;
}

/// Validates requests, proposals and signatures.
pub trait Verifier: Send + Sync {
    /// Verify a proposal and extract the fingerprints of its requests.
    fn verify_proposal(&self, proposal: &Proposal) -> Result<Vec<RequestInfo>, VerificationError>;

    /// Verify a raw client request.
    fn verify_request(&self, request: &[u8]) -> Result<RequestInfo, VerificationError>;

    /// Verify a consenter's commit signature over a proposal.
    fn verify_consenter_sig(
        &self,
        signature: &Signature,
        proposal: &Proposal,
    ) -> Result<(), VerificationError>;

    /// Verify a detached signature.
    fn verify_signature(&self, signature: &Signature) -> Result<(), VerificationError>;

    /// Current verification sequence; a change revokes pooled requests that
    /// no longer verify.
    fn verification_sequence(&self) -> u64;
}

/// Extracts the `(client, id)` fingerprint from a raw request.
pub trait RequestInspector: Send + Sync {
    fn request_id(&self, request: &[u8]) -> RequestInfo;
}

/// Packs a batch of raw requests into a proposal.
pub trait Assembler: Send + Sync {
    /// Assemble a proposal from `requests` under the given metadata.
    ///
    /// Requests the assembler chooses not to include are returned as the
    /// remainder, in order, and go back to the front of the batcher.
    fn assemble_proposal(
        &self,
        metadata: &[u8],
        requests: Vec<Vec<u8>>,
    ) -> (Proposal, Vec<Vec<u8>>);
}

/// The replicated application.
pub trait Application: Send + Sync {
    /// Deliver a decided proposal. Called in sequence order, exactly once
    /// per sequence.
    fn deliver(&self, proposal: Proposal, signatures: Vec<Signature>);
}

/// Out-of-band state replication for lagging replicas.
pub trait Synchronizer: Send + Sync {
    /// Replicate missed decisions through the application and return the
    /// latest agreed decision this replica now holds.
    fn sync(&self) -> (Proposal, Vec<Signature>);
}
