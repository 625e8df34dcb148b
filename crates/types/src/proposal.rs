//! Proposals, signatures and view metadata.

use crate::{Digest, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error decoding a serialized [`ViewMetadata`].
#[derive(Debug, thiserror::Error)]
#[error("malformed view metadata: {0}")]
pub struct MetadataError(#[from] postcard::Error);

/// Fingerprint of a client request, provided by the request inspector.
///
/// Two submissions with the same fingerprint are the same request; the
/// second one is rejected while the first is still pooled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestInfo {
    /// Identity of the submitting client.
    pub client_id: String,
    /// Client-scoped request identifier.
    pub id: String,
}

impl RequestInfo {
    /// Create a request fingerprint.
    pub fn new(client_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_id, self.id)
    }
}

/// Consensus metadata stamped into every proposal by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    /// View under which the proposal was created.
    pub view_id: u64,
    /// Sequence number of the proposal.
    pub latest_sequence: u64,
    /// Number of decisions delivered so far in this view.
    pub decisions_in_view: u64,
}

impl ViewMetadata {
    /// Canonical byte encoding, embedded in [`Proposal::metadata`].
    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("view metadata serialization cannot fail")
    }

    /// Decode metadata previously produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// A batch of requests assembled by the application, under agreement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Application payload (assembler output).
    pub payload: Vec<u8>,
    /// Encoded [`ViewMetadata`].
    pub metadata: Vec<u8>,
    /// Application-defined header.
    pub header: Vec<u8>,
    /// Verification sequence the proposal was assembled under.
    pub verification_sequence: u64,
}

impl Proposal {
    /// Deterministic digest over all four fields.
    pub fn digest(&self) -> Digest {
        Digest::from_parts(&[
            &self.payload,
            &self.metadata,
            &self.header,
            &self.verification_sequence.to_le_bytes(),
        ])
    }

    /// Decode the embedded view metadata.
    pub fn view_metadata(&self) -> Result<ViewMetadata, MetadataError> {
        ViewMetadata::decode(&self.metadata)
    }
}

/// A consenter's signature over a proposal or prepare envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The signing node.
    pub id: NodeId,
    /// Opaque signature bytes.
    pub value: Vec<u8>,
    /// The to-be-signed envelope the signature covers.
    pub msg: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let md = ViewMetadata {
            view_id: 3,
            latest_sequence: 17,
            decisions_in_view: 5,
        };
        let decoded = ViewMetadata::decode(&md.encode()).unwrap();
        assert_eq!(md, decoded);
    }

    #[test]
    fn metadata_decode_rejects_garbage() {
        assert!(ViewMetadata::decode(&[0xFF; 40]).is_err());
    }

    #[test]
    fn digest_covers_every_field() {
        let base = Proposal {
            payload: b"payload".to_vec(),
            metadata: b"metadata".to_vec(),
            header: b"header".to_vec(),
            verification_sequence: 1,
        };
        let mut other = base.clone();
        other.verification_sequence = 2;
        assert_ne!(base.digest(), other.digest());

        let mut other = base.clone();
        other.header = b"header2".to_vec();
        assert_ne!(base.digest(), other.digest());
    }
}
