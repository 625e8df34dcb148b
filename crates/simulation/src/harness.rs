//! The harness application: collaborators for tests and simulation.
//!
//! Mirrors what a minimal embedding supplies: requests are `{id, client}`
//! pairs, a batch is the list of raw requests, signatures carry only the
//! signer identity, and verification accepts everything that decodes —
//! except fingerprints explicitly revoked, which is how the pruning path is
//! exercised.

use concord_bft::commit_envelope;
use concord_core::{
    Assembler, RequestInspector, Signer, VerificationError, Verifier,
};
use concord_types::{NodeId, Proposal, RequestInfo, Signature};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// A test client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRequest {
    pub id: String,
    pub client_id: String,
}

impl TestRequest {
    pub fn new(id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            client_id: client_id.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("request serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        postcard::from_bytes(bytes).ok()
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo::new(self.client_id.clone(), self.id.clone())
    }
}

/// A batch of raw requests, the harness proposal payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub requests: Vec<Vec<u8>>,
}

impl Batch {
    pub fn to_bytes(&self) -> Vec<u8> {
        postcard::to_allocvec(self).expect("batch serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        postcard::from_bytes(bytes).ok()
    }
}

/// The harness collaborators for one replica.
#[derive(Debug)]
pub struct TestApp {
    id: NodeId,
    verification_sequence: AtomicU64,
    revoked: Mutex<HashSet<RequestInfo>>,
}

impl TestApp {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            verification_sequence: AtomicU64::new(0),
            revoked: Mutex::new(HashSet::new()),
        }
    }

    /// Revoke a fingerprint and bump the verification sequence, triggering
    /// the replica's pruning pass after its next delivery.
    pub fn revoke(&self, info: RequestInfo) {
        self.revoked.lock().insert(info);
        self.verification_sequence.fetch_add(1, Ordering::SeqCst);
    }
}

impl RequestInspector for TestApp {
    fn request_id(&self, request: &[u8]) -> RequestInfo {
        TestRequest::from_bytes(request)
            .map(|r| r.info())
            .unwrap_or_else(|| RequestInfo::new("unknown", "unknown"))
    }
}

impl Assembler for TestApp {
    fn assemble_proposal(
        &self,
        metadata: &[u8],
        requests: Vec<Vec<u8>>,
    ) -> (Proposal, Vec<Vec<u8>>) {
        let batch = Batch { requests };
        (
            Proposal {
                payload: batch.to_bytes(),
                metadata: metadata.to_vec(),
                header: vec![],
                verification_sequence: 0,
            },
            vec![],
        )
    }
}

impl Signer for TestApp {
    fn sign(&self, _message: &[u8]) -> Vec<u8> {
        vec![]
    }

    fn sign_proposal(&self, proposal: &Proposal) -> Signature {
        Signature {
            id: self.id,
            value: vec![],
            msg: commit_envelope(proposal),
        }
    }
}

impl Verifier for TestApp {
    fn verify_proposal(&self, proposal: &Proposal) -> Result<Vec<RequestInfo>, VerificationError> {
        let batch = Batch::from_bytes(&proposal.payload)
            .ok_or_else(|| VerificationError::new("malformed batch payload"))?;
        let mut infos = Vec::with_capacity(batch.requests.len());
        for raw in &batch.requests {
            let request = TestRequest::from_bytes(raw)
                .ok_or_else(|| VerificationError::new("malformed request in batch"))?;
            infos.push(request.info());
        }
        Ok(infos)
    }

    fn verify_request(&self, request: &[u8]) -> Result<RequestInfo, VerificationError> {
        let request = TestRequest::from_bytes(request)
            .ok_or_else(|| VerificationError::new("malformed request"))?;
        let info = request.info();
        if self.revoked.lock().contains(&info) {
            return Err(VerificationError::new(format!("request {} revoked", info)));
        }
        Ok(info)
    }

    fn verify_consenter_sig(
        &self,
        _signature: &Signature,
        _proposal: &Proposal,
    ) -> Result<(), VerificationError> {
        Ok(())
    }

    fn verify_signature(&self, _signature: &Signature) -> Result<(), VerificationError> {
        Ok(())
    }

    fn verification_sequence(&self) -> u64 {
        self.verification_sequence.load(Ordering::SeqCst)
    }
}
