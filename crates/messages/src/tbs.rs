//! Canonical to-be-signed byte encodings.
//!
//! Signatures never cover a transport serialization; they cover these
//! canonical envelopes so that any framing of the outer message can be
//! re-encoded without invalidating signatures.

use concord_types::Digest;
use serde::{Deserialize, Serialize};

/// The envelope a prepare signature covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TbsPrepare {
    pub view: u64,
    pub seq: u64,
    pub digest: Digest,
}

/// Canonical bytes signed by a [`Prepare`](crate::Prepare).
pub fn prepare_tbs(view: u64, seq: u64, digest: &Digest) -> Vec<u8> {
    postcard::to_allocvec(&TbsPrepare {
        view,
        seq,
        digest: *digest,
    })
    .expect("prepare envelope serialization cannot fail")
}

/// Canonical bytes signed by a [`Commit`](crate::Commit): the proposal digest.
pub fn commit_tbs(digest: &Digest) -> Vec<u8> {
    digest.as_bytes().to_vec()
}
