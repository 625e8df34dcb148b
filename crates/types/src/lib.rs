//! Core types for concord total-order broadcast.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: [`Digest`], [`NodeId`]
//! - **Agreement types**: [`Proposal`], [`Signature`], [`ViewMetadata`],
//!   [`Checkpoint`], [`RequestInfo`]
//! - **Quorum math**: [`compute_quorum`], [`leader_for_view`]
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod checkpoint;
mod digest;
mod proposal;
mod quorum;

pub use checkpoint::Checkpoint;
pub use digest::Digest;
pub use proposal::{MetadataError, Proposal, RequestInfo, Signature, ViewMetadata};
pub use quorum::{compute_quorum, leader_for_view};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a replica, as presented by the transport.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}
