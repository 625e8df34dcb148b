//! Network messages for the consensus protocol.
//!
//! A single tagged envelope, [`Message`], carries every protocol message a
//! replica can send: the three agreement phases, the view-change exchange,
//! heartbeats, and the state-transfer handshake. The outer serialization of
//! the envelope belongs to the transport; this crate only defines the
//! variants and the canonical to-be-signed byte encodings.

mod consensus;
mod tbs;

pub use consensus::{
    Commit, HeartBeat, HeartBeatResponse, Message, NewView, PrePrepare, Prepare,
    StateTransferRequest, StateTransferResponse, ViewChange, ViewData,
};
pub use tbs::{commit_tbs, prepare_tbs, TbsPrepare};
