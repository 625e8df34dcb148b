//! Protocol intent entries and restart recovery.
//!
//! Every state-changing protocol action writes its intent to the log before
//! the corresponding message is transmitted. [`restore`] replays the log's
//! final contiguous segment and rebuilds the `(view, sequence, phase)`
//! triple plus any in-flight state, so a restarted replica re-broadcasts
//! instead of equivocating.

use concord_messages::Prepare;
use concord_types::{Digest, Proposal};
use concord_wal::{Record, RecordKind};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A protocol intent persisted ahead of its wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// A proposal was accepted (follower) or created (leader) at
    /// `(view, seq)`. Written before the Pre-Prepare or Prepare leaves.
    PrePrepare {
        view: u64,
        seq: u64,
        proposal: Proposal,
    },
    /// A Prepare for `digest` is about to be broadcast.
    PrepareSent { view: u64, seq: u64, digest: Digest },
    /// A Commit is about to be broadcast; carries the prepare certificate
    /// collected for the digest.
    CommitSent {
        view: u64,
        seq: u64,
        digest: Digest,
        prepares: Vec<Prepare>,
    },
    /// A ViewChange declaration for `next_view` is about to be broadcast.
    ViewChangeSent { next_view: u64 },
    /// A new view was installed, starting at `start_sequence`.
    NewViewInstalled { view: u64, start_sequence: u64 },
    /// A decision was delivered; establishes a new log prefix.
    CheckpointMark { view: u64, sequence: u64 },
}

impl WalEntry {
    /// Encode into a log record. Checkpoint marks become truncation control
    /// records; everything else is an entry.
    pub fn encode(&self) -> Record {
        let data = postcard::to_allocvec(self).expect("log entry serialization cannot fail");
        match self {
            WalEntry::CheckpointMark { .. } => Record::truncation(data),
            _ => Record::entry(data),
        }
    }

    /// Decode a log record. Anchors and unknown payloads yield `None`.
    pub fn decode(record: &Record) -> Option<Self> {
        if record.kind == RecordKind::CrcAnchor {
            return None;
        }
        match postcard::from_bytes(&record.data) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(?err, "Skipping undecodable log record");
                None
            }
        }
    }
}

/// Phase the restored view re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveredPhase {
    /// Nothing in flight; wait for (or create) the next proposal.
    #[default]
    Idle,
    /// A proposal was logged but the Prepare may not have left yet.
    ProposalLogged,
    /// The Prepare was broadcast; resume collecting prepares.
    PrepareBroadcast,
    /// The Commit was broadcast; resume collecting commits.
    CommitBroadcast,
}

/// Consensus state reconstructed from the log on startup.
///
/// Pass to `Controller::new`; use `RecoveredState::default()` for a fresh
/// start.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// View to resume in.
    pub view: u64,
    /// Sequence to resume agreement at.
    pub sequence: u64,
    /// Phase to re-enter at that sequence.
    pub phase: RecoveredPhase,
    /// In-flight proposal, if one was logged.
    pub proposal: Option<Proposal>,
    /// Prepare certificate collected before the crash.
    pub prepares: Vec<Prepare>,
    /// An unfinished view change to resume.
    pub pending_view_change: Option<u64>,
    /// Number of records currently in the log (for truncation bookkeeping).
    pub log_length: usize,
}

/// Rebuild replica state from the log records.
///
/// Sequences restart at the checkpoint mark (the last delivered decision);
/// entries after it walk the phase forward.
pub fn restore(records: &[Record]) -> RecoveredState {
    let mut state = RecoveredState {
        sequence: 1,
        log_length: records.len(),
        ..RecoveredState::default()
    };

    for record in records {
        let Some(entry) = WalEntry::decode(record) else {
            continue;
        };
        match entry {
            WalEntry::CheckpointMark { view, sequence } => {
                state.view = view;
                state.sequence = sequence + 1;
                state.phase = RecoveredPhase::Idle;
                state.proposal = None;
                state.prepares.clear();
            }
            WalEntry::PrePrepare {
                view,
                seq,
                proposal,
            } => {
                state.view = view;
                state.sequence = seq;
                state.phase = RecoveredPhase::ProposalLogged;
                state.proposal = Some(proposal);
                state.prepares.clear();
            }
            WalEntry::PrepareSent { view, seq, .. } => {
                state.view = view;
                state.sequence = seq;
                state.phase = RecoveredPhase::PrepareBroadcast;
            }
            WalEntry::CommitSent {
                view,
                seq,
                prepares,
                ..
            } => {
                state.view = view;
                state.sequence = seq;
                state.phase = RecoveredPhase::CommitBroadcast;
                state.prepares = prepares;
            }
            WalEntry::ViewChangeSent { next_view } => {
                state.pending_view_change = Some(next_view);
            }
            WalEntry::NewViewInstalled {
                view,
                start_sequence,
            } => {
                state.view = view;
                state.sequence = start_sequence;
                state.phase = RecoveredPhase::Idle;
                state.proposal = None;
                state.prepares.clear();
                state.pending_view_change = None;
            }
        }
    }

    state
}
