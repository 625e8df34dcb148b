//! Log record framing.

use serde::{Deserialize, Serialize};

/// Kind of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// A protocol intent entry (pre-prepare, prepare sent, ...).
    Entry,
    /// A control record; with `truncate_to` set it starts a new log prefix.
    Control,
    /// Integrity checkpoint: digest over the record payloads since the
    /// previous anchor.
    CrcAnchor,
}

/// A single framed log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,
    /// When set on a control record, records before this one are logically
    /// discarded on the next compaction.
    pub truncate_to: bool,
    /// Opaque payload; the consensus layer defines the encoding.
    pub data: Vec<u8>,
}

impl Record {
    /// An entry record.
    pub fn entry(data: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Entry,
            truncate_to: false,
            data,
        }
    }

    /// A control record establishing a new log prefix.
    pub fn truncation(data: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Control,
            truncate_to: true,
            data,
        }
    }

    /// An integrity anchor over the given rolling digest.
    pub fn anchor(digest: [u8; 32]) -> Self {
        Self {
            kind: RecordKind::CrcAnchor,
            truncate_to: false,
            data: digest.to_vec(),
        }
    }
}
