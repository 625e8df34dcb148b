//! Write-ahead log for concord consensus.
//!
//! Every state-changing protocol action persists an intent record **before**
//! the corresponding wire message is transmitted. On restart the newest
//! contiguous valid prefix is replayed so a replica re-enters the exact
//! protocol state it crashed in and re-broadcasts rather than equivocates.
//!
//! The crate provides:
//!
//! - [`Record`]: the framed unit of the log (`Entry`, `Control` or
//!   [`CrcAnchor`](RecordKind::CrcAnchor))
//! - [`WriteAheadLog`]: the trait replicas write through
//! - [`MemoryWal`]: in-memory log for tests and simulation
//! - [`FileWal`]: file-backed log with per-record checksums and periodic
//!   integrity anchors
//!
//! Log contents are opaque bytes here; the consensus crate defines what an
//! entry encodes.

mod file;
mod memory;
mod record;

pub use file::FileWal;
pub use memory::MemoryWal;
pub use record::{Record, RecordKind};

/// Errors from log I/O.
///
/// Append and truncation failures are fatal to a replica: the owner is
/// expected to crash and restart from disk truth rather than proceed with
/// unpersisted state.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("log record serialization failed: {0}")]
    Encoding(#[from] postcard::Error),
    #[error("truncation index {index} out of range (len {len})")]
    TruncateOutOfRange { index: usize, len: usize },
}

/// Append-only log of framed records.
///
/// Implementations are single-writer; the owning replica serializes access.
pub trait WriteAheadLog: Send {
    /// Append a record and make it durable before returning.
    fn append(&mut self, record: Record) -> Result<(), WalError>;

    /// All records of the current logical log, oldest first.
    fn read_all(&self) -> Result<Vec<Record>, WalError>;

    /// Establish a new log prefix: records before `index` are discarded.
    fn truncate_to(&mut self, index: usize) -> Result<(), WalError>;
}
