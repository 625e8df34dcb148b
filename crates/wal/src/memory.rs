//! In-memory log for tests and simulation.

use crate::{Record, WalError, WriteAheadLog};

/// A log that lives in memory.
///
/// Survives a simulated restart when the harness keeps it around, which is
/// exactly what the crash-recovery tests rely on.
#[derive(Debug, Clone, Default)]
pub struct MemoryWal {
    records: Vec<Record>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in the current logical log.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl WriteAheadLog for MemoryWal {
    fn append(&mut self, record: Record) -> Result<(), WalError> {
        self.records.push(record);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<Record>, WalError> {
        Ok(self.records.clone())
    }

    fn truncate_to(&mut self, index: usize) -> Result<(), WalError> {
        if index > self.records.len() {
            return Err(WalError::TruncateOutOfRange {
                index,
                len: self.records.len(),
            });
        }
        self.records.drain(..index);
        Ok(())
    }
}
