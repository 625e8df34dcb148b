//! File-backed log.
//!
//! On-disk layout is a sequence of frames:
//!
//! ```text
//! [len: u32 LE] [checksum: 8 bytes] [payload: len bytes]
//! ```
//!
//! The payload is the postcard encoding of a [`Record`]; the checksum is the
//! first 8 bytes of the payload's Blake3 hash. Every `ANCHOR_INTERVAL`
//! appends, a [`RecordKind::CrcAnchor`] record is inserted carrying the
//! rolling digest of all payloads since the previous anchor. On open, the
//! longest valid prefix is kept: a torn tail frame, a checksum mismatch or a
//! disagreeing anchor truncates the log at that point.

use crate::{Record, RecordKind, WalError, WriteAheadLog};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Appends between automatic integrity anchors.
const ANCHOR_INTERVAL: usize = 64;

/// Frame header size: length prefix plus checksum.
const FRAME_HEADER: usize = 4 + 8;

/// File-backed write-ahead log.
pub struct FileWal {
    path: PathBuf,
    file: File,
    /// Mirror of the logical records (anchors excluded).
    records: Vec<Record>,
    /// Rolling digest of payloads since the last anchor.
    rolling: blake3::Hasher,
    /// Appends since the last anchor.
    since_anchor: usize,
}

impl FileWal {
    /// Open the log at `path`, creating it if missing.
    ///
    /// A corrupt or torn tail is discarded with a warning; everything before
    /// it is kept.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (records, valid_len, rolling, since_anchor) = scan(&raw);
        if valid_len < raw.len() {
            warn!(
                path = %path.display(),
                valid_len,
                file_len = raw.len(),
                "Discarding corrupt log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }

        debug!(path = %path.display(), records = records.len(), "Opened write-ahead log");

        Ok(Self {
            path,
            file,
            records,
            rolling,
            since_anchor,
        })
    }

    fn write_frame(&mut self, record: &Record) -> Result<(), WalError> {
        let payload = postcard::to_allocvec(record)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&checksum(&payload));
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl WriteAheadLog for FileWal {
    fn append(&mut self, record: Record) -> Result<(), WalError> {
        let payload = postcard::to_allocvec(&record)?;
        self.rolling.update(&payload);
        self.write_frame(&record)?;
        self.records.push(record);

        self.since_anchor += 1;
        if self.since_anchor >= ANCHOR_INTERVAL {
            let digest = *self.rolling.finalize().as_bytes();
            let anchor = Record::anchor(digest);
            self.write_frame(&anchor)?;
            self.rolling = blake3::Hasher::new();
            self.since_anchor = 0;
        }
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

        // Rewrite the suffix into a sibling file, then swap it in.
        let compact_path = self.path.with_extension("compact");
        let kept: Vec<Record> = self.records[index..].to_vec();
        {
            let mut compact = File::create(&compact_path)?;
            for record in &kept {
                let payload = postcard::to_allocvec(record)?;
                let mut frame = Vec::with_capacity(FRAME_HEADER + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                frame.extend_from_slice(&checksum(&payload));
                frame.extend_from_slice(&payload);
                compact.write_all(&frame)?;
            }
            compact.sync_data()?;
        }
        std::fs::rename(&compact_path, &self.path)?;

        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.records = kept;
        self.rolling = blake3::Hasher::new();
        self.since_anchor = 0;
        for record in &self.records {
            let payload = postcard::to_allocvec(record)?;
            self.rolling.update(&payload);
            self.since_anchor += 1;
        }
        Ok(())
    }
}

/// First 8 bytes of the payload's Blake3 hash.
fn checksum(payload: &[u8]) -> [u8; 8] {
    let digest = blake3::hash(payload);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    out
}

/// Scan raw file bytes, returning the valid records, the byte length of the
/// valid prefix, and the rolling digest state after it.
fn scan(raw: &[u8]) -> (Vec<Record>, usize, blake3::Hasher, usize) {
    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut valid_len = 0usize;
    let mut rolling = blake3::Hasher::new();
    let mut since_anchor = 0usize;

    while raw.len() - offset >= FRAME_HEADER {
        let len = u32::from_le_bytes(raw[offset..offset + 4].try_into().unwrap()) as usize;
        let frame_end = offset + FRAME_HEADER + len;
        if frame_end > raw.len() {
            break; // torn tail
        }
        let stored: [u8; 8] = raw[offset + 4..offset + 12].try_into().unwrap();
        let payload = &raw[offset + FRAME_HEADER..frame_end];
        if checksum(payload) != stored {
            break;
        }
        let record: Record = match postcard::from_bytes(payload) {
            Ok(r) => r,
            Err(_) => break,
        };

        match record.kind {
            RecordKind::CrcAnchor => {
                let expected = *rolling.finalize().as_bytes();
                if record.data != expected {
                    break;
                }
                rolling.reset();
                since_anchor = 0;
            }
            _ => {
                rolling.update(payload);
                since_anchor += 1;
                records.push(record);
            }
        }

        offset = frame_end;
        valid_len = offset;
    }

    (records, valid_len, rolling, since_anchor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_replays_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let mut wal = FileWal::open(&path).unwrap();
            for i in 0..10u8 {
                wal.append(Record::entry(vec![i; 3])).unwrap();
            }
        }

        let wal = FileWal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(records[7].data, vec![7; 3]);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.append(Record::entry(vec![1])).unwrap();
            wal.append(Record::entry(vec![2])).unwrap();
        }

        // Chop bytes off the final frame.
        let raw = std::fs::read(&path).unwrap();
        std::fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let wal = FileWal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, vec![1]);
    }

    #[test]
    fn corrupt_payload_truncates_from_there() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let mut wal = FileWal::open(&path).unwrap();
            wal.append(Record::entry(vec![1])).unwrap();
            wal.append(Record::entry(vec![2])).unwrap();
            wal.append(Record::entry(vec![3])).unwrap();
        }

        // Flip a byte inside the second frame's payload.
        let mut raw = std::fs::read(&path).unwrap();
        let second_frame_payload = FRAME_HEADER + postcard_len(&Record::entry(vec![1])) + FRAME_HEADER + 1;
        raw[second_frame_payload] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        let wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn truncation_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let mut wal = FileWal::open(&path).unwrap();
            for i in 0..6u8 {
                wal.append(Record::entry(vec![i])).unwrap();
            }
            wal.truncate_to(4).unwrap();
            wal.append(Record::entry(vec![9])).unwrap();
        }

        let wal = FileWal::open(&path).unwrap();
        let records = wal.read_all().unwrap();
        let datas: Vec<u8> = records.iter().map(|r| r.data[0]).collect();
        assert_eq!(datas, vec![4, 5, 9]);
    }

    #[test]
    fn anchors_written_and_verified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.wal");

        {
            let mut wal = FileWal::open(&path).unwrap();
            for i in 0..(ANCHOR_INTERVAL + 5) {
                wal.append(Record::entry(vec![i as u8])).unwrap();
            }
        }

        let wal = FileWal::open(&path).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), ANCHOR_INTERVAL + 5);
    }

    fn postcard_len(record: &Record) -> usize {
        postcard::to_allocvec(record).unwrap().len()
    }
}
