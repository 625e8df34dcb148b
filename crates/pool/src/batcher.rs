//! Batch formation over the request pool.

use crate::RequestPool;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Result of a batch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A batch is ready to propose.
    Ready(Vec<Vec<u8>>),
    /// Requests are pooled but the batch is not full yet.
    Waiting {
        /// Set when this attempt armed the batch timeout; the caller should
        /// schedule a timer for `deadline`.
        deadline_armed: bool,
        deadline: Duration,
    },
    /// Nothing to batch.
    Empty,
}

/// Cuts batches from the pool front.
///
/// A batch is cut when `batch_size` requests are available, or when
/// `batch_timeout` has elapsed since the first request of a non-empty batch
/// attempt. The remainder returned by the assembler goes back to the front,
/// preserving order.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    batch_timeout: Duration,
    remainder: Vec<Vec<u8>>,
    deadline: Option<Duration>,
}

impl Batcher {
    pub fn new(batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            remainder: Vec::new(),
            deadline: None,
        }
    }

    /// Attempt to cut the next batch.
    ///
    /// Front of the batch is the assembler remainder from the previous
    /// proposal, then the pool front; duplicates between the two are
    /// dropped.
    pub fn next_batch(&mut self, pool: &RequestPool, now: Duration) -> BatchOutcome {
        let mut batch = self.remainder.clone();
        let seen: HashSet<Vec<u8>> = batch.iter().cloned().collect();
        for raw in pool.next_requests(self.batch_size) {
            if batch.len() >= self.batch_size {
                break;
            }
            if seen.contains(&raw) {
                continue;
            }
            batch.push(raw);
        }

        if batch.is_empty() {
            self.deadline = None;
            return BatchOutcome::Empty;
        }

        if batch.len() >= self.batch_size {
            debug!(size = batch.len(), "Batch full");
            self.remainder.clear();
            self.deadline = None;
            return BatchOutcome::Ready(batch);
        }

        match self.deadline {
            Some(deadline) if now >= deadline => {
                debug!(size = batch.len(), "Batch timeout elapsed, cutting partial batch");
                self.remainder.clear();
                self.deadline = None;
                BatchOutcome::Ready(batch)
            }
            Some(deadline) => BatchOutcome::Waiting {
                deadline_armed: false,
                deadline,
            },
            None => {
                let deadline = now + self.batch_timeout;
                self.deadline = Some(deadline);
                BatchOutcome::Waiting {
                    deadline_armed: true,
                    deadline,
                }
            }
        }
    }

    /// Push unproposed requests back to the front, preserving order.
    pub fn batch_remainder(&mut self, mut remainder: Vec<Vec<u8>>) {
        remainder.extend(self.remainder.drain(..));
        self.remainder = remainder;
    }

    /// Take the current remainder out of the batcher.
    pub fn pop_remainder(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.remainder)
    }

    /// Clear any remainder and pending deadline (view change).
    pub fn reset(&mut self) {
        self.remainder.clear();
        self.deadline = None;
    }
}
