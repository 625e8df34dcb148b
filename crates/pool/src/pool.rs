//! Bounded request pool with tiered per-request timeouts.

use concord_types::RequestInfo;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The pool is at capacity.
    #[error("request pool is full")]
    PoolFull,
    /// A request with this fingerprint is already pooled.
    #[error("request {0} already pooled")]
    Duplicate(RequestInfo),
}

/// Pool sizing and timeout configuration.
///
/// The stock ratios follow the original tuning: the request timeout is a
/// small fraction of the auto-remove timeout, the leader-forward timeout a
/// larger one.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Maximum number of pooled requests.
    pub capacity: usize,
    /// After this long, the request is forwarded to the current leader.
    pub request_timeout: Duration,
    /// After this long past forwarding, the leader is complained about.
    pub leader_forward_timeout: Duration,
    /// After this long past complaining, the request is silently evicted.
    pub auto_remove_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        let base = Duration::from_secs(10);
        Self {
            capacity: crate::DEFAULT_POOL_CAPACITY,
            request_timeout: base / 100,
            leader_forward_timeout: base / 5,
            auto_remove_timeout: base,
        }
    }
}

/// Timeout stage of a pooled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the request timeout; on expiry, forward to leader.
    AwaitingForward,
    /// Forwarded; on expiry, complain about the leader.
    AwaitingLeader,
    /// Complained; on expiry, evict silently.
    AwaitingRemoval,
}

#[derive(Debug, Clone)]
struct PooledRequest {
    raw: Vec<u8>,
    info: RequestInfo,
    stage: Stage,
    deadline: Duration,
}

/// Everything a pool tick decided.
///
/// The pool does not know the leader's identity or how to reach it; the
/// controller turns `forwards` into sends and `complaints` into a
/// failure-detector complaint.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Requests whose request timeout expired; forward to the leader.
    pub forwards: Vec<Vec<u8>>,
    /// Requests whose leader-forward timeout expired.
    pub complaints: usize,
    /// Requests evicted by the auto-remove timeout.
    pub evicted: Vec<RequestInfo>,
}

/// A bounded ordered multiset of pending requests keyed by fingerprint.
#[derive(Debug)]
pub struct RequestPool {
    options: PoolOptions,
    entries: VecDeque<PooledRequest>,
    index: HashSet<RequestInfo>,
    /// While set, ticks do not advance timeout stages (synchronization in
    /// progress).
    timers_stopped: bool,
}

impl RequestPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            options,
            entries: VecDeque::new(),
            index: HashSet::new(),
            timers_stopped: false,
        }
    }

    /// Number of pooled requests.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Admit a request, arming its timeout chain.
    pub fn submit(
        &mut self,
        raw: Vec<u8>,
        info: RequestInfo,
        now: Duration,
    ) -> Result<(), SubmitError> {
        if self.index.contains(&info) {
            return Err(SubmitError::Duplicate(info));
        }
        if self.entries.len() >= self.options.capacity {
            return Err(SubmitError::PoolFull);
        }

        debug!(request = %info, pool_size = self.entries.len() + 1, "Request pooled");
        self.index.insert(info.clone());
        self.entries.push_back(PooledRequest {
            raw,
            info,
            stage: Stage::AwaitingForward,
            deadline: now + self.options.request_timeout,
        });
        Ok(())
    }

    /// Peek up to `n` requests in insertion order without removing them.
    pub fn next_requests(&self, n: usize) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .take(n)
            .map(|entry| entry.raw.clone())
            .collect()
    }

    /// Remove a delivered request, cancelling its timers.
    pub fn remove_request(&mut self, info: &RequestInfo) -> bool {
        if !self.index.remove(info) {
            return false;
        }
        if let Some(pos) = self.entries.iter().position(|entry| &entry.info == info) {
            self.entries.remove(pos);
        }
        true
    }

    /// Evict every request failing the predicate.
    ///
    /// Used after a verification-sequence bump revokes pooled requests.
    pub fn prune(&mut self, mut keep: impl FnMut(&[u8]) -> bool) {
        let index = &mut self.index;
        self.entries.retain(|entry| {
            if keep(&entry.raw) {
                return true;
            }
            warn!(request = %entry.info, "Evicting revoked request");
            index.remove(&entry.info);
            false
        });
    }

    /// Advance the timeout chain of every pooled request.
    ///
    /// `leading` suppresses forwarding and complaints: the leader has nobody
    /// to forward to or complain about but itself.
    pub fn on_tick(&mut self, now: Duration, leading: bool) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        if self.timers_stopped {
            return outcome;
        }

        let options = &self.options;
        let index = &mut self.index;
        self.entries.retain_mut(|entry| {
            if now < entry.deadline {
                return true;
            }
            match entry.stage {
                Stage::AwaitingForward => {
                    if leading {
                        debug!(request = %entry.info, "Request timeout on the leader, nothing to forward");
                    } else {
                        warn!(request = %entry.info, "Request timeout expired, forwarding to leader");
                        outcome.forwards.push(entry.raw.clone());
                    }
                    entry.stage = Stage::AwaitingLeader;
                    entry.deadline = now + options.leader_forward_timeout;
                    true
                }
                Stage::AwaitingLeader => {
                    if !leading {
                        warn!(request = %entry.info, "Leader-forward timeout expired, complaining about leader");
                        outcome.complaints += 1;
                    }
                    entry.stage = Stage::AwaitingRemoval;
                    entry.deadline = now + options.auto_remove_timeout;
                    true
                }
                Stage::AwaitingRemoval => {
                    warn!(request = %entry.info, "Auto-remove timeout expired, removing from the pool");
                    index.remove(&entry.info);
                    outcome.evicted.push(entry.info.clone());
                    false
                }
            }
        });
        outcome
    }

    /// Re-arm every request's timeout chain from the first stage.
    ///
    /// Called on view change: the new leader deserves a full timeout before
    /// anyone complains about it.
    pub fn restart_timers(&mut self, now: Duration) {
        for entry in &mut self.entries {
            entry.stage = Stage::AwaitingForward;
            entry.deadline = now + self.options.request_timeout;
        }
    }

    /// Freeze timeout processing (synchronization in progress).
    pub fn stop_timers(&mut self) {
        self.timers_stopped = true;
    }

    /// Resume timeout processing, restarting all chains.
    pub fn start_timers(&mut self, now: Duration) {
        self.timers_stopped = false;
        self.restart_timers(now);
    }
}
