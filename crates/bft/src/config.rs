//! Replica configuration.

use concord_pool::PoolOptions;
use std::time::Duration;

/// Tuning knobs for a replica.
///
/// The recurring tick intervals are honored by the runner, which owns the
/// clock; the timeouts are evaluated by the state machine against the
/// injected time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum requests per batch.
    pub batch_size: usize,
    /// Maximum latency for forming a non-empty batch.
    pub batch_timeout: Duration,
    /// Request pool sizing and per-request timeouts.
    pub pool: PoolOptions,
    /// Cadence of the pool timeout sweep.
    pub pool_tick_interval: Duration,
    /// Cadence of heartbeat emission (leader) and deadline checks (follower).
    pub heartbeat_interval: Duration,
    /// Silence from the leader longer than this raises a complaint.
    pub heartbeat_timeout: Duration,
    /// Cadence of view-change message re-broadcast.
    pub resend_interval: Duration,
    /// A view change attempt older than this escalates to the next view.
    pub view_change_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_millis(500),
            pool: PoolOptions::default(),
            pool_tick_interval: Duration::from_millis(250),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            resend_interval: Duration::from_secs(1),
            view_change_timeout: Duration::from_secs(20),
        }
    }
}
