//! Clock fan-out.
//!
//! A single clock drives every recurring protocol activity: the pool
//! timeout sweep, heartbeat emission and deadline checks, and view-change
//! re-broadcast. The demultiplexer fans each tick of an injected clock
//! channel into the three corresponding tick events, so an embedding can
//! substitute its own cadence (or a test-driven channel) for the default
//! wall-clock ticker.

use concord_core::{Event, TimerId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Fans one clock into the recurring protocol ticks.
pub struct TickDemultiplexer {
    handle: JoinHandle<()>,
}

impl TickDemultiplexer {
    /// Fan an injected clock channel into the event loop. Each received
    /// tick produces one pool, one heartbeat and one resend tick.
    pub fn spawn(mut clock: mpsc::Receiver<()>, event_tx: mpsc::Sender<Event>) -> Self {
        let handle = tokio::spawn(async move {
            while clock.recv().await.is_some() {
                trace!("Fanning clock tick to consumers");
                for id in [
                    TimerId::PoolTick,
                    TimerId::HeartbeatTick,
                    TimerId::ViewChangeResendTick,
                ] {
                    if event_tx.send(Event::Tick { id }).await.is_err() {
                        return;
                    }
                }
            }
        });
        Self { handle }
    }

    /// Fan a wall-clock ticker with the given period.
    pub fn with_wall_clock(period: Duration, event_tx: mpsc::Sender<Event>) -> Self {
        let (clock_tx, clock_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if clock_tx.send(()).await.is_err() {
                    return;
                }
            }
        });
        Self::spawn(clock_rx, event_tx)
    }

    /// Stop fanning ticks.
    pub fn stop(self) {
        self.handle.abort();
    }
}
