//! Timer management for the production runner.
//!
//! One-shot timers armed by `Action::SetTimer` are tokio tasks that sleep
//! and feed the corresponding tick event back into the event loop.

use concord_core::{Event, TimerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Manages one-shot timers for the production runner.
///
/// Each timer is a tokio task that sleeps for the specified duration and
/// then sends the appropriate tick event to the event channel.
pub struct TimerManager {
    /// Active timers (id -> task handle).
    timers: HashMap<TimerId, JoinHandle<()>>,
    /// Event sender for timer fires.
    event_tx: mpsc::Sender<Event>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: HashMap::new(),
            event_tx,
        }
    }

    /// Arm a timer. An active timer with the same id is replaced.
    pub fn set_timer(&mut self, id: TimerId, duration: Duration) {
        self.cancel_timer(id);

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            trace!(?id, ?duration, "Timer armed, sleeping");
            tokio::time::sleep(duration).await;
            // A closed channel just means the replica already stopped.
            let _ = event_tx.send(Event::Tick { id }).await;
        });

        self.timers.insert(id, handle);
        debug!(?id, ?duration, "Timer set");
    }

    /// Cancel a timer. A missing or already-fired timer is a no-op.
    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
            debug!(?id, "Timer cancelled");
        }
    }

    /// Cancel all timers. Called during shutdown.
    pub fn cancel_all(&mut self) {
        for (id, handle) in self.timers.drain() {
            handle.abort();
            trace!(?id, "Timer cancelled (shutdown)");
        }
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_fires() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::BatchTimeout, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(100), event_rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert!(matches!(
            event,
            Event::Tick {
                id: TimerId::BatchTimeout
            }
        ));
    }

    #[tokio::test]
    async fn cancelled_timer_stays_silent() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::BatchTimeout, Duration::from_millis(50));
        manager.cancel_timer(TimerId::BatchTimeout);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "timer should have been cancelled");
    }

    #[tokio::test]
    async fn rearming_replaces_the_timer() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::BatchTimeout, Duration::from_millis(100));
        manager.set_timer(TimerId::BatchTimeout, Duration::from_millis(10));
        assert_eq!(manager.active_count(), 1);

        let event = tokio::time::timeout(Duration::from_millis(50), event_rx.recv())
            .await
            .expect("replacement timer should fire quickly")
            .expect("channel closed");
        assert!(matches!(
            event,
            Event::Tick {
                id: TimerId::BatchTimeout
            }
        ));
    }

    #[tokio::test]
    async fn cancel_all_silences_everything() {
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let mut manager = TimerManager::new(event_tx);

        manager.set_timer(TimerId::BatchTimeout, Duration::from_millis(50));
        manager.set_timer(TimerId::PoolTick, Duration::from_millis(50));
        assert_eq!(manager.active_count(), 2);

        manager.cancel_all();
        assert_eq!(manager.active_count(), 0);

        let result = tokio::time::timeout(Duration::from_millis(100), event_rx.recv()).await;
        assert!(result.is_err(), "no timers should have fired");
    }
}
