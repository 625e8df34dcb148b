//! Leader liveness detection.
//!
//! The leader broadcasts `HeartBeat{view, seq}` on every heartbeat tick.
//! Followers answer with their own position and raise a complaint when the
//! leader goes silent past the timeout. The response traffic doubles as lag
//! detection in both directions: the leader spots followers that fell
//! behind and assists them, and a stale ex-leader learns from corrective
//! responses that the network moved past it.

use concord_core::Action;
use concord_messages::{HeartBeat, HeartBeatResponse, Message, StateTransferResponse};
use concord_types::NodeId;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the monitor decided, beyond the returned actions.
#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    pub actions: Vec<Action>,
    /// Leader silence exceeded the timeout; complain.
    pub complain: bool,
    /// Evidence that this replica is behind; ask the synchronizer.
    pub sync: bool,
}

impl HeartbeatOutcome {
    fn actions(actions: Vec<Action>) -> Self {
        Self {
            actions,
            ..Self::default()
        }
    }
}

/// Per-replica heartbeat state, one for each role.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    self_id: NodeId,
    timeout: Duration,
    /// Last time a valid heartbeat arrived (or the deadline was reset).
    last_heartbeat: Duration,
    /// One complaint per silence; reset by a valid heartbeat or view change.
    complained: bool,
}

impl HeartbeatMonitor {
    pub fn new(self_id: NodeId, timeout: Duration, now: Duration) -> Self {
        Self {
            self_id,
            timeout,
            last_heartbeat: now,
            complained: false,
        }
    }

    /// Heartbeat tick: the leader beacons, a follower checks its deadline.
    pub fn on_tick(&mut self, now: Duration, view: u64, seq: u64, leader: NodeId) -> HeartbeatOutcome {
        if leader == self.self_id {
            return HeartbeatOutcome::actions(vec![Action::Broadcast {
                message: Message::HeartBeat(HeartBeat { view, seq }),
            }]);
        }

        if now.saturating_sub(self.last_heartbeat) > self.timeout && !self.complained {
            warn!(
                %leader,
                view,
                silence = ?now.saturating_sub(self.last_heartbeat),
                "Heartbeat timeout expired, complaining about leader"
            );
            self.complained = true;
            return HeartbeatOutcome {
                complain: true,
                ..HeartbeatOutcome::default()
            };
        }
        HeartbeatOutcome::default()
    }

    /// A heartbeat arrived.
    pub fn on_heartbeat(
        &mut self,
        from: NodeId,
        heartbeat: HeartBeat,
        now: Duration,
        view: u64,
        seq: u64,
        leader: NodeId,
    ) -> HeartbeatOutcome {
        if heartbeat.view == view {
            if from != leader {
                warn!(%from, %leader, "Heartbeat from a non-leader, dropping");
                return HeartbeatOutcome::default();
            }
            self.last_heartbeat = now;
            self.complained = false;

            let mut outcome = HeartbeatOutcome::actions(vec![Action::SendConsensus {
                to: from,
                message: Message::HeartBeatResponse(HeartBeatResponse { view, seq }),
            }]);
            if heartbeat.seq > seq + 1 {
                info!(
                    leader_seq = heartbeat.seq,
                    local_seq = seq,
                    "Sequence gap behind the leader detected, synchronizing"
                );
                outcome.sync = true;
            }
            return outcome;
        }

        if heartbeat.view > view {
            // A leader of a later view exists; catch up rather than complain.
            info!(
                %from,
                heartbeat_view = heartbeat.view,
                local_view = view,
                "Heartbeat from a future view, synchronizing"
            );
            return HeartbeatOutcome {
                sync: true,
                ..HeartbeatOutcome::default()
            };
        }

        // A stale leader is beaconing an old view; answer with where the
        // network actually is so it can catch up.
        debug!(
            %from,
            heartbeat_view = heartbeat.view,
            local_view = view,
            "Correcting heartbeat from an old view"
        );
        HeartbeatOutcome::actions(vec![Action::SendConsensus {
            to: from,
            message: Message::HeartBeatResponse(HeartBeatResponse { view, seq }),
        }])
    }

    /// A heartbeat response arrived.
    pub fn on_heartbeat_response(
        &mut self,
        from: NodeId,
        response: HeartBeatResponse,
        view: u64,
        seq: u64,
        leader: NodeId,
        checkpoint_seq: u64,
    ) -> HeartbeatOutcome {
        if response.view > view {
            info!(
                %from,
                response_view = response.view,
                local_view = view,
                "Response reveals a later view, synchronizing"
            );
            return HeartbeatOutcome {
                sync: true,
                ..HeartbeatOutcome::default()
            };
        }

        if leader == self.self_id && response.view == view && response.seq + 1 < seq {
            debug!(
                %from,
                follower_seq = response.seq,
                local_seq = seq,
                "Follower lagging, sending state-transfer assist"
            );
            return HeartbeatOutcome::actions(vec![Action::SendConsensus {
                to: from,
                message: Message::StateTransferResponse(StateTransferResponse {
                    view_id: view,
                    seq: checkpoint_seq,
                }),
            }]);
        }
        HeartbeatOutcome::default()
    }

    /// A new view was installed; the fresh leader gets a full timeout.
    pub fn view_changed(&mut self, now: Duration) {
        self.last_heartbeat = now;
        self.complained = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn monitor(self_id: u64) -> HeartbeatMonitor {
        HeartbeatMonitor::new(NodeId(self_id), TIMEOUT, Duration::ZERO)
    }

    #[test]
    fn leader_beacons_on_tick() {
        let mut hb = monitor(0);
        let outcome = hb.on_tick(Duration::from_secs(1), 0, 3, NodeId(0));
        assert!(matches!(
            outcome.actions.as_slice(),
            [Action::Broadcast {
                message: Message::HeartBeat(HeartBeat { view: 0, seq: 3 })
            }]
        ));
        assert!(!outcome.complain);
    }

    #[test]
    fn follower_complains_once_after_timeout() {
        let mut hb = monitor(1);
        let outcome = hb.on_tick(Duration::from_secs(4), 0, 1, NodeId(0));
        assert!(!outcome.complain);

        let outcome = hb.on_tick(Duration::from_secs(6), 0, 1, NodeId(0));
        assert!(outcome.complain);

        // No complaint storm.
        let outcome = hb.on_tick(Duration::from_secs(8), 0, 1, NodeId(0));
        assert!(!outcome.complain);
    }

    #[test]
    fn heartbeat_resets_the_deadline() {
        let mut hb = monitor(1);
        hb.on_heartbeat(
            NodeId(0),
            HeartBeat { view: 0, seq: 1 },
            Duration::from_secs(4),
            0,
            1,
            NodeId(0),
        );
        let outcome = hb.on_tick(Duration::from_secs(8), 0, 1, NodeId(0));
        assert!(!outcome.complain);
    }

    #[test]
    fn heartbeat_from_non_leader_is_dropped() {
        let mut hb = monitor(1);
        let outcome = hb.on_heartbeat(
            NodeId(2),
            HeartBeat { view: 0, seq: 1 },
            Duration::ZERO,
            0,
            1,
            NodeId(0),
        );
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn sequence_gap_triggers_sync_not_complaint() {
        let mut hb = monitor(3);
        let outcome = hb.on_heartbeat(
            NodeId(0),
            HeartBeat { view: 0, seq: 11 },
            Duration::ZERO,
            0,
            1,
            NodeId(0),
        );
        assert!(outcome.sync);
        assert!(!outcome.complain);
    }

    #[test]
    fn future_view_heartbeat_triggers_sync() {
        let mut hb = monitor(0);
        let outcome = hb.on_heartbeat(
            NodeId(1),
            HeartBeat { view: 1, seq: 2 },
            Duration::ZERO,
            0,
            2,
            NodeId(0),
        );
        assert!(outcome.sync);
    }

    #[test]
    fn stale_leader_gets_corrected() {
        // We are in view 1; the old leader n0 still beacons view 0.
        let mut hb = monitor(2);
        let outcome = hb.on_heartbeat(
            NodeId(0),
            HeartBeat { view: 0, seq: 2 },
            Duration::ZERO,
            1,
            5,
            NodeId(1),
        );
        assert!(matches!(
            outcome.actions.as_slice(),
            [Action::SendConsensus {
                to: NodeId(0),
                message: Message::HeartBeatResponse(HeartBeatResponse { view: 1, seq: 5 })
            }]
        ));
    }

    #[test]
    fn leader_assists_lagging_follower() {
        let mut hb = monitor(0);
        let outcome = hb.on_heartbeat_response(
            NodeId(3),
            HeartBeatResponse { view: 0, seq: 1 },
            0,
            11,
            NodeId(0),
            10,
        );
        assert!(matches!(
            outcome.actions.as_slice(),
            [Action::SendConsensus {
                to: NodeId(3),
                message: Message::StateTransferResponse(StateTransferResponse {
                    view_id: 0,
                    seq: 10
                })
            }]
        ));
    }

    #[test]
    fn response_from_future_view_triggers_sync() {
        let mut hb = monitor(0);
        let outcome = hb.on_heartbeat_response(
            NodeId(1),
            HeartBeatResponse { view: 1, seq: 3 },
            0,
            1,
            NodeId(0),
            0,
        );
        assert!(outcome.sync);
    }
}
