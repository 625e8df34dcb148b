//! Leader-failure protocol.
//!
//! Complaints (request timeouts, heartbeat loss, synchronizer hints) start a
//! view change. Every replica declares `ViewChange{next_view}` and sends its
//! state snapshot (`ViewData`) to the prospective leader; once a quorum of
//! declarations exists, the prospective leader assembles a `NewView` from a
//! quorum of snapshots and everyone installs it. The snapshot exchange is
//! what lets an in-flight proposal with a prepare certificate survive the
//! transition.
//!
//! Per attempted next view the state machine is:
//!
//! ```text
//! Normal ──complaint──► ViewChangeSent ──Q ViewChanges──► (new leader: assemble NewView;
//!                                                          follower: AwaitingNewView)
//!                                              │
//!                                              └── matching NewView ──► installed
//! ```
//!
//! Outstanding declarations are re-broadcast on every resend tick, and an
//! attempt that outlives the view-change timeout escalates to the next view
//! (the prospective leader may be faulty too).

use crate::persist::WalEntry;
use crate::view::InFlightProposal;
use crate::vote_set::VoteSet;
use concord_core::{Action, Event, Verifier};
use concord_messages::{
    Message, NewView, StateTransferRequest, StateTransferResponse, ViewChange, ViewData,
};
use concord_types::{leader_for_view, Checkpoint, NodeId, Proposal, ViewMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phase of the current view-change attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VcPhase {
    /// No view change in progress.
    Normal,
    /// Our declaration is out; collecting a quorum.
    ViewChangeSent,
    /// Quorum reached; waiting for the new leader's announcement.
    AwaitingNewView,
}

/// What the view changer decided, beyond the returned actions.
#[derive(Debug, Default)]
pub struct ViewChangerOutcome {
    pub actions: Vec<Action>,
    /// `f + 1` peers agree we are behind; ask the synchronizer.
    pub sync: bool,
}

impl ViewChangerOutcome {
    fn actions(actions: Vec<Action>) -> Self {
        Self {
            actions,
            sync: false,
        }
    }
}

/// The view-change state machine.
pub struct ViewChanger {
    self_id: NodeId,
    nodes: Vec<NodeId>,
    quorum: usize,
    f: usize,
    view_change_timeout: Duration,

    current_view: u64,
    phase: VcPhase,
    /// The view this attempt targets (meaningful outside `Normal`).
    next_view: u64,
    /// When the current attempt started, for escalation.
    attempt_started: Duration,

    /// ViewChange declarations per candidate view.
    tallies: BTreeMap<u64, VoteSet<ViewChange>>,
    /// ViewData snapshots per candidate view (as its prospective leader).
    collected_data: BTreeMap<u64, VoteSet<ViewData>>,
    /// Our outstanding declaration, re-broadcast on resend ticks.
    last_vote: Option<(ViewChange, ViewData)>,

    /// A NewView whose installation waits on catch-up.
    pending_new_view: Option<NewView>,
    /// A StateTransferRequest is outstanding.
    state_transfer_pending: bool,
    /// Checkpoint positions reported by peers, keyed by `(view, seq)`.
    sync_responses: BTreeMap<(u64, u64), VoteSet<StateTransferResponse>>,

    verifier: Arc<dyn Verifier>,
}

impl std::fmt::Debug for ViewChanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewChanger")
            .field("self_id", &self.self_id)
            .field("current_view", &self.current_view)
            .field("phase", &self.phase)
            .field("next_view", &self.next_view)
            .finish()
    }
}

impl ViewChanger {
    pub fn new(
        self_id: NodeId,
        nodes: Vec<NodeId>,
        quorum: usize,
        f: usize,
        view_change_timeout: Duration,
        current_view: u64,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            self_id,
            nodes,
            quorum,
            f,
            view_change_timeout,
            current_view,
            phase: VcPhase::Normal,
            next_view: current_view,
            attempt_started: Duration::ZERO,
            tallies: BTreeMap::new(),
            collected_data: BTreeMap::new(),
            last_vote: None,
            pending_new_view: None,
            state_transfer_pending: false,
            sync_responses: BTreeMap::new(),
            verifier,
        }
    }

    pub fn current_view(&self) -> u64 {
        self.current_view
    }

    /// Whether a view change is in progress.
    pub fn changing(&self) -> bool {
        self.phase != VcPhase::Normal
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Complaints
    // ═══════════════════════════════════════════════════════════════════════

    /// A complaint from any subsystem: start changing to the next view.
    ///
    /// While an attempt is in progress further complaints are absorbed; the
    /// resend ticker keeps the attempt alive and escalates it.
    pub fn start_view_change(
        &mut self,
        reason: &str,
        now: Duration,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
    ) -> Vec<Action> {
        if self.phase != VcPhase::Normal {
            debug!(
                next_view = self.next_view,
                reason, "Complaint while a view change is already in progress"
            );
            return vec![];
        }
        self.start_attempt(self.current_view + 1, reason, now, checkpoint, in_flight, true)
    }

    /// Resume a view-change declaration found in the log after a restart.
    pub fn resume_view_change(
        &mut self,
        next_view: u64,
        now: Duration,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
    ) -> Vec<Action> {
        self.start_attempt(
            next_view,
            "resuming view change from the log",
            now,
            checkpoint,
            in_flight,
            false,
        )
    }

    fn start_attempt(
        &mut self,
        target: u64,
        reason: &str,
        now: Duration,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
        persist: bool,
    ) -> Vec<Action> {
        if target <= self.current_view {
            return vec![];
        }

        info!(
            current_view = self.current_view,
            next_view = target,
            reason,
            "Starting view change"
        );

        self.phase = VcPhase::ViewChangeSent;
        self.next_view = target;
        self.attempt_started = now;

        let declaration = ViewChange {
            next_view: target,
            reason: reason.to_string(),
        };
        let data = self.build_view_data(target, checkpoint, in_flight);

        self.tallies
            .entry(target)
            .or_default()
            .register(self.self_id, declaration.clone());
        self.last_vote = Some((declaration.clone(), data.clone()));

        let mut actions = Vec::new();
        if persist {
            actions.push(Action::Persist {
                record: WalEntry::ViewChangeSent { next_view: target }.encode(),
            });
        }
        actions.push(Action::Broadcast {
            message: Message::ViewChange(declaration),
        });

        let new_leader = leader_for_view(&self.nodes, target);
        if new_leader == self.self_id {
            self.collected_data
                .entry(target)
                .or_default()
                .register(self.self_id, data);
        } else {
            actions.push(Action::SendConsensus {
                to: new_leader,
                message: Message::ViewData(data),
            });
        }

        // Peers may already have put this view over the top.
        actions.extend(self.try_advance(checkpoint));
        actions
    }

    fn build_view_data(
        &self,
        target: u64,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
    ) -> ViewData {
        let (last_decision, last_decision_signatures) = checkpoint.get();
        let undelivered = in_flight.filter(|candidate| {
            candidate
                .proposal
                .view_metadata()
                .map(|md| md.latest_sequence > checkpoint.sequence())
                .unwrap_or(false)
        });
        ViewData {
            next_view: target,
            last_decision,
            last_decision_signatures,
            in_flight: undelivered.map(|c| c.proposal.clone()),
            in_flight_prepares: undelivered
                .map(|c| c.prepares.clone())
                .unwrap_or_default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Declarations and snapshots
    // ═══════════════════════════════════════════════════════════════════════

    /// A ViewChange declaration arrived.
    pub fn on_view_change(
        &mut self,
        sender: NodeId,
        declaration: ViewChange,
        now: Duration,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
    ) -> Vec<Action> {
        let target = declaration.next_view;
        if target <= self.current_view {
            debug!(%sender, target, current = self.current_view, "Stale ViewChange, dropping");
            return vec![];
        }
        if !self.nodes.contains(&sender) {
            warn!(%sender, "ViewChange from a non-member, dropping");
            return vec![];
        }

        self.tallies
            .entry(target)
            .or_default()
            .register(sender, declaration);

        let mut actions = Vec::new();

        // f + 1 distinct declarations for a view beyond our attempt mean a
        // quorum is already moving; adopt it rather than stay behind.
        let attempted = if self.phase == VcPhase::Normal {
            self.current_view
        } else {
            self.next_view
        };
        let tally = self.tallies.get(&target).map(VoteSet::count).unwrap_or(0);
        if target > attempted && tally > self.f {
            info!(
                target,
                tally,
                "Adopting view change already in motion"
            );
            actions.extend(self.start_attempt(
                target,
                "catching up to a moving quorum",
                now,
                checkpoint,
                in_flight,
                true,
            ));
            return actions;
        }

        actions.extend(self.try_advance(checkpoint));
        actions
    }

    /// A ViewData snapshot arrived (we are its prospective leader).
    pub fn on_view_data(&mut self, sender: NodeId, data: ViewData, checkpoint: &Checkpoint) -> Vec<Action> {
        let target = data.next_view;
        if target <= self.current_view {
            return vec![];
        }
        if leader_for_view(&self.nodes, target) != self.self_id {
            warn!(%sender, target, "ViewData addressed to the wrong leader, dropping");
            return vec![];
        }
        if !self.nodes.contains(&sender) {
            warn!(%sender, "ViewData from a non-member, dropping");
            return vec![];
        }
        for signature in &data.last_decision_signatures {
            if let Err(err) = self.verifier.verify_signature(signature) {
                warn!(%sender, error = %err, "ViewData carries an invalid signature, dropping");
                return vec![];
            }
        }

        self.collected_data
            .entry(target)
            .or_default()
            .register(sender, data);

        self.try_advance(checkpoint)
    }

    /// Advance the attempt once declarations (and, as leader, snapshots)
    /// reach a quorum.
    fn try_advance(&mut self, checkpoint: &Checkpoint) -> Vec<Action> {
        if self.phase != VcPhase::ViewChangeSent {
            return vec![];
        }
        let target = self.next_view;
        let tally = self.tallies.get(&target).map(VoteSet::count).unwrap_or(0);
        if tally < self.quorum {
            return vec![];
        }

        if leader_for_view(&self.nodes, target) != self.self_id {
            debug!(target, tally, "Declaration quorum reached, awaiting NewView");
            self.phase = VcPhase::AwaitingNewView;
            return vec![];
        }

        let snapshots = self
            .collected_data
            .get(&target)
            .map(VoteSet::count)
            .unwrap_or(0);
        if snapshots < self.quorum {
            debug!(
                target,
                snapshots,
                quorum = self.quorum,
                "Declaration quorum reached, awaiting more snapshots"
            );
            return vec![];
        }

        // Assemble and announce the new view.
        let entries: Vec<(NodeId, ViewData)> = self
            .collected_data
            .get(&target)
            .expect("snapshots counted above")
            .iter()
            .map(|(id, data)| (id, data.clone()))
            .collect();
        let announcement = NewView {
            view: target,
            view_data: entries.clone(),
        };

        info!(view = target, snapshots, "Announcing new view");

        let mut actions = vec![Action::Broadcast {
            message: Message::NewView(announcement.clone()),
        }];
        actions.extend(self.install_from(announcement, checkpoint.sequence()));
        actions
    }

    /// A NewView announcement arrived.
    pub fn on_new_view(
        &mut self,
        sender: NodeId,
        announcement: NewView,
        checkpoint: &Checkpoint,
    ) -> Vec<Action> {
        let view = announcement.view;
        if view <= self.current_view {
            debug!(%sender, view, "Stale NewView, dropping");
            return vec![];
        }
        if sender != leader_for_view(&self.nodes, view) {
            warn!(%sender, view, "NewView from a non-leader, dropping");
            return vec![];
        }

        let mut seen = std::collections::BTreeSet::new();
        for (id, data) in &announcement.view_data {
            if data.next_view != view || !self.nodes.contains(id) {
                warn!(%sender, view, "NewView carries a foreign snapshot, dropping");
                return vec![];
            }
            seen.insert(*id);
        }
        if seen.len() < self.quorum {
            warn!(
                %sender,
                view,
                snapshots = seen.len(),
                quorum = self.quorum,
                "NewView lacks a snapshot quorum, dropping"
            );
            return vec![];
        }

        self.install_from(announcement, checkpoint.sequence())
    }

    /// Install a validated NewView, or pend it behind catch-up when our
    /// checkpoint is behind the sequence the announcement implies.
    fn install_from(&mut self, announcement: NewView, own_checkpoint_seq: u64) -> Vec<Action> {
        let view = announcement.view;
        let max_checkpoint = announcement
            .view_data
            .iter()
            .map(|(_, data)| {
                data.last_decision
                    .view_metadata()
                    .map(|md| md.latest_sequence)
                    .unwrap_or(0)
            })
            .max()
            .unwrap_or(0);

        if own_checkpoint_seq < max_checkpoint {
            info!(
                view,
                own_checkpoint_seq,
                max_checkpoint,
                "Behind the new view's checkpoint, catching up first"
            );
            self.pending_new_view = Some(announcement);
            let mut actions = Vec::new();
            if !self.state_transfer_pending {
                self.state_transfer_pending = true;
                actions.push(Action::Broadcast {
                    message: Message::StateTransferRequest(StateTransferRequest {}),
                });
            }
            return actions;
        }

        let in_flight = self.select_in_flight(&announcement.view_data, max_checkpoint);
        let start_sequence = max_checkpoint + 1;

        info!(
            view,
            start_sequence,
            re_proposal = in_flight.is_some(),
            "Installing new view"
        );

        vec![
            Action::Persist {
                record: WalEntry::NewViewInstalled {
                    view,
                    start_sequence,
                }
                .encode(),
            },
            Action::EnqueueInternal {
                event: Event::ViewChangeCompleted {
                    view,
                    start_sequence,
                    in_flight,
                },
            },
        ]
    }

    /// The in-flight proposal that survives the view change: the highest
    /// sequence backed by a valid prepare certificate, ties broken by the
    /// highest view.
    fn select_in_flight(
        &self,
        entries: &[(NodeId, ViewData)],
        max_checkpoint: u64,
    ) -> Option<Proposal> {
        let mut best: Option<(u64, u64, Proposal)> = None;

        for (_, data) in entries {
            let Some(proposal) = &data.in_flight else {
                continue;
            };
            let Ok(md) = proposal.view_metadata() else {
                continue;
            };
            // Already covered by a checkpoint: nothing to carry over.
            if md.latest_sequence != max_checkpoint + 1 {
                continue;
            }
            let digest = proposal.digest();
            let certified = data
                .in_flight_prepares
                .iter()
                .filter(|(signer, prepare)| {
                    self.nodes.contains(*signer)
                        && prepare.signature.id == **signer
                        && prepare.view == md.view_id
                        && prepare.seq == md.latest_sequence
                        && prepare.digest == digest
                        && self.verifier.verify_signature(&prepare.signature).is_ok()
                })
                .count();
            if certified < self.quorum {
                continue;
            }

            let candidate = (md.latest_sequence, md.view_id, proposal.clone());
            let better = match &best {
                None => true,
                Some((seq, view, _)) => {
                    (candidate.0, candidate.1) > (*seq, *view)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|(_, _, proposal)| proposal)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resend and escalation
    // ═══════════════════════════════════════════════════════════════════════

    /// Resend tick: re-broadcast the outstanding declaration, and escalate
    /// an attempt that outlived the view-change timeout.
    pub fn on_resend_tick(
        &mut self,
        now: Duration,
        checkpoint: &Checkpoint,
        in_flight: Option<&InFlightProposal>,
    ) -> Vec<Action> {
        if self.phase == VcPhase::Normal {
            return vec![];
        }

        if now.saturating_sub(self.attempt_started) > self.view_change_timeout {
            let escalated = self.next_view + 1;
            warn!(
                stuck_on = self.next_view,
                escalated, "View change attempt timed out, escalating"
            );
            self.phase = VcPhase::Normal;
            return self.start_attempt(
                escalated,
                "previous view change timed out",
                now,
                checkpoint,
                in_flight,
                true,
            );
        }

        let Some((declaration, data)) = self.last_vote.clone() else {
            return vec![];
        };
        debug!(next_view = declaration.next_view, "Re-broadcasting view change");
        let mut actions = vec![Action::Broadcast {
            message: Message::ViewChange(declaration),
        }];
        let new_leader = leader_for_view(&self.nodes, data.next_view);
        if new_leader != self.self_id {
            actions.push(Action::SendConsensus {
                to: new_leader,
                message: Message::ViewData(data),
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // State transfer
    // ═══════════════════════════════════════════════════════════════════════

    /// A peer asked where we are.
    pub fn on_state_transfer_request(&self, sender: NodeId, checkpoint: &Checkpoint) -> Vec<Action> {
        vec![Action::SendConsensus {
            to: sender,
            message: Message::StateTransferResponse(StateTransferResponse {
                view_id: self.current_view,
                seq: checkpoint.sequence(),
            }),
        }]
    }

    /// A peer reported its position, solicited or assisting.
    pub fn on_state_transfer_response(
        &mut self,
        sender: NodeId,
        response: StateTransferResponse,
        own_checkpoint_seq: u64,
    ) -> ViewChangerOutcome {
        if !self.nodes.contains(&sender) || response.seq <= own_checkpoint_seq {
            return ViewChangerOutcome::default();
        }

        let tally = self
            .sync_responses
            .entry((response.view_id, response.seq))
            .or_default();
        tally.register(sender, response);
        let agreeing = tally.count();

        if agreeing > self.f {
            info!(
                view = response.view_id,
                seq = response.seq,
                agreeing,
                "Peers agree we are behind, synchronizing"
            );
            return ViewChangerOutcome {
                sync: true,
                ..ViewChangerOutcome::default()
            };
        }

        // First hint: solicit enough confirmations to trust it.
        if !self.state_transfer_pending {
            self.state_transfer_pending = true;
            return ViewChangerOutcome::actions(vec![Action::Broadcast {
                message: Message::StateTransferRequest(StateTransferRequest {}),
            }]);
        }
        ViewChangerOutcome::default()
    }

    /// Catch-up finished; resume a pended NewView if its gap is now closed.
    pub fn sync_completed(&mut self, metadata: ViewMetadata) -> Vec<Action> {
        self.state_transfer_pending = false;
        self.sync_responses.clear();

        if let Some(pending) = self.pending_new_view.take() {
            if pending.view > metadata.view_id {
                return self.install_from(pending, metadata.latest_sequence);
            }
        }
        vec![]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Installation bookkeeping
    // ═══════════════════════════════════════════════════════════════════════

    /// The controller installed `view`; forget everything older.
    pub fn view_installed(&mut self, view: u64) {
        if view < self.current_view {
            return;
        }
        self.current_view = view;
        self.next_view = view;
        self.phase = VcPhase::Normal;
        self.last_vote = None;
        self.tallies = self.tallies.split_off(&(view + 1));
        self.collected_data = self.collected_data.split_off(&(view + 1));
        if let Some(pending) = &self.pending_new_view {
            if pending.view <= view {
                self.pending_new_view = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::VerificationError;
    use concord_messages::{prepare_tbs, Prepare};
    use concord_types::{Digest, RequestInfo, Signature};

    struct AcceptAll;

    impl Verifier for AcceptAll {
        fn verify_proposal(
            &self,
            _proposal: &Proposal,
        ) -> Result<Vec<RequestInfo>, VerificationError> {
            Ok(vec![])
        }

        fn verify_request(&self, _request: &[u8]) -> Result<RequestInfo, VerificationError> {
            Ok(RequestInfo::new("", ""))
        }

        fn verify_consenter_sig(
            &self,
            _signature: &Signature,
            _proposal: &Proposal,
        ) -> Result<(), VerificationError> {
            Ok(())
        }

        fn verify_signature(&self, _signature: &Signature) -> Result<(), VerificationError> {
            Ok(())
        }

        fn verification_sequence(&self) -> u64 {
            0
        }
    }

    fn nodes() -> Vec<NodeId> {
        (0..4).map(NodeId).collect()
    }

    fn changer(self_id: u64) -> ViewChanger {
        ViewChanger::new(
            NodeId(self_id),
            nodes(),
            3,
            1,
            Duration::from_secs(20),
            0,
            Arc::new(AcceptAll),
        )
    }

    fn declaration(next_view: u64) -> ViewChange {
        ViewChange {
            next_view,
            reason: "test".into(),
        }
    }

    fn snapshot(next_view: u64) -> ViewData {
        ViewData {
            next_view,
            last_decision: Proposal::default(),
            last_decision_signatures: vec![],
            in_flight: None,
            in_flight_prepares: BTreeMap::new(),
        }
    }

    fn has_new_view(actions: &[Action]) -> bool {
        actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::NewView(_) }))
    }

    fn installed_view(actions: &[Action]) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            Action::EnqueueInternal {
                event: Event::ViewChangeCompleted { view, .. },
            } => Some(*view),
            _ => None,
        })
    }

    #[test]
    fn complaint_broadcasts_declaration_and_snapshot() {
        let mut vc = changer(2);
        let checkpoint = Checkpoint::default();
        let actions = vc.start_view_change("leader silent", Duration::ZERO, &checkpoint, None);

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::ViewChange(v) } if v.next_view == 1)));
        // Snapshot goes to n1, the leader of view 1.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SendConsensus { to: NodeId(1), message: Message::ViewData(_) }
        )));
        assert!(vc.changing());

        // A second complaint is absorbed.
        assert!(vc
            .start_view_change("again", Duration::ZERO, &checkpoint, None)
            .is_empty());
    }

    #[test]
    fn prospective_leader_assembles_new_view() {
        let mut vc = changer(1);
        let checkpoint = Checkpoint::default();

        vc.start_view_change("leader silent", Duration::ZERO, &checkpoint, None);
        vc.on_view_data(NodeId(2), snapshot(1), &checkpoint);
        vc.on_view_data(NodeId(3), snapshot(1), &checkpoint);

        vc.on_view_change(NodeId(2), declaration(1), Duration::ZERO, &checkpoint, None);
        let actions =
            vc.on_view_change(NodeId(3), declaration(1), Duration::ZERO, &checkpoint, None);

        assert!(has_new_view(&actions));
        assert_eq!(installed_view(&actions), Some(1));
    }

    #[test]
    fn follower_installs_on_new_view() {
        let mut vc = changer(3);
        let checkpoint = Checkpoint::default();

        let announcement = NewView {
            view: 1,
            view_data: vec![
                (NodeId(0), snapshot(1)),
                (NodeId(2), snapshot(1)),
                (NodeId(3), snapshot(1)),
            ],
        };
        let actions = vc.on_new_view(NodeId(1), announcement, &checkpoint);
        assert_eq!(installed_view(&actions), Some(1));
    }

    #[test]
    fn new_view_from_wrong_leader_is_dropped() {
        let mut vc = changer(3);
        let checkpoint = Checkpoint::default();
        let announcement = NewView {
            view: 1,
            view_data: vec![
                (NodeId(0), snapshot(1)),
                (NodeId(2), snapshot(1)),
                (NodeId(3), snapshot(1)),
            ],
        };
        assert!(vc.on_new_view(NodeId(2), announcement, &checkpoint).is_empty());
    }

    #[test]
    fn new_view_without_snapshot_quorum_is_dropped() {
        let mut vc = changer(3);
        let checkpoint = Checkpoint::default();
        let announcement = NewView {
            view: 1,
            view_data: vec![(NodeId(0), snapshot(1)), (NodeId(2), snapshot(1))],
        };
        assert!(vc.on_new_view(NodeId(1), announcement, &checkpoint).is_empty());
    }

    #[test]
    fn f_plus_one_declarations_pull_us_along() {
        let mut vc = changer(3);
        let checkpoint = Checkpoint::default();

        assert!(!vc.changing());
        vc.on_view_change(NodeId(0), declaration(1), Duration::ZERO, &checkpoint, None);
        assert!(!vc.changing(), "one declaration is not evidence");

        let actions =
            vc.on_view_change(NodeId(2), declaration(1), Duration::ZERO, &checkpoint, None);
        assert!(vc.changing(), "f + 1 declarations are");
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::ViewChange(_) })));
    }

    #[test]
    fn attempt_escalates_after_timeout() {
        let mut vc = changer(2);
        let checkpoint = Checkpoint::default();
        vc.start_view_change("leader silent", Duration::ZERO, &checkpoint, None);

        // Within the timeout: re-broadcast only.
        let actions = vc.on_resend_tick(Duration::from_secs(5), &checkpoint, None);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::ViewChange(v) } if v.next_view == 1)));

        // Past the timeout: escalate to view 2.
        let actions = vc.on_resend_tick(Duration::from_secs(30), &checkpoint, None);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::ViewChange(v) } if v.next_view == 2)));
    }

    #[test]
    fn in_flight_with_certificate_survives() {
        let vc = changer(3);

        let proposal = Proposal {
            payload: b"batch".to_vec(),
            metadata: ViewMetadata {
                view_id: 0,
                latest_sequence: 1,
                decisions_in_view: 0,
            }
            .encode(),
            header: vec![],
            verification_sequence: 0,
        };
        let digest = proposal.digest();
        let prepares: BTreeMap<NodeId, Prepare> = (0..3)
            .map(|i| {
                let tbs = prepare_tbs(0, 1, &digest);
                (
                    NodeId(i),
                    Prepare {
                        view: 0,
                        seq: 1,
                        digest,
                        signature: Signature {
                            id: NodeId(i),
                            value: vec![],
                            msg: tbs,
                        },
                    },
                )
            })
            .collect();

        let mut data = snapshot(1);
        data.in_flight = Some(proposal.clone());
        data.in_flight_prepares = prepares;

        let entries = vec![
            (NodeId(0), snapshot(1)),
            (NodeId(2), data),
            (NodeId(3), snapshot(1)),
        ];
        let selected = vc.select_in_flight(&entries, 0);
        assert_eq!(selected, Some(proposal));
    }

    #[test]
    fn in_flight_without_certificate_is_dropped() {
        let vc = changer(3);
        let mut data = snapshot(1);
        data.in_flight = Some(Proposal {
            payload: b"batch".to_vec(),
            metadata: ViewMetadata {
                view_id: 0,
                latest_sequence: 1,
                decisions_in_view: 0,
            }
            .encode(),
            header: vec![],
            verification_sequence: 0,
        });
        // Only two prepares: below the quorum of three.
        let digest = data.in_flight.as_ref().unwrap().digest();
        data.in_flight_prepares = (0..2)
            .map(|i| {
                (
                    NodeId(i),
                    Prepare {
                        view: 0,
                        seq: 1,
                        digest,
                        signature: Signature {
                            id: NodeId(i),
                            value: vec![],
                            msg: vec![],
                        },
                    },
                )
            })
            .collect();

        let entries = vec![(NodeId(2), data)];
        assert_eq!(vc.select_in_flight(&entries, 0), None);
    }

    #[test]
    fn behind_checkpoint_pends_install_and_requests_positions() {
        let mut vc = changer(3);
        let checkpoint = Checkpoint::default();

        let decided = Proposal {
            payload: vec![],
            metadata: ViewMetadata {
                view_id: 0,
                latest_sequence: 7,
                decisions_in_view: 7,
            }
            .encode(),
            header: vec![],
            verification_sequence: 0,
        };
        let mut advanced = snapshot(1);
        advanced.last_decision = decided;

        let announcement = NewView {
            view: 1,
            view_data: vec![
                (NodeId(0), advanced),
                (NodeId(2), snapshot(1)),
                (NodeId(3), snapshot(1)),
            ],
        };
        let actions = vc.on_new_view(NodeId(1), announcement, &checkpoint);
        assert!(installed_view(&actions).is_none());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Broadcast { message: Message::StateTransferRequest(_) })));

        // f + 1 agreeing positions ahead of us ask for synchronization.
        let outcome = vc.on_state_transfer_response(
            NodeId(0),
            StateTransferResponse { view_id: 1, seq: 7 },
            0,
        );
        assert!(!outcome.sync);
        let outcome = vc.on_state_transfer_response(
            NodeId(2),
            StateTransferResponse { view_id: 1, seq: 7 },
            0,
        );
        assert!(outcome.sync);

        // After catch-up the pended install completes.
        let actions = vc.sync_completed(ViewMetadata {
            view_id: 0,
            latest_sequence: 7,
            decisions_in_view: 7,
        });
        assert_eq!(installed_view(&actions), Some(1));
    }

    #[test]
    fn install_clears_attempt_state() {
        let mut vc = changer(2);
        let checkpoint = Checkpoint::default();
        vc.start_view_change("leader silent", Duration::ZERO, &checkpoint, None);
        vc.view_installed(1);
        assert!(!vc.changing());
        assert_eq!(vc.current_view(), 1);

        // Declarations for the installed view are now stale.
        assert!(vc
            .on_view_change(NodeId(0), declaration(1), Duration::ZERO, &checkpoint, None)
            .is_empty());
    }
}
