//! One view of three-phase agreement.
//!
//! A [`View`] drives PBFT-style agreement for one view number: the leader's
//! Pre-Prepare, a quorum of Prepares, a quorum of Commits, then delivery.
//! Phase advancement is an explicit reducer consuming one message at a time;
//! all waiting happens in the runner, never here.
//!
//! Votes that arrive before the proposal they endorse are buffered in the
//! vote sets and re-counted when the Pre-Prepare lands, so message reorder
//! never stalls a sequence.

use crate::persist::WalEntry;
use crate::vote_set::VoteSet;
use concord_core::{Action, Signer, Verifier};
use concord_messages::{commit_tbs, prepare_tbs, Commit, Message, PrePrepare, Prepare};
use concord_types::{Digest, NodeId, Proposal, RequestInfo, Signature, ViewMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Phase of the agreement instance at the current sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the leader's proposal.
    AwaitingPrePrepare,
    /// Prepare broadcast; collecting a quorum of prepares.
    AwaitingPrepares,
    /// Commit broadcast; collecting a quorum of commits.
    AwaitingCommits,
    /// Decision handed to the controller; waiting for the deliver-ack.
    AwaitingDelivery,
    /// Aborted by a view change; terminal.
    Aborted,
}

/// A proposal past Pre-Prepare but not yet delivered.
///
/// Survives a view change inside `ViewData` envelopes; the prepare
/// certificate proves it may have been decided somewhere.
#[derive(Debug, Clone)]
pub struct InFlightProposal {
    pub proposal: Proposal,
    pub digest: Digest,
    /// Prepares collected for the digest, by signer.
    pub prepares: BTreeMap<NodeId, Prepare>,
}

/// The proposal currently under agreement.
#[derive(Debug, Clone)]
struct CurrentProposal {
    proposal: Proposal,
    digest: Digest,
    requests: Vec<RequestInfo>,
}

/// What a message did to the view, beyond the returned actions.
#[derive(Debug, Default)]
pub struct ViewOutcome {
    pub actions: Vec<Action>,
    /// The sender claims a sequence beyond ours; the controller feeds this
    /// to the synchronizer's gap detection.
    pub sequence_gap: bool,
}

impl ViewOutcome {
    fn actions(actions: Vec<Action>) -> Self {
        Self {
            actions,
            sequence_gap: false,
        }
    }

    fn gap() -> Self {
        Self {
            actions: Vec::new(),
            sequence_gap: true,
        }
    }
}

/// One instance of three-phase agreement for one view number.
pub struct View {
    self_id: NodeId,
    nodes: Vec<NodeId>,
    number: u64,
    leader: NodeId,
    proposal_sequence: u64,
    decisions_in_view: u64,
    quorum: usize,

    phase: Phase,
    pre_prepares: VoteSet<PrePrepare>,
    prepares: VoteSet<Prepare>,
    commits: VoteSet<Commit>,
    current: Option<CurrentProposal>,
    in_flight: Option<InFlightProposal>,
    /// Our own commit for the previous sequence, re-sent with `assist` when
    /// a peer is still finishing it.
    last_commit: Option<Commit>,
    /// Decision awaiting the deliver-ack.
    delivered: Option<(Proposal, Vec<Signature>, Vec<RequestInfo>)>,

    verifier: Arc<dyn Verifier>,
    signer: Arc<dyn Signer>,
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("self_id", &self.self_id)
            .field("number", &self.number)
            .field("leader", &self.leader)
            .field("sequence", &self.proposal_sequence)
            .field("phase", &self.phase)
            .finish()
    }
}

impl View {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        self_id: NodeId,
        nodes: Vec<NodeId>,
        number: u64,
        leader: NodeId,
        proposal_sequence: u64,
        quorum: usize,
        verifier: Arc<dyn Verifier>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            self_id,
            nodes,
            number,
            leader,
            proposal_sequence,
            decisions_in_view: 0,
            quorum,
            phase: Phase::AwaitingPrePrepare,
            pre_prepares: VoteSet::new(),
            prepares: VoteSet::new(),
            commits: VoteSet::new(),
            current: None,
            in_flight: None,
            last_commit: None,
            delivered: None,
            verifier,
            signer,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }

    pub fn sequence(&self) -> u64 {
        self.proposal_sequence
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn in_flight(&self) -> Option<&InFlightProposal> {
        self.in_flight.as_ref()
    }

    /// Metadata for the next proposal in this view.
    pub fn metadata(&self) -> ViewMetadata {
        ViewMetadata {
            view_id: self.number,
            latest_sequence: self.proposal_sequence,
            decisions_in_view: self.decisions_in_view,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Leader path
    // ═══════════════════════════════════════════════════════════════════════

    /// Propose a batch (leader only).
    ///
    /// Stamps the view metadata, persists the proposal, broadcasts the
    /// Pre-Prepare and immediately runs the leader's own prepare step.
    pub fn propose(
        &mut self,
        mut proposal: Proposal,
        prev_commit_signatures: Vec<Signature>,
    ) -> Vec<Action> {
        if self.self_id != self.leader {
            warn!(view = self.number, "Propose on a non-leader, dropping");
            return vec![];
        }
        if self.phase != Phase::AwaitingPrePrepare {
            warn!(
                view = self.number,
                seq = self.proposal_sequence,
                phase = ?self.phase,
                "Propose while agreement is in flight, dropping"
            );
            return vec![];
        }

        proposal.metadata = self.metadata().encode();
        let requests = match self.verifier.verify_proposal(&proposal) {
            Ok(requests) => requests,
            Err(err) => {
                warn!(error = %err, "Own proposal failed verification, dropping");
                return vec![];
            }
        };
        let digest = proposal.digest();

        info!(
            view = self.number,
            seq = self.proposal_sequence,
            digest = %digest,
            requests = requests.len(),
            "Proposing batch"
        );

        let pre_prepare = PrePrepare {
            view: self.number,
            seq: self.proposal_sequence,
            proposal: proposal.clone(),
            prev_commit_signatures,
        };
        self.pre_prepares.register(self.self_id, pre_prepare.clone());

        let mut actions = vec![
            Action::Persist {
                record: WalEntry::PrePrepare {
                    view: self.number,
                    seq: self.proposal_sequence,
                    proposal: proposal.clone(),
                }
                .encode(),
            },
            Action::Broadcast {
                message: Message::PrePrepare(pre_prepare),
            },
        ];
        actions.extend(self.enter_prepared(proposal, digest, requests));
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Route a phase message into the reducer.
    pub fn handle_message(&mut self, sender: NodeId, message: Message) -> ViewOutcome {
        if self.phase == Phase::Aborted {
            return ViewOutcome::default();
        }
        if !self.nodes.contains(&sender) {
            warn!(%sender, "Phase message from a non-member, dropping");
            return ViewOutcome::default();
        }

        let (Some(view), Some(seq)) = (message.view(), message.sequence()) else {
            return ViewOutcome::default();
        };
        if seq > self.proposal_sequence {
            debug!(
                %sender,
                seq,
                local = self.proposal_sequence,
                kind = message.type_name(),
                "Phase message from a future sequence"
            );
            return ViewOutcome::gap();
        }
        if view != self.number || seq != self.proposal_sequence {
            // A commit for the sequence we just delivered deserves help:
            // re-send our own commit so the straggler can finish.
            if let Message::Commit(commit) = &message {
                if !commit.assist && view == self.number && seq + 1 == self.proposal_sequence {
                    if let Some(own) = &self.last_commit {
                        trace!(%sender, seq, "Assisting straggler with our commit");
                        let mut assist = own.clone();
                        assist.assist = true;
                        return ViewOutcome::actions(vec![Action::SendConsensus {
                            to: sender,
                            message: Message::Commit(assist),
                        }]);
                    }
                }
            }
            trace!(
                %sender,
                view,
                seq,
                kind = message.type_name(),
                "Dropping phase message for another view/sequence"
            );
            return ViewOutcome::default();
        }

        match message {
            Message::PrePrepare(pre_prepare) => self.on_pre_prepare(sender, pre_prepare),
            Message::Prepare(prepare) => self.on_prepare(sender, prepare),
            Message::Commit(commit) => self.on_commit(sender, commit),
            _ => ViewOutcome::default(),
        }
    }

    fn on_pre_prepare(&mut self, sender: NodeId, pre_prepare: PrePrepare) -> ViewOutcome {
        if sender != self.leader {
            warn!(%sender, leader = %self.leader, "Pre-Prepare from a non-leader, dropping");
            return ViewOutcome::default();
        }
        if self.phase != Phase::AwaitingPrePrepare || self.current.is_some() {
            trace!(%sender, "Duplicate Pre-Prepare, dropping");
            return ViewOutcome::default();
        }
        if !self.pre_prepares.register(sender, pre_prepare.clone()) {
            return ViewOutcome::default();
        }

        let proposal = pre_prepare.proposal;
        match proposal.view_metadata() {
            Ok(md)
                if md.view_id == self.number && md.latest_sequence == self.proposal_sequence => {}
            Ok(md) => {
                warn!(
                    %sender,
                    view_id = md.view_id,
                    latest_sequence = md.latest_sequence,
                    "Pre-Prepare metadata disagrees with the view, dropping"
                );
                return ViewOutcome::default();
            }
            Err(err) => {
                warn!(%sender, error = %err, "Pre-Prepare carries malformed metadata, dropping");
                return ViewOutcome::default();
            }
        }

        let requests = match self.verifier.verify_proposal(&proposal) {
            Ok(requests) => requests,
            Err(err) => {
                warn!(%sender, error = %err, "Proposal failed verification, dropping");
                return ViewOutcome::default();
            }
        };
        let digest = proposal.digest();

        debug!(
            view = self.number,
            seq = self.proposal_sequence,
            digest = %digest,
            "Accepted Pre-Prepare"
        );

        let mut actions = vec![Action::Persist {
            record: WalEntry::PrePrepare {
                view: self.number,
                seq: self.proposal_sequence,
                proposal: proposal.clone(),
            }
            .encode(),
        }];
        actions.extend(self.enter_prepared(proposal, digest, requests));
        ViewOutcome::actions(actions)
    }

    fn on_prepare(&mut self, sender: NodeId, prepare: Prepare) -> ViewOutcome {
        if prepare.signature.id != sender {
            warn!(%sender, signer = %prepare.signature.id, "Prepare signed by someone else, dropping");
            return ViewOutcome::default();
        }
        if let Err(err) = self.verifier.verify_signature(&prepare.signature) {
            warn!(%sender, error = %err, "Prepare signature invalid, dropping");
            return ViewOutcome::default();
        }
        if let Some(current) = &self.current {
            if prepare.digest != current.digest {
                warn!(
                    %sender,
                    got = %prepare.digest,
                    expected = %current.digest,
                    "Prepare digest disagrees with the proposal, dropping"
                );
                return ViewOutcome::default();
            }
        }
        if !self.prepares.register(sender, prepare) {
            trace!(%sender, "Duplicate Prepare, ignoring");
            return ViewOutcome::default();
        }

        if self.phase == Phase::AwaitingPrepares {
            return ViewOutcome::actions(self.check_prepared());
        }
        ViewOutcome::default()
    }

    fn on_commit(&mut self, sender: NodeId, commit: Commit) -> ViewOutcome {
        if commit.signature.id != sender {
            warn!(%sender, signer = %commit.signature.id, "Commit signed by someone else, dropping");
            return ViewOutcome::default();
        }
        if let Some(current) = &self.current {
            if commit.digest != current.digest {
                warn!(
                    %sender,
                    got = %commit.digest,
                    expected = %current.digest,
                    "Commit digest disagrees with the proposal, dropping"
                );
                return ViewOutcome::default();
            }
        }
        if !self.commits.register(sender, commit) {
            trace!(%sender, "Duplicate Commit, ignoring");
            return ViewOutcome::default();
        }

        if self.phase == Phase::AwaitingCommits {
            return ViewOutcome::actions(self.check_committed());
        }
        ViewOutcome::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept a proposal: persist the prepare intent, broadcast our Prepare
    /// and start collecting. Shared by the leader and follower paths.
    fn enter_prepared(
        &mut self,
        proposal: Proposal,
        digest: Digest,
        requests: Vec<RequestInfo>,
    ) -> Vec<Action> {
        self.in_flight = Some(InFlightProposal {
            proposal: proposal.clone(),
            digest,
            prepares: BTreeMap::new(),
        });
        self.current = Some(CurrentProposal {
            proposal,
            digest,
            requests,
        });

        let tbs = prepare_tbs(self.number, self.proposal_sequence, &digest);
        let prepare = Prepare {
            view: self.number,
            seq: self.proposal_sequence,
            digest,
            signature: Signature {
                id: self.self_id,
                value: self.signer.sign(&tbs),
                msg: tbs,
            },
        };

        let mut actions = vec![
            Action::Persist {
                record: WalEntry::PrepareSent {
                    view: self.number,
                    seq: self.proposal_sequence,
                    digest,
                }
                .encode(),
            },
            Action::Broadcast {
                message: Message::Prepare(prepare.clone()),
            },
        ];

        self.phase = Phase::AwaitingPrepares;
        self.prepares.register(self.self_id, prepare);

        // Votes may have arrived ahead of the proposal.
        actions.extend(self.check_prepared());
        actions
    }

    /// Quorum check for prepares; on success persist the commit intent,
    /// broadcast our Commit and move on.
    fn check_prepared(&mut self) -> Vec<Action> {
        let Some(current) = self.current.clone() else {
            return vec![];
        };
        let digest = current.digest;
        let matching = self.prepares.count_matching(|p| p.digest == digest);
        if matching < self.quorum {
            return vec![];
        }

        debug!(
            view = self.number,
            seq = self.proposal_sequence,
            prepares = matching,
            quorum = self.quorum,
            "Prepared"
        );

        let certificate: BTreeMap<NodeId, Prepare> = self
            .prepares
            .iter()
            .filter(|(_, p)| p.digest == digest)
            .map(|(id, p)| (id, p.clone()))
            .collect();
        if let Some(in_flight) = &mut self.in_flight {
            in_flight.prepares = certificate.clone();
        }

        let signature = self.signer.sign_proposal(&current.proposal);
        let commit = Commit {
            view: self.number,
            seq: self.proposal_sequence,
            digest,
            signature,
            assist: false,
        };

        let mut actions = vec![
            Action::Persist {
                record: WalEntry::CommitSent {
                    view: self.number,
                    seq: self.proposal_sequence,
                    digest,
                    prepares: certificate.into_values().collect(),
                }
                .encode(),
            },
            Action::Broadcast {
                message: Message::Commit(commit.clone()),
            },
        ];

        self.phase = Phase::AwaitingCommits;
        self.last_commit = Some(commit.clone());
        self.commits.register(self.self_id, commit);

        actions.extend(self.check_committed());
        actions
    }

    /// Quorum check for commits; on success hand the decision up.
    fn check_committed(&mut self) -> Vec<Action> {
        let Some(current) = self.current.clone() else {
            return vec![];
        };
        let digest = current.digest;
        let verifier = &self.verifier;
        let proposal = &current.proposal;
        let valid =
            |commit: &Commit| -> bool {
                commit.digest == digest
                    && verifier
                        .verify_consenter_sig(&commit.signature, proposal)
                        .is_ok()
            };
        if self.commits.count_matching(valid) < self.quorum {
            return vec![];
        }

        let signatures: Vec<Signature> = self
            .commits
            .iter()
            .filter(|(_, c)| valid(c))
            .map(|(_, c)| c.signature.clone())
            .collect();

        info!(
            view = self.number,
            seq = self.proposal_sequence,
            digest = %digest,
            commits = signatures.len(),
            "Committed, delivering decision"
        );

        self.phase = Phase::AwaitingDelivery;
        self.delivered = Some((
            current.proposal.clone(),
            signatures.clone(),
            current.requests.clone(),
        ));

        vec![Action::Deliver {
            proposal: current.proposal,
            signatures,
            requests: current.requests,
        }]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Take the decision awaiting the deliver-ack.
    pub fn take_delivered(&mut self) -> Option<(Proposal, Vec<Signature>, Vec<RequestInfo>)> {
        self.delivered.take()
    }

    /// Advance to the next sequence after the deliver-ack.
    pub fn advance(&mut self) {
        self.pre_prepares.clear();
        self.prepares.clear();
        self.commits.clear();
        self.current = None;
        self.in_flight = None;
        self.proposal_sequence += 1;
        self.decisions_in_view += 1;
        self.phase = Phase::AwaitingPrePrepare;
    }

    /// Abort the view: clear vote sets and park the reducer.
    pub fn abort(&mut self) {
        self.pre_prepares.clear();
        self.prepares.clear();
        self.commits.clear();
        self.delivered = None;
        self.phase = Phase::Aborted;
    }

    /// Re-enter the phase recorded in the log after a restart,
    /// re-broadcasting instead of equivocating.
    pub fn resume(
        &mut self,
        phase: crate::persist::RecoveredPhase,
        proposal: Option<Proposal>,
        prepares: Vec<Prepare>,
    ) -> Vec<Action> {
        use crate::persist::RecoveredPhase;

        let Some(proposal) = proposal else {
            return vec![];
        };
        let digest = proposal.digest();
        let requests = self
            .verifier
            .verify_proposal(&proposal)
            .unwrap_or_else(|err| {
                warn!(error = %err, "Restored proposal no longer verifies");
                vec![]
            });

        match phase {
            RecoveredPhase::Idle => vec![],
            // The proposal is durable but our Prepare may never have left
            // (or left without being heard). Re-run the acceptance path;
            // re-persisting the prepare intent is idempotent on replay. The
            // leader also re-announces the proposal itself.
            RecoveredPhase::ProposalLogged | RecoveredPhase::PrepareBroadcast => {
                let mut actions = self.reannounce_as_leader(&proposal);
                actions.extend(self.enter_prepared(proposal, digest, requests));
                actions
            }
            RecoveredPhase::CommitBroadcast => {
                let mut actions = self.reannounce_as_leader(&proposal);
                self.in_flight = Some(InFlightProposal {
                    proposal: proposal.clone(),
                    digest,
                    prepares: prepares
                        .iter()
                        .map(|p| (p.signature.id, p.clone()))
                        .collect(),
                });
                self.current = Some(CurrentProposal {
                    proposal: proposal.clone(),
                    digest,
                    requests,
                });
                for prepare in prepares {
                    self.prepares.register(prepare.signature.id, prepare);
                }

                let signature = self.signer.sign_proposal(&proposal);
                let commit = Commit {
                    view: self.number,
                    seq: self.proposal_sequence,
                    digest,
                    signature,
                    assist: false,
                };
                self.phase = Phase::AwaitingCommits;
                self.last_commit = Some(commit.clone());
                self.commits.register(self.self_id, commit.clone());

                actions.push(Action::Broadcast {
                    message: Message::Commit(commit),
                });
                actions.extend(self.check_committed());
                actions
            }
        }
    }

    /// On restart, a leader re-announces the proposal it logged so peers
    /// that never saw it can participate.
    fn reannounce_as_leader(&mut self, proposal: &Proposal) -> Vec<Action> {
        if self.self_id != self.leader {
            return vec![];
        }
        let pre_prepare = PrePrepare {
            view: self.number,
            seq: self.proposal_sequence,
            proposal: proposal.clone(),
            prev_commit_signatures: vec![],
        };
        self.pre_prepares.register(self.self_id, pre_prepare.clone());
        vec![Action::Broadcast {
            message: Message::PrePrepare(pre_prepare),
        }]
    }
}

/// Canonical commit envelope helper, re-exported for signer implementations.
pub fn commit_envelope(proposal: &Proposal) -> Vec<u8> {
    commit_tbs(&proposal.digest())
}
