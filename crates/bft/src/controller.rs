//! The top-level replica state machine.
//!
//! The controller owns the request pool, the batcher, the current view, the
//! view changer and the heartbeat monitor, and routes every event to the
//! right subsystem. It also owns the leader token: an explicit
//! `{Idle, Proposing}` slot guaranteeing at most one outstanding proposal,
//! dropped on view change and re-armed on delivery while this replica stays
//! leader.

use crate::config::Config;
use crate::heartbeat::HeartbeatMonitor;
use crate::persist::{RecoveredState, WalEntry};
use crate::view::{Phase, View};
use crate::view_changer::ViewChanger;
use concord_core::{
    Action, Assembler, Event, RequestInspector, Signer, StateMachine, TimerId, Verifier,
};
use concord_messages::Message;
use concord_pool::{BatchOutcome, Batcher, RequestPool, SubmitError};
use concord_types::{compute_quorum, leader_for_view, Checkpoint, NodeId, Proposal, Signature};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The collaborators a replica consumes.
#[derive(Clone)]
pub struct NodeContext {
    pub signer: Arc<dyn Signer>,
    pub verifier: Arc<dyn Verifier>,
    pub inspector: Arc<dyn RequestInspector>,
    pub assembler: Arc<dyn Assembler>,
}

/// Counters exposed for tests and operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerStats {
    /// Decisions delivered to the application.
    pub decisions: u64,
    /// View changes installed through the view-change protocol.
    pub view_changes: u64,
    /// Completed synchronizations.
    pub syncs: u64,
}

/// The leader's permit for one outstanding proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaderToken {
    /// May propose.
    Idle,
    /// A proposal is outstanding; wait for its delivery.
    Proposing,
}

/// The per-replica decision loop.
pub struct Controller {
    id: NodeId,
    nodes: Vec<NodeId>,
    quorum: usize,
    f: usize,
    config: Config,

    signer: Arc<dyn Signer>,
    verifier: Arc<dyn Verifier>,
    inspector: Arc<dyn RequestInspector>,
    assembler: Arc<dyn Assembler>,

    pool: RequestPool,
    batcher: Batcher,
    view: View,
    view_changer: ViewChanger,
    heartbeat: HeartbeatMonitor,
    checkpoint: Checkpoint,

    token: LeaderToken,
    verification_sequence: u64,
    /// Records in the logical log, for truncation bookkeeping.
    log_length: usize,
    sync_in_flight: bool,
    /// Distinct senders observed ahead of our sequence.
    gap_senders: BTreeSet<NodeId>,
    /// Recovery to replay on `start`.
    resume: Option<RecoveredState>,
    stopped: bool,
    now: Duration,
    stats: ControllerStats,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("view", &self.view.number())
            .field("sequence", &self.view.sequence())
            .field("pool", &self.pool.size())
            .field("stopped", &self.stopped)
            .finish()
    }
}

impl Controller {
    /// Build a replica from configuration and recovered log state.
    ///
    /// Use `RecoveredState::default()` for a fresh start. Call
    /// [`start`](Self::start) once before feeding events.
    pub fn new(
        id: NodeId,
        nodes: Vec<NodeId>,
        config: Config,
        context: NodeContext,
        recovered: RecoveredState,
    ) -> Self {
        let mut nodes = nodes;
        nodes.sort_unstable();
        let (quorum, f) = compute_quorum(nodes.len() as u64);
        debug!(
            n = nodes.len(),
            f, quorum, "Computed fault tolerance and quorum"
        );

        let view = View::new(
            id,
            nodes.clone(),
            recovered.view,
            leader_for_view(&nodes, recovered.view),
            recovered.sequence,
            quorum,
            Arc::clone(&context.verifier),
            Arc::clone(&context.signer),
        );
        let view_changer = ViewChanger::new(
            id,
            nodes.clone(),
            quorum,
            f,
            config.view_change_timeout,
            recovered.view,
            Arc::clone(&context.verifier),
        );
        let heartbeat = HeartbeatMonitor::new(id, config.heartbeat_timeout, Duration::ZERO);
        let pool = RequestPool::new(config.pool.clone());
        let batcher = Batcher::new(config.batch_size, config.batch_timeout);
        let log_length = recovered.log_length;

        Self {
            id,
            nodes,
            quorum,
            f,
            config,
            signer: context.signer,
            verifier: context.verifier,
            inspector: context.inspector,
            assembler: context.assembler,
            pool,
            batcher,
            view,
            view_changer,
            heartbeat,
            checkpoint: Checkpoint::default(),
            token: LeaderToken::Idle,
            verification_sequence: 0,
            log_length,
            sync_in_flight: false,
            gap_senders: BTreeSet::new(),
            resume: Some(recovered),
            stopped: false,
            now: Duration::ZERO,
            stats: ControllerStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The installed view number.
    pub fn current_view(&self) -> u64 {
        self.view.number()
    }

    /// The sequence the next decision will carry.
    pub fn sequence(&self) -> u64 {
        self.view.sequence()
    }

    pub fn is_leader(&self) -> bool {
        self.view.leader() == self.id
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint.sequence()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Seed the checkpoint with the application's last delivered decision.
    ///
    /// Call before [`start`](Self::start) when resuming an application that
    /// already delivered decisions.
    pub fn set_checkpoint(&mut self, proposal: Proposal, signatures: Vec<Signature>) {
        self.checkpoint.set(proposal, signatures);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Replay recovered state and arm the leader token.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        self.heartbeat.view_changed(self.now);

        if let Some(recovered) = self.resume.take() {
            if recovered.proposal.is_some() || recovered.pending_view_change.is_some() {
                info!(
                    view = recovered.view,
                    sequence = recovered.sequence,
                    phase = ?recovered.phase,
                    "Resuming from the write-ahead log"
                );
            }
            let resumed =
                self.view
                    .resume(recovered.phase, recovered.proposal, recovered.prepares);
            actions.extend(self.absorb(resumed));

            if let Some(next_view) = recovered.pending_view_change {
                let resumed = self.view_changer.resume_view_change(
                    next_view,
                    self.now,
                    &self.checkpoint,
                    self.view.in_flight(),
                );
                actions.extend(self.absorb(resumed));
            }
        }

        actions.extend(self.try_propose());
        actions
    }

    /// Submit a client request.
    ///
    /// The typed result goes back to the caller; pool-full and duplicate are
    /// client errors, not replica errors.
    pub fn submit_request(&mut self, request: Vec<u8>) -> (Result<(), SubmitError>, Vec<Action>) {
        if self.stopped {
            return (Ok(()), vec![]);
        }
        let info = self.inspector.request_id(&request);
        match self.pool.submit(request, info.clone(), self.now) {
            Ok(()) => {
                debug!(request = %info, "Request submitted");
                (Ok(()), self.try_propose())
            }
            Err(err) => {
                debug!(request = %info, error = %err, "Request not submitted");
                (Err(err), vec![])
            }
        }
    }

    /// Admit a request forwarded by another replica.
    fn handle_request(&mut self, from: NodeId, request: Vec<u8>) -> Vec<Action> {
        match self.verifier.verify_request(&request) {
            Ok(info) => {
                if let Err(err) = self.pool.submit(request, info.clone(), self.now) {
                    debug!(%from, request = %info, error = %err, "Forwarded request not pooled");
                    return vec![];
                }
                debug!(%from, request = %info, "Forwarded request pooled");
                self.try_propose()
            }
            Err(err) => {
                warn!(%from, error = %err, "Forwarded request failed verification");
                vec![]
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Message routing
    // ═══════════════════════════════════════════════════════════════════════

    fn process_message(&mut self, from: NodeId, message: Message) -> Vec<Action> {
        if message.is_view_message() {
            let outcome = self.view.handle_message(from, message);
            let mut actions = self.absorb(outcome.actions);
            if outcome.sequence_gap {
                actions.extend(self.note_gap(from));
            }
            return actions;
        }

        match message {
            Message::ViewChange(declaration) => {
                let actions = self.view_changer.on_view_change(
                    from,
                    declaration,
                    self.now,
                    &self.checkpoint,
                    self.view.in_flight(),
                );
                self.absorb(actions)
            }
            Message::ViewData(data) => {
                let actions = self.view_changer.on_view_data(from, data, &self.checkpoint);
                self.absorb(actions)
            }
            Message::NewView(announcement) => {
                let actions = self
                    .view_changer
                    .on_new_view(from, announcement, &self.checkpoint);
                self.absorb(actions)
            }
            Message::HeartBeat(heartbeat) => {
                let outcome = self.heartbeat.on_heartbeat(
                    from,
                    heartbeat,
                    self.now,
                    self.view.number(),
                    self.view.sequence(),
                    self.view.leader(),
                );
                let mut actions = outcome.actions;
                if outcome.complain {
                    actions.extend(self.complain("heartbeat timeout"));
                }
                if outcome.sync {
                    actions.extend(self.request_sync());
                }
                actions
            }
            Message::HeartBeatResponse(response) => {
                let outcome = self.heartbeat.on_heartbeat_response(
                    from,
                    response,
                    self.view.number(),
                    self.view.sequence(),
                    self.view.leader(),
                    self.checkpoint.sequence(),
                );
                let mut actions = outcome.actions;
                if outcome.sync {
                    actions.extend(self.request_sync());
                }
                actions
            }
            Message::StateTransferRequest(_) => self
                .view_changer
                .on_state_transfer_request(from, &self.checkpoint),
            Message::StateTransferResponse(response) => {
                let outcome = self.view_changer.on_state_transfer_response(
                    from,
                    response,
                    self.checkpoint.sequence(),
                );
                let mut actions = outcome.actions;
                if outcome.sync {
                    actions.extend(self.request_sync());
                }
                actions
            }
            _ => vec![],
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════

    fn on_tick(&mut self, id: TimerId) -> Vec<Action> {
        match id {
            TimerId::PoolTick => {
                let outcome = self.pool.on_tick(self.now, self.is_leader());
                let mut actions: Vec<Action> = outcome
                    .forwards
                    .into_iter()
                    .map(|request| Action::ForwardRequest {
                        to: self.view.leader(),
                        request,
                    })
                    .collect();
                if outcome.complaints > 0 {
                    actions.extend(self.complain("request leader-forward timeout"));
                }
                actions.extend(self.try_propose());
                actions
            }
            TimerId::HeartbeatTick => {
                let outcome = self.heartbeat.on_tick(
                    self.now,
                    self.view.number(),
                    self.view.sequence(),
                    self.view.leader(),
                );
                let mut actions = outcome.actions;
                if outcome.complain {
                    actions.extend(self.complain("heartbeat timeout"));
                }
                actions
            }
            TimerId::ViewChangeResendTick => {
                let actions = self.view_changer.on_resend_tick(
                    self.now,
                    &self.checkpoint,
                    self.view.in_flight(),
                );
                self.absorb(actions)
            }
            TimerId::BatchTimeout => self.try_propose(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Decisions
    // ═══════════════════════════════════════════════════════════════════════

    fn on_delivery_acknowledged(&mut self) -> Vec<Action> {
        let Some((proposal, signatures, requests)) = self.view.take_delivered() else {
            debug!("Deliver-ack without a pending decision, ignoring");
            return vec![];
        };

        self.checkpoint.set(proposal, signatures);
        self.stats.decisions += 1;

        for info in &requests {
            self.pool.remove_request(info);
        }

        // The delivered decision is the new safe prefix of the log.
        let mut actions = vec![Action::Persist {
            record: WalEntry::CheckpointMark {
                view: self.view.number(),
                sequence: self.view.sequence(),
            }
            .encode(),
        }];
        self.log_length += 1;
        actions.push(Action::TruncateLog {
            index: self.log_length - 1,
        });
        self.log_length = 1;

        self.view.advance();
        self.gap_senders.clear();
        actions.extend(self.maybe_prune_revoked_requests());

        if self.is_leader() {
            self.token = LeaderToken::Idle;
            actions.extend(self.try_propose());
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // View installation
    // ═══════════════════════════════════════════════════════════════════════

    fn on_view_change_completed(
        &mut self,
        new_view: u64,
        start_sequence: u64,
        in_flight: Option<Proposal>,
    ) -> Vec<Action> {
        if new_view <= self.view.number() {
            debug!(
                new_view,
                current = self.view.number(),
                "Stale view installation, ignoring"
            );
            return vec![];
        }
        self.stats.view_changes += 1;
        self.install_view(new_view, start_sequence, in_flight)
    }

    /// Abort the current view and start a fresh one at the given numbers.
    fn install_view(
        &mut self,
        number: u64,
        start_sequence: u64,
        in_flight: Option<Proposal>,
    ) -> Vec<Action> {
        let leader = leader_for_view(&self.nodes, number);
        info!(
            view = number,
            start_sequence,
            %leader,
            leading = leader == self.id,
            "Installing view"
        );

        self.view.abort();
        self.view = View::new(
            self.id,
            self.nodes.clone(),
            number,
            leader,
            start_sequence,
            self.quorum,
            Arc::clone(&self.verifier),
            Arc::clone(&self.signer),
        );
        self.view_changer.view_installed(number);
        self.heartbeat.view_changed(self.now);
        self.pool.restart_timers(self.now);
        self.batcher.reset();
        self.gap_senders.clear();
        self.token = LeaderToken::Idle;

        let mut actions = Vec::new();
        if leader == self.id {
            if let Some(proposal) = in_flight {
                info!(
                    view = number,
                    sequence = start_sequence,
                    "Re-proposing the surviving in-flight proposal"
                );
                let (_, signatures) = self.checkpoint.get();
                let proposed = self.view.propose(proposal, signatures);
                if !proposed.is_empty() {
                    self.token = LeaderToken::Proposing;
                }
                actions.extend(self.absorb(proposed));
            } else {
                actions.extend(self.try_propose());
            }
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Synchronization
    // ═══════════════════════════════════════════════════════════════════════

    /// A complaint from any subsystem: suspect the leader, start changing
    /// the view.
    fn complain(&mut self, reason: &str) -> Vec<Action> {
        let actions = self.view_changer.start_view_change(
            reason,
            self.now,
            &self.checkpoint,
            self.view.in_flight(),
        );
        self.absorb(actions)
    }

    fn note_gap(&mut self, from: NodeId) -> Vec<Action> {
        self.gap_senders.insert(from);
        if self.gap_senders.len() <= self.f {
            return vec![];
        }
        info!(
            senders = self.gap_senders.len(),
            "Sequence gap confirmed by more than f senders, synchronizing"
        );
        self.gap_senders.clear();
        self.request_sync()
    }

    fn request_sync(&mut self) -> Vec<Action> {
        if self.sync_in_flight || self.stopped {
            return vec![];
        }
        self.sync_in_flight = true;
        self.pool.stop_timers();
        vec![Action::RequestSync]
    }

    fn on_sync_completed(&mut self, proposal: Proposal, signatures: Vec<Signature>) -> Vec<Action> {
        self.sync_in_flight = false;
        self.pool.start_timers(self.now);

        let metadata = proposal.view_metadata().unwrap_or_default();
        let advanced = metadata.latest_sequence > self.checkpoint.sequence();
        if advanced {
            info!(
                view = metadata.view_id,
                sequence = metadata.latest_sequence,
                "Synchronized up to the network"
            );
            self.checkpoint.set(proposal, signatures);
            self.stats.syncs += 1;
        }

        let mut actions = self.view_changer.sync_completed(metadata);
        actions = self.absorb(actions);

        let moved_view = metadata.view_id > self.view.number();
        let moved_sequence =
            metadata.view_id == self.view.number() && metadata.latest_sequence >= self.view.sequence();
        if moved_view || moved_sequence {
            actions.extend(self.install_view(metadata.view_id, metadata.latest_sequence + 1, None));
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposing
    // ═══════════════════════════════════════════════════════════════════════

    /// Holding the leader token, try to cut and propose the next batch.
    fn try_propose(&mut self) -> Vec<Action> {
        if self.stopped
            || !self.is_leader()
            || self.token != LeaderToken::Idle
            || self.view.phase() != Phase::AwaitingPrePrepare
            || self.view_changer.changing()
        {
            return vec![];
        }

        match self.batcher.next_batch(&self.pool, self.now) {
            BatchOutcome::Ready(batch) => {
                let metadata = self.view.metadata().encode();
                let (mut proposal, remainder) = self.assembler.assemble_proposal(&metadata, batch);
                if !remainder.is_empty() {
                    self.batcher.batch_remainder(remainder);
                }
                proposal.verification_sequence = self.verifier.verification_sequence();

                let (_, signatures) = self.checkpoint.get();
                let proposed = self.view.propose(proposal, signatures);
                if !proposed.is_empty() {
                    self.token = LeaderToken::Proposing;
                }
                self.absorb(proposed)
            }
            BatchOutcome::Waiting {
                deadline_armed,
                deadline,
            } => {
                if deadline_armed {
                    vec![Action::SetTimer {
                        id: TimerId::BatchTimeout,
                        duration: deadline.saturating_sub(self.now),
                    }]
                } else {
                    vec![]
                }
            }
            BatchOutcome::Empty => vec![],
        }
    }

    /// Re-validate the pool and batcher remainder after a verification
    /// sequence bump.
    fn maybe_prune_revoked_requests(&mut self) -> Vec<Action> {
        let current = self.verifier.verification_sequence();
        if current == self.verification_sequence {
            return vec![];
        }
        info!(
            old = self.verification_sequence,
            new = current,
            "Verification sequence changed, pruning revoked requests"
        );
        self.verification_sequence = current;

        let verifier = Arc::clone(&self.verifier);
        self.pool
            .prune(|request| verifier.verify_request(request).is_ok());

        let remainder = self.batcher.pop_remainder();
        let kept: Vec<Vec<u8>> = remainder
            .into_iter()
            .filter(|request| match self.verifier.verify_request(request) {
                Ok(_) => true,
                Err(err) => {
                    warn!(error = %err, "Revoking batched request");
                    false
                }
            })
            .collect();
        if !kept.is_empty() {
            self.batcher.batch_remainder(kept);
        }
        vec![]
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Plumbing
    // ═══════════════════════════════════════════════════════════════════════

    /// Track log growth for truncation bookkeeping.
    fn absorb(&mut self, actions: Vec<Action>) -> Vec<Action> {
        self.log_length += actions
            .iter()
            .filter(|a| matches!(a, Action::Persist { .. }))
            .count();
        actions
    }

    fn stop(&mut self) -> Vec<Action> {
        if self.stopped {
            return vec![];
        }
        info!(id = %self.id, "Stopping replica");
        self.stopped = true;
        self.view.abort();
        self.token = LeaderToken::Idle;
        vec![Action::CancelTimer {
            id: TimerId::BatchTimeout,
        }]
    }
}

impl StateMachine for Controller {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        if self.stopped && !matches!(event, Event::Stop) {
            return vec![];
        }
        match event {
            Event::Tick { id } => self.on_tick(id),
            Event::MessageReceived { from, message } => self.process_message(from, message),
            Event::RequestReceived { from, request } => self.handle_request(from, request),
            Event::SubmitRequest { request } => {
                let (result, actions) = self.submit_request(request);
                if let Err(err) = result {
                    debug!(error = %err, "Submission rejected");
                }
                actions
            }
            Event::DeliveryAcknowledged => self.on_delivery_acknowledged(),
            Event::ViewChangeCompleted {
                view,
                start_sequence,
                in_flight,
            } => self.on_view_change_completed(view, start_sequence, in_flight),
            Event::SyncCompleted {
                proposal,
                signatures,
            } => self.on_sync_completed(proposal, signatures),
            Event::Stop => self.stop(),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::commit_envelope;
    use concord_core::VerificationError;
    use concord_messages::{prepare_tbs, Commit, Message, PrePrepare, Prepare};
    use concord_pool::PoolOptions;
    use concord_types::{Digest, RequestInfo};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Minimal collaborators: a request is its raw bytes, a batch is the
    /// serialized list of requests.
    struct MockApp {
        id: NodeId,
        verification_sequence: AtomicU64,
        revoked: Mutex<HashSet<String>>,
    }

    impl MockApp {
        fn new(id: NodeId) -> Arc<Self> {
            Arc::new(Self {
                id,
                verification_sequence: AtomicU64::new(0),
                revoked: Mutex::new(HashSet::new()),
            })
        }

        fn revoke(&self, id: &str) {
            self.revoked.lock().unwrap().insert(id.to_string());
            self.verification_sequence.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RequestInspector for MockApp {
        fn request_id(&self, request: &[u8]) -> RequestInfo {
            RequestInfo::new("client", String::from_utf8_lossy(request))
        }
    }

    impl Assembler for MockApp {
        fn assemble_proposal(
            &self,
            metadata: &[u8],
            requests: Vec<Vec<u8>>,
        ) -> (Proposal, Vec<Vec<u8>>) {
            (
                Proposal {
                    payload: postcard::to_allocvec(&requests).unwrap(),
                    metadata: metadata.to_vec(),
                    header: vec![],
                    verification_sequence: 0,
                },
                vec![],
            )
        }
    }

    impl Signer for MockApp {
        fn sign(&self, _message: &[u8]) -> Vec<u8> {
            vec![]
        }
        fn sign_proposal(&self, proposal: &Proposal) -> concord_types::Signature {
            concord_types::Signature {
                id: self.id,
                value: vec![],
                msg: commit_envelope(proposal),
            }
        }
    }

    impl Verifier for MockApp {
        fn verify_proposal(
            &self,
            proposal: &Proposal,
        ) -> Result<Vec<RequestInfo>, VerificationError> {
            let requests: Vec<Vec<u8>> = postcard::from_bytes(&proposal.payload)
                .map_err(|_| VerificationError::new("malformed payload"))?;
            Ok(requests.iter().map(|raw| self.request_id(raw)).collect())
        }
        fn verify_request(&self, request: &[u8]) -> Result<RequestInfo, VerificationError> {
            let info = self.request_id(request);
            if self.revoked.lock().unwrap().contains(&info.id) {
                return Err(VerificationError::new("revoked"));
            }
            Ok(info)
        }
        fn verify_consenter_sig(
            &self,
            _signature: &concord_types::Signature,
            _proposal: &Proposal,
        ) -> Result<(), VerificationError> {
            Ok(())
        }
        fn verify_signature(
            &self,
            _signature: &concord_types::Signature,
        ) -> Result<(), VerificationError> {
            Ok(())
        }
        fn verification_sequence(&self) -> u64 {
            self.verification_sequence.load(Ordering::SeqCst)
        }
    }

    fn controller_for(self_id: u64, batch_size: usize) -> (Controller, Arc<MockApp>) {
        let app = MockApp::new(NodeId(self_id));
        let context = NodeContext {
            signer: app.clone(),
            verifier: app.clone(),
            inspector: app.clone(),
            assembler: app.clone(),
        };
        let config = Config {
            batch_size,
            batch_timeout: Duration::from_millis(100),
            pool: PoolOptions::default(),
            ..Config::default()
        };
        let nodes: Vec<NodeId> = (0..4).map(NodeId).collect();
        let mut controller = Controller::new(
            NodeId(self_id),
            nodes,
            config,
            context,
            RecoveredState::default(),
        );
        controller.set_time(Duration::ZERO);
        controller.start();
        (controller, app)
    }

    fn pre_prepare_in(actions: &[Action]) -> Option<PrePrepare> {
        actions.iter().find_map(|a| match a {
            Action::Broadcast {
                message: Message::PrePrepare(pp),
            } => Some(pp.clone()),
            _ => None,
        })
    }

    fn prepare_from(id: u64, digest: Digest) -> Event {
        let tbs = prepare_tbs(0, 1, &digest);
        Event::MessageReceived {
            from: NodeId(id),
            message: Message::Prepare(Prepare {
                view: 0,
                seq: 1,
                digest,
                signature: concord_types::Signature {
                    id: NodeId(id),
                    value: vec![],
                    msg: tbs,
                },
            }),
        }
    }

    fn commit_from(id: u64, digest: Digest) -> Event {
        Event::MessageReceived {
            from: NodeId(id),
            message: Message::Commit(Commit {
                view: 0,
                seq: 1,
                digest,
                signature: concord_types::Signature {
                    id: NodeId(id),
                    value: vec![],
                    msg: vec![],
                },
                assist: false,
            }),
        }
    }

    #[test]
    fn duplicate_submission_is_a_typed_error() {
        let (mut controller, _) = controller_for(1, 10);
        let (result, _) = controller.submit_request(b"r1".to_vec());
        assert!(result.is_ok());
        let (result, _) = controller.submit_request(b"r1".to_vec());
        assert!(matches!(result, Err(SubmitError::Duplicate(_))));
    }

    #[test]
    fn leader_token_allows_one_outstanding_proposal() {
        let (mut controller, _) = controller_for(0, 1);

        let (result, actions) = controller.submit_request(b"r1".to_vec());
        assert!(result.is_ok());
        assert!(pre_prepare_in(&actions).is_some(), "leader proposes at once");

        // The token is held until the decision delivers; a second full
        // batch must wait.
        let (result, actions) = controller.submit_request(b"r2".to_vec());
        assert!(result.is_ok());
        assert!(pre_prepare_in(&actions).is_none());
    }

    #[test]
    fn follower_does_not_propose() {
        let (mut controller, _) = controller_for(1, 1);
        let (_, actions) = controller.submit_request(b"r1".to_vec());
        assert!(pre_prepare_in(&actions).is_none());
    }

    #[test]
    fn batch_timeout_cuts_a_partial_batch() {
        let (mut controller, _) = controller_for(0, 10);

        let (_, actions) = controller.submit_request(b"r1".to_vec());
        assert!(pre_prepare_in(&actions).is_none());
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SetTimer {
                id: TimerId::BatchTimeout,
                ..
            }
        )));

        controller.set_time(Duration::from_millis(150));
        let actions = controller.handle(Event::Tick {
            id: TimerId::BatchTimeout,
        });
        let pre_prepare = pre_prepare_in(&actions).expect("partial batch proposed");
        let requests: Vec<Vec<u8>> =
            postcard::from_bytes(&pre_prepare.proposal.payload).unwrap();
        assert_eq!(requests, vec![b"r1".to_vec()]);
    }

    #[test]
    fn delivery_prunes_revoked_requests_and_rearms_the_token() {
        let (mut controller, app) = controller_for(0, 1);

        // r1 goes into the outstanding proposal, r2 stays pooled.
        let (_, actions) = controller.submit_request(b"r1".to_vec());
        let digest = pre_prepare_in(&actions).unwrap().proposal.digest();
        controller.submit_request(b"r2".to_vec());
        assert_eq!(controller.pool_size(), 2);

        // r2 is revoked while the decision is in flight.
        app.revoke("r2");

        // Drive the quorum: two peers prepare and commit.
        controller.handle(prepare_from(1, digest));
        controller.handle(prepare_from(2, digest));
        controller.handle(commit_from(1, digest));
        let actions = controller.handle(commit_from(2, digest));
        assert!(actions.iter().any(|a| matches!(a, Action::Deliver { .. })));

        let actions = controller.handle(Event::DeliveryAcknowledged);

        // r1 was delivered, r2 was revoked: the pool is empty and the
        // re-armed token finds nothing to propose.
        assert_eq!(controller.pool_size(), 0);
        assert!(pre_prepare_in(&actions).is_none());
        assert_eq!(controller.stats().decisions, 1);
        assert_eq!(controller.sequence(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let (mut controller, _) = controller_for(0, 1);
        let actions = controller.handle(Event::Stop);
        assert!(!actions.is_empty());
        let actions = controller.handle(Event::Stop);
        assert!(actions.is_empty());

        let (_, actions) = controller.submit_request(b"r1".to_vec());
        assert!(actions.is_empty(), "a stopped replica proposes nothing");
    }
}
