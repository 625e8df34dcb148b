//! The replica event loop.

use crate::ticker::TickDemultiplexer;
use crate::timers::TimerManager;
use concord_bft::{restore, Config, Controller, NodeContext};
use concord_core::{Action, Application, Comm, Event, StateMachine, Synchronizer};
use concord_messages::Message;
use concord_types::NodeId;
use concord_wal::{WalError, WriteAheadLog};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a replica needs from its embedding.
pub struct ReplicaArgs {
    pub id: NodeId,
    pub config: Config,
    pub context: NodeContext,
    /// Transport; also presents the static membership.
    pub comm: Arc<dyn Comm>,
    pub application: Arc<dyn Application>,
    pub synchronizer: Arc<dyn Synchronizer>,
    pub wal: Box<dyn WriteAheadLog>,
    /// Period of the single clock driving the recurring protocol ticks.
    pub tick_period: Duration,
}

/// A running replica.
///
/// Feed inbound traffic through [`handle_message`](Self::handle_message)
/// and [`handle_request`](Self::handle_request); submit client requests
/// through [`submit_request`](Self::submit_request). [`stop`](Self::stop)
/// is a clean, idempotent-at-the-protocol-level shutdown.
pub struct Replica {
    event_tx: mpsc::Sender<Event>,
    ticker: Option<TickDemultiplexer>,
    handle: Option<JoinHandle<()>>,
}

impl Replica {
    /// Recover from the log and start the event loop.
    pub fn spawn(args: ReplicaArgs) -> Result<Self, WalError> {
        let records = args.wal.read_all()?;
        let recovered = restore(&records);
        info!(
            id = %args.id,
            view = recovered.view,
            sequence = recovered.sequence,
            log_records = records.len(),
            "Spawning replica"
        );

        let controller = Controller::new(
            args.id,
            args.comm.nodes(),
            args.config,
            args.context,
            recovered,
        );

        let (event_tx, event_rx) = mpsc::channel(1024);
        let ticker = TickDemultiplexer::with_wall_clock(args.tick_period, event_tx.clone());

        let event_loop = EventLoop {
            id: args.id,
            controller,
            wal: args.wal,
            comm: args.comm,
            application: args.application,
            synchronizer: args.synchronizer,
            timers: TimerManager::new(event_tx.clone()),
            event_tx: event_tx.clone(),
            internal: VecDeque::new(),
            started: Instant::now(),
        };
        let handle = tokio::spawn(event_loop.run(event_rx));

        Ok(Self {
            event_tx,
            ticker: Some(ticker),
            handle: Some(handle),
        })
    }

    /// Submit a client request for total ordering.
    pub async fn submit_request(&self, request: Vec<u8>) {
        let _ = self.event_tx.send(Event::SubmitRequest { request }).await;
    }

    /// Feed a consensus message received from the transport.
    pub async fn handle_message(&self, from: NodeId, message: Message) {
        let _ = self
            .event_tx
            .send(Event::MessageReceived { from, message })
            .await;
    }

    /// Feed a request forwarded by another replica.
    pub async fn handle_request(&self, from: NodeId, request: Vec<u8>) {
        let _ = self
            .event_tx
            .send(Event::RequestReceived { from, request })
            .await;
    }

    /// Stop the replica and wait for the event loop to drain.
    pub async fn stop(mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.stop();
        }
        let _ = self.event_tx.send(Event::Stop).await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

struct EventLoop {
    id: NodeId,
    controller: Controller,
    wal: Box<dyn WriteAheadLog>,
    comm: Arc<dyn Comm>,
    application: Arc<dyn Application>,
    synchronizer: Arc<dyn Synchronizer>,
    timers: TimerManager,
    event_tx: mpsc::Sender<Event>,
    /// Internal events drain before the next external event, preserving
    /// causality.
    internal: VecDeque<Event>,
    started: Instant,
}

impl EventLoop {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Event>) {
        self.controller.set_time(self.started.elapsed());
        let actions = self.controller.start();
        self.execute_all(actions);
        self.drain_internal();

        while let Some(event) = event_rx.recv().await {
            let stopping = matches!(event, Event::Stop);
            self.dispatch(event);
            self.drain_internal();
            if stopping {
                break;
            }
        }

        self.timers.cancel_all();
        info!(id = %self.id, "Replica event loop exited");
    }

    fn dispatch(&mut self, event: Event) {
        self.controller.set_time(self.started.elapsed());
        let actions = self.controller.handle(event);
        self.execute_all(actions);
    }

    fn drain_internal(&mut self) {
        while let Some(event) = self.internal.pop_front() {
            self.dispatch(event);
        }
    }

    fn execute_all(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for node in self.comm.nodes() {
                    if node != self.id {
                        self.comm.send_consensus(node, message.clone());
                    }
                }
            }

            Action::SendConsensus { to, message } => {
                self.comm.send_consensus(to, message);
            }

            Action::ForwardRequest { to, request } => {
                self.comm.send_transaction(to, request);
            }

            Action::SetTimer { id, duration } => {
                self.timers.set_timer(id, duration);
            }

            Action::CancelTimer { id } => {
                self.timers.cancel_timer(id);
            }

            // A replica that cannot persist must not keep talking; crash
            // and restart from disk truth.
            Action::Persist { record } => {
                if let Err(err) = self.wal.append(record) {
                    panic!("write-ahead log append failed: {err}");
                }
            }

            Action::TruncateLog { index } => {
                if let Err(err) = self.wal.truncate_to(index) {
                    panic!("write-ahead log truncation failed: {err}");
                }
            }

            Action::Deliver {
                proposal,
                signatures,
                ..
            } => {
                self.application.deliver(proposal, signatures);
                self.internal.push_back(Event::DeliveryAcknowledged);
            }

            Action::EnqueueInternal { event } => {
                self.internal.push_back(event);
            }

            Action::RequestSync => {
                let synchronizer = Arc::clone(&self.synchronizer);
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    match tokio::task::spawn_blocking(move || synchronizer.sync()).await {
                        Ok((proposal, signatures)) => {
                            let _ = event_tx
                                .send(Event::SyncCompleted {
                                    proposal,
                                    signatures,
                                })
                                .await;
                        }
                        Err(err) => warn!(?err, "Synchronizer task failed"),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_bft::commit_envelope;
    use concord_core::{
        Assembler, RequestInspector, Signer, VerificationError, Verifier,
    };
    use concord_types::{Proposal, RequestInfo, Signature};
    use concord_wal::MemoryWal;
    use parking_lot::Mutex;

    /// Single-replica collaborators: everything is trivial and local.
    struct Loopback {
        id: NodeId,
        delivered: Mutex<Vec<Proposal>>,
    }

    impl Comm for Loopback {
        fn send_consensus(&self, _to: NodeId, _message: Message) {}
        fn send_transaction(&self, _to: NodeId, _request: Vec<u8>) {}
        fn nodes(&self) -> Vec<NodeId> {
            vec![self.id]
        }
    }

    impl Application for Loopback {
        fn deliver(&self, proposal: Proposal, _signatures: Vec<Signature>) {
            self.delivered.lock().push(proposal);
        }
    }

    impl Synchronizer for Loopback {
        fn sync(&self) -> (Proposal, Vec<Signature>) {
            (Proposal::default(), vec![])
        }
    }

    impl RequestInspector for Loopback {
        fn request_id(&self, request: &[u8]) -> RequestInfo {
            RequestInfo::new("client", String::from_utf8_lossy(request))
        }
    }

    impl Assembler for Loopback {
        fn assemble_proposal(
            &self,
            metadata: &[u8],
            requests: Vec<Vec<u8>>,
        ) -> (Proposal, Vec<Vec<u8>>) {
            (
                Proposal {
                    payload: requests.concat(),
                    metadata: metadata.to_vec(),
                    header: vec![],
                    verification_sequence: 0,
                },
                vec![],
            )
        }
    }

    impl Signer for Loopback {
        fn sign(&self, _message: &[u8]) -> Vec<u8> {
            vec![]
        }
        fn sign_proposal(&self, proposal: &Proposal) -> Signature {
            Signature {
                id: self.id,
                value: vec![],
                msg: commit_envelope(proposal),
            }
        }
    }

    impl Verifier for Loopback {
        fn verify_proposal(
            &self,
            proposal: &Proposal,
        ) -> Result<Vec<RequestInfo>, VerificationError> {
            // Batches are a single request here (batch_size = 1).
            Ok(vec![self.request_id(&proposal.payload)])
        }
        fn verify_request(&self, request: &[u8]) -> Result<RequestInfo, VerificationError> {
            Ok(self.request_id(request))
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

    /// A cluster of one is a degenerate but complete consensus instance:
    /// the quorum is one, so a submission walks all three phases locally
    /// and reaches the application.
    #[tokio::test]
    async fn single_replica_orders_and_delivers() {
        let id = NodeId(0);
        let loopback = Arc::new(Loopback {
            id,
            delivered: Mutex::new(Vec::new()),
        });

        let config = Config {
            batch_size: 1,
            batch_timeout: Duration::from_millis(10),
            ..Config::default()
        };
        let replica = Replica::spawn(ReplicaArgs {
            id,
            config,
            context: NodeContext {
                signer: loopback.clone(),
                verifier: loopback.clone(),
                inspector: loopback.clone(),
                assembler: loopback.clone(),
            },
            comm: loopback.clone(),
            application: loopback.clone(),
            synchronizer: loopback.clone(),
            wal: Box::new(MemoryWal::new()),
            tick_period: Duration::from_millis(50),
        })
        .expect("spawn");

        replica.submit_request(b"r1".to_vec()).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if !loopback.delivered.lock().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "decision never delivered");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        replica.stop().await;
        assert_eq!(loopback.delivered.lock().len(), 1);
    }
}
