//! Deterministic simulation runner.
//!
//! Processes events in deterministic order and executes actions. Given the
//! same seed and inputs, produces identical results every run. Each replica
//! has its own in-memory write-ahead log and delivered-decision journal;
//! `Action::RequestSync` is served by replicating decisions from reachable
//! peers, the way an embedding application's synchronizer would.

use crate::harness::{TestApp, TestRequest};
use crate::network::{NetworkConfig, SimulatedNetwork};
use concord_bft::{restore, Config, Controller, ControllerStats, NodeContext};
use concord_core::{Action, Event, EventPriority, StateMachine, TimerId};
use concord_types::{NodeId, Proposal, Signature};
use concord_wal::{MemoryWal, WriteAheadLog};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Index of a replica in the simulation.
pub type NodeIndex = u32;

/// Deterministic ordering key: time, then priority, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EventKey {
    time: Duration,
    priority: EventPriority,
    seq: u64,
    node: NodeIndex,
}

/// A decision as the application observed it.
#[derive(Debug, Clone)]
pub struct DeliveredDecision {
    pub proposal: Proposal,
    pub signatures: Vec<Signature>,
}

impl DeliveredDecision {
    /// Sequence the decision carries.
    pub fn sequence(&self) -> u64 {
        self.proposal
            .view_metadata()
            .map(|md| md.latest_sequence)
            .unwrap_or(0)
    }

    /// The application-visible record: payload and metadata.
    pub fn record(&self) -> (Vec<u8>, Vec<u8>) {
        (self.proposal.payload.clone(), self.proposal.metadata.clone())
    }

    /// Decode the requests of the batch.
    pub fn requests(&self) -> Vec<TestRequest> {
        crate::harness::Batch::from_bytes(&self.proposal.payload)
            .map(|batch| {
                batch
                    .requests
                    .iter()
                    .filter_map(|raw| TestRequest::from_bytes(raw))
                    .collect()
            })
            .unwrap_or_default()
    }
}

struct NodeHarness {
    controller: Controller,
    wal: MemoryWal,
    app: Arc<TestApp>,
    delivered: Vec<DeliveredDecision>,
    running: bool,
}

/// Simulation parameters: the network and the replica configuration shared
/// by all nodes.
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub network: NetworkConfig,
    pub replica: Config,
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    pub events_processed: u64,
    pub actions_generated: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub timers_set: u64,
    pub timers_cancelled: u64,
    pub syncs_served: u64,
}

/// Deterministic simulation runner.
pub struct SimulationRunner {
    nodes: Vec<NodeHarness>,
    node_ids: Vec<NodeId>,
    event_queue: BTreeMap<EventKey, Event>,
    sequence: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// One-shot timers, for cancellation support.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,
    config: SimulationConfig,
    stats: SimulationStats,
}

impl SimulationRunner {
    pub fn new(config: SimulationConfig, seed: u64) -> Self {
        let num_nodes = config.network.num_nodes;
        let node_ids: Vec<NodeId> = (0..num_nodes).map(|i| NodeId(i as u64)).collect();

        let nodes = (0..num_nodes)
            .map(|i| {
                let app = Arc::new(TestApp::new(NodeId(i as u64)));
                let context = NodeContext {
                    signer: app.clone(),
                    verifier: app.clone(),
                    inspector: app.clone(),
                    assembler: app.clone(),
                };
                NodeHarness {
                    controller: Controller::new(
                        NodeId(i as u64),
                        node_ids.clone(),
                        config.replica.clone(),
                        context,
                        Default::default(),
                    ),
                    wal: MemoryWal::new(),
                    app,
                    delivered: Vec::new(),
                    running: true,
                }
            })
            .collect();

        info!(num_nodes, seed, "Created simulation runner");

        Self {
            nodes,
            node_ids,
            event_queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            network: SimulatedNetwork::new(config.network.clone()),
            rng: ChaCha8Rng::seed_from_u64(seed),
            timers: HashMap::new(),
            config,
            stats: SimulationStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn node(&self, index: NodeIndex) -> &Controller {
        &self.nodes[index as usize].controller
    }

    pub fn node_stats(&self, index: NodeIndex) -> ControllerStats {
        self.nodes[index as usize].controller.stats()
    }

    pub fn app(&self, index: NodeIndex) -> &Arc<TestApp> {
        &self.nodes[index as usize].app
    }

    /// Decisions delivered at a replica, in order.
    pub fn delivered(&self, index: NodeIndex) -> &[DeliveredDecision] {
        &self.nodes[index as usize].delivered
    }

    /// The application-visible delivery stream: `(payload, metadata)` pairs.
    pub fn records(&self, index: NodeIndex) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.nodes[index as usize]
            .delivered
            .iter()
            .map(DeliveredDecision::record)
            .collect()
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Control surface
    // ═══════════════════════════════════════════════════════════════════════

    /// Start every replica and arm the recurring ticks.
    pub fn start(&mut self) {
        for index in 0..self.nodes.len() as NodeIndex {
            self.start_node(index);
        }
    }

    fn start_node(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index as usize];
        node.controller.set_time(self.now);
        let actions = node.controller.start();
        self.process_actions(index, actions);
        self.schedule_recurring_ticks(index);
    }

    fn schedule_recurring_ticks(&mut self, index: NodeIndex) {
        let pool = self.config.replica.pool_tick_interval;
        let heartbeat = self.config.replica.heartbeat_interval;
        let resend = self.config.replica.resend_interval;
        self.schedule(index, self.now + pool, Event::Tick { id: TimerId::PoolTick });
        self.schedule(
            index,
            self.now + heartbeat,
            Event::Tick { id: TimerId::HeartbeatTick },
        );
        self.schedule(
            index,
            self.now + resend,
            Event::Tick { id: TimerId::ViewChangeResendTick },
        );
    }

    /// Submit a client request to a replica.
    pub fn submit(&mut self, index: NodeIndex, request: &TestRequest) {
        self.schedule(
            index,
            self.now,
            Event::SubmitRequest {
                request: request.to_bytes(),
            },
        );
    }

    /// Cut a replica off from the rest of the network.
    pub fn disconnect(&mut self, index: NodeIndex) {
        info!(node = index, "Disconnecting replica");
        self.network.isolate_node(index);
    }

    /// Reconnect a replica.
    pub fn connect(&mut self, index: NodeIndex) {
        info!(node = index, "Reconnecting replica");
        self.network.heal_node(index);
    }

    /// Stop a replica and drop everything queued for it.
    pub fn crash_node(&mut self, index: NodeIndex) {
        info!(node = index, "Crashing replica");
        self.nodes[index as usize].running = false;
        self.event_queue.retain(|key, _| key.node != index);
        self.timers.retain(|(node, _), _| *node != index);
    }

    /// Rebuild a replica from its write-ahead log and restart it.
    ///
    /// The delivered journal survives, like an application's ledger would;
    /// the last delivered decision seeds the checkpoint.
    pub fn restart_node(&mut self, index: NodeIndex) {
        self.crash_node(index);
        info!(node = index, "Restarting replica from its log");

        let node_ids = self.node_ids.clone();
        let replica_config = self.config.replica.clone();
        let node = &mut self.nodes[index as usize];
        let records = node.wal.read_all().expect("memory log reads cannot fail");
        let recovered = restore(&records);
        let context = NodeContext {
            signer: node.app.clone(),
            verifier: node.app.clone(),
            inspector: node.app.clone(),
            assembler: node.app.clone(),
        };
        node.controller = Controller::new(
            NodeId(index as u64),
            node_ids,
            replica_config,
            context,
            recovered,
        );
        if let Some(last) = node.delivered.last() {
            node.controller
                .set_checkpoint(last.proposal.clone(), last.signatures.clone());
        }
        node.running = true;
        self.start_node(index);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════════════════

    fn schedule(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time,
            priority: event.priority(),
            seq: self.sequence,
            node,
        };
        self.sequence += 1;
        self.event_queue.insert(key, event);
        key
    }

    /// Run until the queue drains or simulated time reaches `end_time`.
    pub fn run_until(&mut self, end_time: Duration) {
        while let Some((&key, _)) = self.event_queue.first_key_value() {
            if key.time > end_time {
                break;
            }
            let (key, event) = self.event_queue.pop_first().unwrap();
            self.now = key.time;
            let index = key.node;

            if !self.nodes[index as usize].running {
                continue;
            }

            // Recurring ticks re-arm themselves.
            if let Event::Tick { id } = &event {
                let interval = match id {
                    TimerId::PoolTick => Some(self.config.replica.pool_tick_interval),
                    TimerId::HeartbeatTick => Some(self.config.replica.heartbeat_interval),
                    TimerId::ViewChangeResendTick => Some(self.config.replica.resend_interval),
                    TimerId::BatchTimeout => None,
                };
                if let Some(interval) = interval {
                    let next = Event::Tick { id: *id };
                    self.schedule(index, self.now + interval, next);
                }
            }

            trace!(time = ?self.now, node = index, event = event.type_name(), "Processing event");
            self.stats.events_processed += 1;

            let node = &mut self.nodes[index as usize];
            node.controller.set_time(self.now);
            let actions = node.controller.handle(event);
            self.stats.actions_generated += actions.len() as u64;
            self.process_actions(index, actions);
        }
        self.now = self.now.max(end_time);
    }

    /// Run for a span of simulated time.
    pub fn run_for(&mut self, span: Duration) {
        self.run_until(self.now + span);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action execution
    // ═══════════════════════════════════════════════════════════════════════

    fn process_actions(&mut self, from: NodeIndex, actions: Vec<Action>) {
        for action in actions {
            self.process_action(from, action);
        }
    }

    fn process_action(&mut self, from: NodeIndex, action: Action) {
        match action {
            Action::Broadcast { message } => {
                for to in 0..self.nodes.len() as NodeIndex {
                    if to == from {
                        continue;
                    }
                    self.try_deliver(
                        from,
                        to,
                        Event::MessageReceived {
                            from: NodeId(from as u64),
                            message: message.clone(),
                        },
                    );
                }
            }

            Action::SendConsensus { to, message } => {
                let to = to.0 as NodeIndex;
                self.try_deliver(
                    from,
                    to,
                    Event::MessageReceived {
                        from: NodeId(from as u64),
                        message,
                    },
                );
            }

            Action::ForwardRequest { to, request } => {
                let to = to.0 as NodeIndex;
                self.try_deliver(
                    from,
                    to,
                    Event::RequestReceived {
                        from: NodeId(from as u64),
                        request,
                    },
                );
            }

            Action::SetTimer { id, duration } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                }
                let key = self.schedule(from, self.now + duration, Event::Tick { id });
                self.timers.insert((from, id), key);
                self.stats.timers_set += 1;
            }

            Action::CancelTimer { id } => {
                if let Some(key) = self.timers.remove(&(from, id)) {
                    self.event_queue.remove(&key);
                    self.stats.timers_cancelled += 1;
                }
            }

            Action::Persist { record } => {
                self.nodes[from as usize]
                    .wal
                    .append(record)
                    .expect("memory log appends cannot fail");
            }

            Action::TruncateLog { index } => {
                self.nodes[from as usize]
                    .wal
                    .truncate_to(index)
                    .expect("log truncation index out of range");
            }

            Action::Deliver {
                proposal,
                signatures,
                ..
            } => {
                let node = &mut self.nodes[from as usize];
                let sequence = proposal
                    .view_metadata()
                    .map(|md| md.latest_sequence)
                    .unwrap_or(0);
                let last = node.delivered.last().map(|d| d.sequence()).unwrap_or(0);
                if sequence > last {
                    debug!(node = from, sequence, "Delivering decision");
                    node.delivered.push(DeliveredDecision {
                        proposal,
                        signatures,
                    });
                } else {
                    debug!(node = from, sequence, last, "Skipping re-delivery after restart");
                }
                self.schedule(from, self.now, Event::DeliveryAcknowledged);
            }

            Action::EnqueueInternal { event } => {
                self.schedule(from, self.now, event);
            }

            Action::RequestSync => {
                self.serve_sync(from);
            }
        }
    }

    fn try_deliver(&mut self, from: NodeIndex, to: NodeIndex, event: Event) {
        if to as usize >= self.nodes.len() || !self.nodes[to as usize].running {
            self.stats.messages_dropped += 1;
            return;
        }
        match self.network.should_deliver(from, to, &mut self.rng) {
            Some(latency) => {
                self.stats.messages_sent += 1;
                self.schedule(to, self.now + latency, event);
            }
            None => {
                self.stats.messages_dropped += 1;
            }
        }
    }

    /// Serve `Action::RequestSync` the way an application synchronizer
    /// would: find the highest decision at least `f + 1` reachable peers
    /// agree on, replicate the missing decisions, and report the result.
    fn serve_sync(&mut self, from: NodeIndex) {
        let n = self.nodes.len() as u64;
        let f = (n as usize - 1) / 3;
        let own_len = self.nodes[from as usize].delivered.len();

        let reachable: Vec<NodeIndex> = (0..self.nodes.len() as NodeIndex)
            .filter(|&peer| {
                peer != from
                    && self.nodes[peer as usize].running
                    && !self.network.is_partitioned(from, peer)
                    && !self.network.is_partitioned(peer, from)
            })
            .collect();

        let mut lengths: Vec<usize> = reachable
            .iter()
            .map(|&peer| self.nodes[peer as usize].delivered.len())
            .collect();
        lengths.sort_unstable_by(|a, b| b.cmp(a));
        // The (f + 1)-th largest journal length is attested by f + 1 peers.
        let agreed = lengths.get(f).copied().unwrap_or(0);

        if agreed > own_len {
            let source = reachable
                .iter()
                .copied()
                .find(|&peer| self.nodes[peer as usize].delivered.len() >= agreed)
                .expect("an agreed length implies a peer holding it");
            let missing: Vec<DeliveredDecision> = self.nodes[source as usize].delivered
                [own_len..agreed]
                .to_vec();
            info!(
                node = from,
                source,
                decisions = missing.len(),
                "Synchronizer replicating missed decisions"
            );
            self.nodes[from as usize].delivered.extend(missing);
            self.stats.syncs_served += 1;
        } else {
            debug!(node = from, own_len, agreed, "Synchronizer found nothing newer");
        }

        let (proposal, signatures) = match self.nodes[from as usize].delivered.last() {
            Some(last) => (last.proposal.clone(), last.signatures.clone()),
            None => (Proposal::default(), vec![]),
        };
        self.schedule(
            from,
            self.now,
            Event::SyncCompleted {
                proposal,
                signatures,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> SimulationConfig {
        SimulationConfig {
            network: NetworkConfig {
                latency: Duration::from_millis(10),
                num_nodes: 4,
                ..NetworkConfig::default()
            },
            replica: Config {
                batch_size: 10,
                batch_timeout: Duration::from_millis(20),
                pool_tick_interval: Duration::from_millis(50),
                heartbeat_interval: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_secs(2),
                ..Config::default()
            },
        }
    }

    #[test]
    fn single_decision_reaches_all_replicas() {
        let mut runner = SimulationRunner::new(quick_config(), 42);
        runner.start();
        runner.submit(0, &TestRequest::new("1", "alice"));
        runner.run_for(Duration::from_secs(2));

        for node in 0..4 {
            let delivered = runner.delivered(node);
            assert_eq!(delivered.len(), 1, "node {} delivered", node);
            assert_eq!(delivered[0].requests(), vec![TestRequest::new("1", "alice")]);
        }
    }

    #[test]
    fn steady_state_keeps_replicas_identical() {
        let mut runner = SimulationRunner::new(quick_config(), 7);
        runner.start();
        for i in 0..5 {
            runner.submit(0, &TestRequest::new(i.to_string(), "alice"));
            runner.run_for(Duration::from_millis(500));
        }
        assert!(!runner.delivered(0).is_empty());
        for node in 1..4 {
            assert_eq!(runner.records(0), runner.records(node));
        }
    }
}
