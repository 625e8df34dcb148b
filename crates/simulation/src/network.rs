//! Simulated network with deterministic latency, packet loss, and partitions.

use crate::runner::NodeIndex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way message latency.
    pub latency: Duration,
    /// Jitter as a fraction of base latency (0.0 - 1.0).
    pub jitter_fraction: f64,
    /// Packet loss rate (0.0 - 1.0). Messages are dropped with this
    /// probability.
    pub packet_loss_rate: f64,
    /// Number of replicas.
    pub num_nodes: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(10),
            jitter_fraction: 0.0,
            packet_loss_rate: 0.0,
            num_nodes: 4,
        }
    }
}

/// Simulated network for deterministic message delivery.
///
/// Supports configurable latency with jitter, probabilistic packet loss and
/// directional partitions.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Partitioned node pairs. If `(a, b)` is in this set, messages from
    /// `a` to `b` are dropped. Partitions are directional; both directions
    /// are inserted for a full cut.
    partitions: HashSet<(NodeIndex, NodeIndex)>,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
        }
    }

    // ─── Partition Management ───

    /// Whether a message from `from` to `to` would be dropped.
    pub fn is_partitioned(&self, from: NodeIndex, to: NodeIndex) -> bool {
        self.partitions.contains(&(from, to))
    }

    /// Block both directions between two nodes.
    pub fn partition_bidirectional(&mut self, a: NodeIndex, b: NodeIndex) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut a node off from everyone else.
    pub fn isolate_node(&mut self, node: NodeIndex) {
        for other in 0..self.config.num_nodes {
            if other != node {
                self.partitions.insert((node, other));
                self.partitions.insert((other, node));
            }
        }
    }

    /// Reconnect a node to everyone else.
    pub fn heal_node(&mut self, node: NodeIndex) {
        self.partitions
            .retain(|(a, b)| *a != node && *b != node);
    }

    /// Restore full connectivity.
    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    // ─── Message Delivery Decision ───

    /// `None` if the message is dropped (partition or loss), otherwise the
    /// sampled delivery latency.
    pub fn should_deliver(
        &self,
        from: NodeIndex,
        to: NodeIndex,
        rng: &mut ChaCha8Rng,
    ) -> Option<Duration> {
        if self.is_partitioned(from, to) {
            return None;
        }
        if self.config.packet_loss_rate > 0.0 && rng.gen::<f64>() < self.config.packet_loss_rate {
            return None;
        }
        Some(self.sample_latency(rng))
    }

    /// Sample a delivery latency.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.latency;
        let jitter_range = base.as_secs_f64() * self.config.jitter_fraction;
        if jitter_range <= 0.0 {
            return base;
        }
        let jitter = rng.gen_range(-jitter_range..jitter_range);
        Duration::from_secs_f64((base.as_secs_f64() + jitter).max(0.0001))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn partition_blocks_delivery() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        assert!(network.should_deliver(0, 1, &mut rng).is_some());

        network.partition_bidirectional(0, 1);
        assert!(network.should_deliver(0, 1, &mut rng).is_none());
        assert!(network.should_deliver(1, 0, &mut rng).is_none());
        assert!(network.should_deliver(0, 2, &mut rng).is_some());
    }

    #[test]
    fn isolate_and_heal() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate_node(0);
        assert!(network.is_partitioned(0, 3));
        assert!(network.is_partitioned(3, 0));
        assert!(!network.is_partitioned(1, 2));

        network.heal_node(0);
        assert_eq!(network.partition_count(), 0);
    }

    #[test]
    fn latency_is_deterministic_per_seed() {
        let network = SimulatedNetwork::new(NetworkConfig {
            jitter_fraction: 0.2,
            ..NetworkConfig::default()
        });
        let mut rng1 = ChaCha8Rng::seed_from_u64(7);
        let mut rng2 = ChaCha8Rng::seed_from_u64(7);
        assert_eq!(
            network.sample_latency(&mut rng1),
            network.sample_latency(&mut rng2)
        );
    }

    #[test]
    fn total_loss_drops_everything() {
        let network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 1.0,
            ..NetworkConfig::default()
        });
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..10 {
            assert!(network.should_deliver(0, 1, &mut rng).is_none());
        }
    }
}
