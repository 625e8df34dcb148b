//! Restart-from-log scenarios.
//!
//! A restarted replica is rebuilt from its write-ahead log and the
//! application's last delivered decision, and must produce the same
//! subsequent delivery stream it would have produced without the restart.

use concord_pool::PoolOptions;
use concord_simulation::{NetworkConfig, SimulationConfig, SimulationRunner, TestRequest};
use std::time::Duration;

fn recovery_config() -> SimulationConfig {
    SimulationConfig {
        network: NetworkConfig {
            latency: Duration::from_millis(10),
            jitter_fraction: 0.0,
            packet_loss_rate: 0.0,
            num_nodes: 4,
        },
        replica: concord_bft::Config {
            batch_size: 10,
            batch_timeout: Duration::from_millis(20),
            pool: PoolOptions {
                capacity: 200,
                request_timeout: Duration::from_millis(100),
                leader_forward_timeout: Duration::from_secs(2),
                auto_remove_timeout: Duration::from_secs(30),
            },
            pool_tick_interval: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(2),
            resend_interval: Duration::from_millis(500),
            view_change_timeout: Duration::from_secs(4),
        },
    }
}

fn request(id: &str) -> TestRequest {
    TestRequest::new(id, "alice")
}

fn assert_identical_streams(runner: &SimulationRunner, nodes: &[u32]) {
    let reference = runner.records(nodes[0]);
    for &node in &nodes[1..] {
        assert_eq!(reference, runner.records(node), "node {} diverged", node);
    }
}

#[test]
fn restarted_followers_rejoin_the_stream() {
    let mut runner = SimulationRunner::new(recovery_config(), 42);
    runner.start();

    runner.submit(0, &request("1"));
    runner.run_for(Duration::from_secs(2));
    for node in 0..4 {
        assert_eq!(runner.delivered(node).len(), 1, "node {}", node);
    }

    runner.restart_node(2);
    runner.submit(0, &request("2"));
    runner.run_for(Duration::from_secs(3));

    runner.restart_node(3);
    runner.submit(0, &request("3"));
    runner.run_for(Duration::from_secs(3));

    assert_identical_streams(&runner, &[0, 1, 2, 3]);
    assert_eq!(runner.delivered(0).len(), 3);
}

#[test]
fn restarted_leader_keeps_leading() {
    let mut runner = SimulationRunner::new(recovery_config(), 42);
    runner.start();

    runner.submit(0, &request("1"));
    runner.run_for(Duration::from_secs(2));
    assert_eq!(runner.delivered(0).len(), 1);

    runner.restart_node(0);
    runner.run_for(Duration::from_secs(1));
    assert!(runner.node(0).is_leader(), "view 0 leadership survives restart");
    assert_eq!(runner.node(0).sequence(), 2, "resumes at the next sequence");

    runner.submit(0, &request("2"));
    runner.run_for(Duration::from_secs(3));

    assert_identical_streams(&runner, &[0, 1, 2, 3]);
    assert_eq!(runner.delivered(0).len(), 2);
}

#[test]
fn restart_is_idempotent_for_the_stream() {
    // Two identical clusters; one restarts every follower between
    // decisions. The delivery streams must match exactly.
    let mut control = SimulationRunner::new(recovery_config(), 42);
    let mut restarting = SimulationRunner::new(recovery_config(), 42);
    control.start();
    restarting.start();

    for i in 1..=3 {
        let req = request(&i.to_string());
        control.submit(0, &req);
        restarting.submit(0, &req);
        control.run_for(Duration::from_secs(2));
        restarting.run_for(Duration::from_secs(2));

        for node in 1..4 {
            restarting.restart_node(node);
        }
        restarting.run_for(Duration::from_secs(1));
        control.run_for(Duration::from_secs(1));
    }

    assert_eq!(control.records(0), restarting.records(0));
    assert_identical_streams(&restarting, &[0, 1, 2, 3]);
}
