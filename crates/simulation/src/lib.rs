//! Deterministic simulation for concord consensus.
//!
//! A single-threaded runner drives a cluster of replica state machines over
//! a simulated network with latency, jitter, packet loss and partitions.
//! Given the same seed and inputs it produces identical results every run,
//! which is what the scenario and determinism tests build on.
//!
//! The crate also provides the harness application: trivial inspector,
//! assembler, signer and verifier implementations mirroring what a real
//! embedding supplies.

mod harness;
mod network;
mod runner;

pub use harness::{Batch, TestApp, TestRequest};
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{
    DeliveredDecision, NodeIndex, SimulationConfig, SimulationRunner, SimulationStats,
};
