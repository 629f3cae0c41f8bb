//! Orbit Tests - Multi-component test harness.
//!
//! Assembles a satellite, a set of storage nodes, and an uplink over the
//! in-memory transport so end-to-end scenarios run in one process.

#![deny(unsafe_code)]

pub mod harness;

pub use harness::{TestNetwork, TestNetworkConfig, TestSatellite, TestStorageNode};
