//! Lattice Tests - cross-crate integration and simulation tests.
//!
//! Tests are organised by subsystem:
//!
//! - `cluster`: a deterministic message-shuttling harness over pure Raft
//!   peers, for partition and election scenarios with no I/O
//! - `raft_tests`: Raft safety and liveness properties over the harness
//! - `durability_tests`: end-to-end crash, recovery, retention and hash
//!   integrity scenarios against real files
//! - `ha_tests`: whole-server replication over live loopback sockets

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cluster;

#[cfg(test)]
mod ha_tests;
#[cfg(test)]
mod raft_tests;
