//! Lattice server - commit orchestration over WAL and Raft.
//!
//! This crate wires the durable state-replication core together: a
//! mutating transaction's deltas fan out to the write-ahead log and the
//! Raft replicated log, commits are acknowledged only once durable (and,
//! with HA enabled, replicated to a majority), and a background
//! snapshotter bounds recovery time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod coordinator;
mod error;
mod network;

pub use config::{DurabilityOptions, RaftOptions, RpcOptions, ServerConfig};
pub use coordinator::Coordinator;
pub use error::{ServerError, ServerResult};
pub use network::{request_envelope, response_message, PeerChannel};
