//! Lattice Raft - replicated state for high availability.
//!
//! A Raft consensus implementation specialised to [`StateDelta`] as the
//! command type: the replicated log is the same record stream the WAL
//! persists, so a follower applies exactly what the leader's durability
//! layer wrote.
//!
//! The peer is a pure state machine: it takes inputs (messages, timer
//! fires, proposals) and produces outputs (messages to send, timers to
//! reset, entries to apply) but performs no I/O itself. This design
//! enables deterministic simulation testing.
//!
//! [`StateDelta`]: lattice_durability::StateDelta

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod log;
mod message;
mod state;
mod storage;

pub use config::RaftConfig;
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Message, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{RaftOutput, RaftPeer, RaftRole};
pub use storage::PersistentState;

/// Raft configuration limits.
pub mod limits {
    /// Maximum number of peers in a replication group.
    pub const CLUSTER_SIZE_MAX: usize = 7;

    /// Maximum number of entries in a single `AppendEntries` request.
    pub const APPEND_ENTRIES_BATCH_SIZE_MAX: usize = 1000;

    /// Minimum allowed election timeout, in milliseconds.
    pub const ELECTION_TIMEOUT_MS_MIN: u64 = 50;

    /// Maximum allowed election timeout, in milliseconds.
    pub const ELECTION_TIMEOUT_MS_MAX: u64 = 60_000;
}
