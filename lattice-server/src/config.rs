//! Server configuration.
//!
//! The recognised options, grouped the way they arrive from the command
//! line: durability (directory, snapshot cadence and retention), Raft
//! timing, and transport.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use lattice_core::{NodeId, WorkerId};

use crate::error::{ServerError, ServerResult};

/// Durability options.
#[derive(Debug, Clone)]
pub struct DurabilityOptions {
    /// Base directory; `snapshots/` and `wal/` live underneath.
    pub durability_dir: PathBuf,
    /// Cap on retained snapshot files; -1 keeps all of them.
    pub snapshot_max_retained: i64,
    /// Checkpoint cadence.
    pub snapshot_period: Duration,
}

impl DurabilityOptions {
    /// Creates options with default retention and cadence.
    #[must_use]
    pub fn new(durability_dir: impl Into<PathBuf>) -> Self {
        Self {
            durability_dir: durability_dir.into(),
            snapshot_max_retained: 3,
            snapshot_period: Duration::from_secs(300),
        }
    }
}

/// Raft timing options.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Lower bound of the randomised election window, in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Upper bound of the randomised election window, in milliseconds.
    pub election_timeout_max_ms: u64,
    /// Heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// How long a leader waits for a commit to reach a majority before
    /// aborting the transaction with a retryable error.
    pub commit_timeout: Duration,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            commit_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport options.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Per-call timeout, in milliseconds.
    pub call_timeout_ms: u64,
    /// Count of session worker threads in the transport server.
    pub workers: usize,
    /// Development-only simulated call latency, in milliseconds. Never
    /// enabled by default; production configurations leave this unset.
    pub debug_simulated_latency_ms: Option<u64>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            call_timeout_ms: 1000,
            workers: 4,
            debug_simulated_latency_ms: None,
        }
    }
}

/// Complete configuration of one Lattice peer.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This peer's id in the replication group.
    pub node_id: NodeId,
    /// This peer's storage worker id.
    pub worker_id: WorkerId,
    /// Address the peer transport listens on.
    pub listen_addr: SocketAddr,
    /// All peers in the group, including this one. A single entry means
    /// HA-off single-node mode.
    pub peers: Vec<(NodeId, SocketAddr)>,
    /// Durability options.
    pub durability: DurabilityOptions,
    /// Raft timing options.
    pub raft: RaftOptions,
    /// Transport options.
    pub rpc: RpcOptions,
}

impl ServerConfig {
    /// Creates a single-node configuration.
    #[must_use]
    pub fn single_node(
        node_id: NodeId,
        worker_id: WorkerId,
        listen_addr: SocketAddr,
        durability_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id,
            worker_id,
            listen_addr,
            peers: vec![(node_id, listen_addr)],
            durability: DurabilityOptions::new(durability_dir),
            raft: RaftOptions::default(),
            rpc: RpcOptions::default(),
        }
    }

    /// Returns true when replication is active (more than one peer).
    #[must_use]
    pub fn ha_enabled(&self) -> bool {
        self.peers.len() > 1
    }

    /// Returns the ids of every peer in the group.
    #[must_use]
    pub fn cluster(&self) -> Vec<NodeId> {
        self.peers.iter().map(|(id, _)| *id).collect()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `Config` describing the first problem found.
    pub fn validate(&self) -> ServerResult<()> {
        if self.peers.is_empty() {
            return Err(ServerError::Config("peer list cannot be empty"));
        }
        if !self.peers.iter().any(|(id, _)| *id == self.node_id) {
            return Err(ServerError::Config("node_id must appear in the peer list"));
        }
        if self.raft.election_timeout_min_ms > self.raft.election_timeout_max_ms {
            return Err(ServerError::Config("election timeout min > max"));
        }
        if self.raft.heartbeat_interval_ms >= self.raft.election_timeout_min_ms {
            return Err(ServerError::Config(
                "heartbeat interval must undercut the election timeout",
            ));
        }
        if self.rpc.workers == 0 {
            return Err(ServerError::Config("at least one rpc worker is required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen() -> SocketAddr {
        "127.0.0.1:7687".parse().unwrap()
    }

    #[test]
    fn test_single_node_defaults() {
        let config =
            ServerConfig::single_node(NodeId::new(1), WorkerId::new(0), listen(), "/tmp/lattice");

        assert!(!config.ha_enabled());
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster(), vec![NodeId::new(1)]);
    }

    #[test]
    fn test_node_must_be_in_peers() {
        let mut config =
            ServerConfig::single_node(NodeId::new(1), WorkerId::new(0), listen(), "/tmp/lattice");
        config.peers = vec![(NodeId::new(2), listen())];

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_must_undercut_election() {
        let mut config =
            ServerConfig::single_node(NodeId::new(1), WorkerId::new(0), listen(), "/tmp/lattice");
        config.raft.heartbeat_interval_ms = 500;

        assert!(config.validate().is_err());
    }
}
