//! Raft peer configuration.

use std::time::Duration;

use lattice_core::NodeId;

use crate::limits::{CLUSTER_SIZE_MAX, ELECTION_TIMEOUT_MS_MAX, ELECTION_TIMEOUT_MS_MIN};

/// Configuration for a Raft peer.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This peer's ID.
    pub node_id: NodeId,

    /// IDs of all peers in the replication group (including this one).
    pub cluster: Vec<NodeId>,

    /// Lower bound of the randomised election timeout.
    pub election_timeout_min: Duration,

    /// Upper bound of the randomised election timeout.
    pub election_timeout_max: Duration,

    /// Fixed heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Seed for the election timeout randomness, for deterministic tests.
    pub seed: u64,
}

impl RaftConfig {
    /// Creates a new Raft configuration with default timing.
    ///
    /// # Panics
    /// Panics if the cluster is empty or too large, or if this peer is not
    /// in the cluster.
    #[must_use]
    pub fn new(node_id: NodeId, cluster: Vec<NodeId>) -> Self {
        assert!(!cluster.is_empty(), "cluster cannot be empty");
        assert!(
            cluster.len() <= CLUSTER_SIZE_MAX,
            "cluster size {} exceeds maximum {}",
            cluster.len(),
            CLUSTER_SIZE_MAX
        );
        assert!(cluster.contains(&node_id), "node_id must be in cluster");

        Self {
            node_id,
            cluster,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            seed: node_id.get(),
        }
    }

    /// Returns the number of peers in the group.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster.len()
    }

    /// Returns the quorum size (majority).
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Returns the other peers in the group (excluding this one).
    #[must_use]
    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// Sets a custom election timeout window, in milliseconds.
    ///
    /// # Panics
    /// Panics if min > max or values are out of the valid range.
    #[must_use]
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        assert!(min_ms <= max_ms, "min must be <= max");
        assert!(min_ms >= ELECTION_TIMEOUT_MS_MIN, "min_ms below minimum allowed");
        assert!(max_ms <= ELECTION_TIMEOUT_MS_MAX, "max_ms above maximum allowed");

        self.election_timeout_min = Duration::from_millis(min_ms);
        self.election_timeout_max = Duration::from_millis(max_ms);
        self
    }

    /// Sets the heartbeat interval, in milliseconds.
    #[must_use]
    pub const fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval = Duration::from_millis(ms);
        self
    }

    /// Sets the randomness seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cluster.is_empty() {
            return Err("cluster cannot be empty");
        }
        if self.cluster.len() > CLUSTER_SIZE_MAX {
            return Err("cluster too large");
        }
        if !self.cluster.contains(&self.node_id) {
            return Err("node_id not in cluster");
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err("election timeout min > max");
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat interval must be less than election timeout");
        }
        Ok(())
    }
}
