//! Server error types.

use lattice_core::NodeId;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced to database clients and the boot path.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A write reached a peer that is not the leader.
    #[error("{}", not_leader_message(.leader_hint))]
    NotLeader {
        /// The current leader, if known.
        leader_hint: Option<NodeId>,
    },

    /// The leader could not replicate the commit to a majority within its
    /// timeout. The transaction was aborted; the client should retry.
    #[error("quorum lost, transaction aborted; retry")]
    QuorumLost,

    /// A committed delta could not be applied to the state machine.
    /// Treated as corruption; the peer halts.
    #[error("fatal apply failure: {reason}")]
    ApplyFatal {
        /// Why the apply failed.
        reason: String,
    },

    /// Durability failure (WAL, snapshot or recovery).
    #[error(transparent)]
    Durability(#[from] lattice_durability::DurabilityError),

    /// Transport failure.
    #[error(transparent)]
    Rpc(#[from] lattice_rpc::RpcError),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

impl ServerError {
    /// Returns true if the client may safely retry the operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::QuorumLost | Self::NotLeader { .. })
    }
}

fn not_leader_message(leader_hint: &Option<NodeId>) -> String {
    match leader_hint {
        Some(leader) => format!("not the leader, try {leader}"),
        None => "not the leader".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_leader_hint_display() {
        let err = ServerError::NotLeader {
            leader_hint: Some(NodeId::new(2)),
        };
        assert_eq!(format!("{err}"), "not the leader, try node-2");

        let err = ServerError::NotLeader { leader_hint: None };
        assert_eq!(format!("{err}"), "not the leader");
    }

    #[test]
    fn test_retryable() {
        assert!(ServerError::QuorumLost.is_retryable());
        assert!(!ServerError::ApplyFatal {
            reason: "x".into()
        }
        .is_retryable());
    }
}
