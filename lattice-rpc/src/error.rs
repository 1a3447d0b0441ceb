//! Transport error types.

use thiserror::Error;

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced by the peer transport.
///
/// Raft interprets every one of these as "call failed, no reply" and lets
/// its timers resolve the situation; no retry happens at this layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// No reply arrived within the call timeout.
    #[error("rpc call timed out after {waited_ms}ms")]
    Timeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The call was aborted from another thread.
    #[error("rpc call aborted")]
    Aborted,

    /// Connection or wire-level failure.
    #[error("rpc transport failure: {message}")]
    Transport {
        /// What went wrong.
        message: String,
    },
}

impl RpcError {
    /// Creates a transport error from any displayable cause.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RpcError::Timeout { waited_ms: 250 };
        assert_eq!(format!("{err}"), "rpc call timed out after 250ms");

        let err = RpcError::transport("connection reset");
        assert!(format!("{err}").contains("connection reset"));
    }
}
