//! Raft persistent state.
//!
//! The log itself is durable through the WAL; what remains is the small
//! `(current_term, voted_for)` pair, which must hit stable storage before
//! a peer answers the RPC that changed it.

use bytes::{Buf, BufMut, BytesMut};
use lattice_core::{NodeId, TermId};

/// Persistent Raft state that must survive crashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistentState {
    /// Latest term this peer has seen (increases monotonically).
    pub current_term: TermId,
    /// Candidate that received this peer's vote in the current term.
    pub voted_for: Option<NodeId>,
}

impl PersistentState {
    /// Creates the initial state of a fresh peer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes the state to bytes.
    ///
    /// Format: term (8 bytes LE), presence flag (1 byte), vote (8 bytes LE
    /// when present).
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.current_term.get());
        match self.voted_for {
            Some(node_id) => {
                buf.put_u8(1);
                buf.put_u64_le(node_id.get());
            }
            None => {
                buf.put_u8(0);
            }
        }
    }

    /// Decodes state from bytes. Returns `None` if the buffer is invalid.
    #[must_use]
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < 9 {
            return None;
        }

        let current_term = TermId::new(buf.get_u64_le());
        let voted_for = match buf.get_u8() {
            0 => None,
            1 => {
                if buf.remaining() < 8 {
                    return None;
                }
                Some(NodeId::new(buf.get_u64_le()))
            }
            _ => return None,
        };

        Some(Self {
            current_term,
            voted_for,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_vote() {
        let state = PersistentState {
            current_term: TermId::new(5),
            voted_for: Some(NodeId::new(42)),
        };

        let mut buf = BytesMut::new();
        state.encode(&mut buf);

        let decoded = PersistentState::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_roundtrip_without_vote() {
        let state = PersistentState {
            current_term: TermId::new(3),
            voted_for: None,
        };

        let mut buf = BytesMut::new();
        state.encode(&mut buf);

        let decoded = PersistentState::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_short_buffer_rejected() {
        let buf = [0u8; 4];
        assert!(PersistentState::decode(&mut &buf[..]).is_none());
    }
}
