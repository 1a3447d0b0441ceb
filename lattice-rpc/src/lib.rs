//! Lattice RPC - the peer-to-peer transport for HA replication.
//!
//! A typed request/response channel per peer, keyed by a channel name.
//! Raft RPC requests and responses are wrapped in [`PeerRpcRequest`] and
//! [`PeerRpcReply`] wide records.
//!
//! Guarantees:
//!
//! - **At most one outstanding call per client instance**; concurrent
//!   callers serialise at the client mutex.
//! - A pending call may be aborted from another thread, which closes the
//!   socket and returns a failure to the caller.
//! - Calls are timeout-bounded; the timeout starts when bytes are first
//!   written.
//!
//! The scheduling model is blocking and thread-per-connection: the server
//! runs a fixed pool of worker threads with connections assigned
//! round-robin on accept.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod server;
mod wire;

pub use client::RpcClient;
pub use error::{RpcError, RpcResult};
pub use server::{RpcHandler, RpcServer};
pub use wire::{PeerRpcReply, PeerRpcRequest, RpcTag, RAFT_CHANNEL_NAME};

/// Transport limits.
pub mod limits {
    /// Maximum size of one RPC frame (16 MB).
    pub const FRAME_SIZE_BYTES_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum length of a channel name in the connection preamble.
    pub const CHANNEL_NAME_LENGTH_MAX: usize = 255;
}
