//! Lattice durability - write-ahead log, snapshots and recovery.
//!
//! This crate turns graph mutations into durable, replayable, hash-verified
//! records and back:
//!
//! - [`HashedWriter`] / [`HashedReader`]: append-only framed I/O with a
//!   64-bit rolling hash over every byte
//! - [`Encoder`] / [`Decoder`]: self-describing primitive codec (tagged
//!   ints, strings, lists, property values)
//! - [`StateDelta`]: one mutation record, the unit shared by the WAL and
//!   the Raft-replicated command stream
//! - [`WalWriter`]: per-transaction buffered record stream with
//!   fsync-on-commit
//! - [`make_snapshot`]: consistent point-in-time dump plus retention of
//!   snapshots and superseded WAL segments
//! - [`recover`]: snapshot-then-WAL replay, hash-verified, idempotent
//!
//! # Design Principles (`TigerStyle`)
//!
//! - **Crash safety**: every committed transaction survives a crash
//! - **Checksums**: a rolling hash chains every record to its predecessors
//! - **Explicit limits**: bounded record sizes, named constants
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod codec;
mod delta;
mod error;
mod hashed_io;
mod recovery;
mod snapshot;
mod wal;

pub use codec::{Decoder, Encoder};
pub use delta::{DeltaKind, StateDelta};
pub use error::{DurabilityError, DurabilityResult};
pub use hashed_io::{HashedReader, HashedWriter};
pub use recovery::{recover, RecoveredState};
pub use snapshot::{
    make_snapshot, parse_snapshot_filename, snapshot_dir, wal_dir, DURABILITY_VERSION,
    SNAPSHOT_MAGIC,
};
pub use wal::{parse_wal_filename, WalConfig, WalWriter};

/// Durability configuration limits.
pub mod limits {
    /// Maximum length of an encoded string, in bytes (16 MB).
    pub const STRING_LENGTH_BYTES_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum element count of an encoded list or map.
    pub const CONTAINER_LENGTH_MAX: u32 = 16 * 1024 * 1024;

    /// Maximum size of a WAL segment before rotation (64 MB).
    pub const WAL_SEGMENT_SIZE_BYTES_MAX: u64 = 64 * 1024 * 1024;

    /// Maximum age of a WAL segment before rotation, in seconds.
    pub const WAL_SEGMENT_AGE_SECONDS_MAX: u64 = 300;
}
