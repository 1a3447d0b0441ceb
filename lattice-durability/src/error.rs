//! Durability error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for durability operations.
pub type DurabilityResult<T> = Result<T, DurabilityError>;

/// Errors that can occur while encoding, persisting or replaying records.
#[derive(Debug, Error)]
pub enum DurabilityError {
    /// The stream ended before a complete value could be read.
    #[error("truncated read: needed {needed} more bytes")]
    Truncated {
        /// How many bytes were still required.
        needed: usize,
    },

    /// An unknown discriminator tag was encountered.
    #[error("bad tag {tag:#04x} while decoding {context}")]
    BadTag {
        /// The unknown tag value.
        tag: u8,
        /// What was being decoded.
        context: &'static str,
    },

    /// A record's trailing hash did not match the accumulated stream hash.
    #[error("corrupt record: stored hash {stored:#018x}, computed {computed:#018x}")]
    CorruptRecord {
        /// The hash stored in the stream.
        stored: u64,
        /// The hash accumulated by the reader.
        computed: u64,
    },

    /// A snapshot file carries an unexpected format version.
    #[error("snapshot version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version found in the file.
        found: i64,
        /// Version this build reads and writes.
        expected: i64,
    },

    /// The accessor refused a delta that should have been valid.
    #[error("apply failed: {reason}")]
    ApplyFatal {
        /// Why the delta could not be applied.
        reason: String,
    },

    /// I/O error from the underlying storage.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl DurabilityError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptRecord { .. } | Self::BadTag { .. } | Self::VersionMismatch { .. }
        )
    }

    /// Returns true if this error is tolerable at the tail of a WAL file
    /// (a torn write from a crash mid-append).
    #[must_use]
    pub const fn is_recoverable_tail(&self) -> bool {
        matches!(self, Self::Truncated { .. } | Self::CorruptRecord { .. })
    }
}
