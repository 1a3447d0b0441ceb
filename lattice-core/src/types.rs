//! Strongly-typed identifiers for Lattice entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle large-scale deployments.

use std::fmt;

use crate::limits::{ADDRESS_WORKER_BITS, WORKER_ID_MAX};

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `TxId`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Cluster topology.
define_id!(NodeId, "node", "Unique identifier for a Lattice peer in the replication group.");
define_id!(WorkerId, "worker", "Unique identifier for a storage worker in the cluster.");

// Transactions.
define_id!(TxId, "tx", "Globally monotonic transaction identifier.");

// Graph entities.
define_id!(Gid, "gid", "Globally unique identifier of a vertex or edge on its owning worker.");

// Raft consensus.
define_id!(TermId, "term", "Raft term number for leader election.");
define_id!(LogIndex, "idx", "Index into the Raft log.");

/// Worker-qualified reference to a vertex or edge, valid across the cluster.
///
/// Durable records may only contain global addresses; a local (worker-less)
/// reference is not representable by this type. The address packs to a
/// single u64 with the worker id in the low [`ADDRESS_WORKER_BITS`] bits,
/// which is the form written to disk and to the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalAddress {
    /// The entity id on the owning worker.
    pub gid: Gid,
    /// The worker that owns the entity.
    pub worker: WorkerId,
}

impl GlobalAddress {
    /// Creates a new global address.
    ///
    /// # Panics
    /// Panics if the worker id does not fit in the packed representation.
    #[must_use]
    pub const fn new(gid: Gid, worker: WorkerId) -> Self {
        assert!(worker.get() <= WORKER_ID_MAX, "worker id exceeds address width");
        Self { gid, worker }
    }

    /// Returns the packed u64 form written to durable records.
    #[must_use]
    pub const fn raw(self) -> u64 {
        (self.gid.get() << ADDRESS_WORKER_BITS) | self.worker.get()
    }

    /// Reconstructs an address from its packed form.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            gid: Gid::new(raw >> ADDRESS_WORKER_BITS),
            worker: WorkerId::new(raw & WORKER_ID_MAX),
        }
    }
}

impl fmt::Debug for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr({}@{})", self.gid.get(), self.worker.get())
    }
}

impl fmt::Display for GlobalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gid, self.worker)
    }
}

/// An interned identifier paired with its name.
///
/// Labels, properties and edge types travel as both the integer value and
/// the string name. The value is used when applying deltas in a running
/// database; the name is authoritative during recovery because the old
/// name<->value mapping is not guaranteed to survive a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    /// The interned integer value.
    pub id: u64,
    /// The human-readable name.
    pub name: String,
}

impl NameId {
    /// Creates a new id + name pair.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for NameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}
