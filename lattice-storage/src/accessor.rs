//! The graph accessor capability contract.
//!
//! Deltas are applied through this trait, both at commit time on a running
//! database and during recovery replay. Operations are keyed by *name* for
//! labels, properties and edge types: the integer<->name mapping is owned
//! by the store and is not guaranteed to survive a restart, so the name is
//! authoritative and the store re-interns it.

use lattice_core::{Gid, PropertyValue};
use thiserror::Error;

/// Result type for accessor operations.
pub type AccessorResult<T> = Result<T, AccessorError>;

/// Errors from graph accessor operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessorError {
    /// A referenced vertex does not exist.
    #[error("vertex {0} not found")]
    VertexNotFound(Gid),

    /// A referenced edge does not exist.
    #[error("edge {0} not found")]
    EdgeNotFound(Gid),

    /// An entity with this id already exists.
    #[error("{entity} {gid} already exists")]
    AlreadyExists {
        /// "vertex" or "edge".
        entity: &'static str,
        /// The conflicting id.
        gid: Gid,
    },
}

/// Capability set the durability core requires of a storage engine.
///
/// Implementations must make every operation atomic with respect to
/// concurrent readers; callers serialise writers externally (the commit
/// path is single-threaded by design).
pub trait GraphAccessor {
    /// Inserts a vertex with the given id.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the id is taken.
    fn insert_vertex(&mut self, gid: Gid) -> AccessorResult<()>;

    /// Inserts an edge with the given id between two existing vertices.
    ///
    /// # Errors
    /// Returns `VertexNotFound` if either endpoint is missing, or
    /// `AlreadyExists` if the edge id is taken.
    fn insert_edge(&mut self, gid: Gid, from: Gid, to: Gid, edge_type: &str)
        -> AccessorResult<()>;

    /// Sets a vertex property. A [`PropertyValue::Null`] value removes it.
    ///
    /// # Errors
    /// Returns `VertexNotFound` if the vertex is missing.
    fn set_vertex_property(
        &mut self,
        vertex: Gid,
        property: &str,
        value: PropertyValue,
    ) -> AccessorResult<()>;

    /// Sets an edge property. A [`PropertyValue::Null`] value removes it.
    ///
    /// # Errors
    /// Returns `EdgeNotFound` if the edge is missing.
    fn set_edge_property(
        &mut self,
        edge: Gid,
        property: &str,
        value: PropertyValue,
    ) -> AccessorResult<()>;

    /// Adds a label to a vertex. Adding a present label is a no-op.
    ///
    /// # Errors
    /// Returns `VertexNotFound` if the vertex is missing.
    fn add_label(&mut self, vertex: Gid, label: &str) -> AccessorResult<()>;

    /// Removes a label from a vertex. Removing an absent label is a no-op.
    ///
    /// # Errors
    /// Returns `VertexNotFound` if the vertex is missing.
    fn remove_label(&mut self, vertex: Gid, label: &str) -> AccessorResult<()>;

    /// Removes a vertex, detaching all incident edges first.
    ///
    /// # Errors
    /// Returns `VertexNotFound` if the vertex is missing.
    fn detach_remove_vertex(&mut self, vertex: Gid) -> AccessorResult<()>;

    /// Removes an edge.
    ///
    /// # Errors
    /// Returns `EdgeNotFound` if the edge is missing.
    fn remove_edge(&mut self, edge: Gid) -> AccessorResult<()>;

    /// Builds a label+property index synchronously.
    ///
    /// On return the index covers every visible vertex carrying the label
    /// and property. Building an existing index is a no-op.
    ///
    /// # Errors
    /// Infallible on the in-memory store; fallible for disk-backed engines.
    fn build_index(&mut self, label: &str, property: &str) -> AccessorResult<()>;
}
