//! Lattice storage - graph accessor contract and transaction engine.
//!
//! This crate provides the seam between the durable state-replication core
//! and the storage engine proper: the [`GraphAccessor`] capability trait
//! that deltas are applied through, an in-memory [`InMemoryGraph`]
//! implementation of it, and the [`TransactionEngine`] that issues
//! monotonically increasing transaction identifiers and snapshot sets.
//!
//! The MVCC record layout of a production storage engine is out of scope
//! here; [`InMemoryGraph`] implements exactly the capability set the
//! durability and replication layers require.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod accessor;
mod engine;
mod graph;

pub use accessor::{AccessorError, AccessorResult, GraphAccessor};
pub use engine::{Transaction, TransactionEngine};
pub use graph::{EdgeRecord, InMemoryGraph, VertexRecord};
