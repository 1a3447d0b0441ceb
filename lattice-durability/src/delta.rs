//! The state delta record.
//!
//! A [`StateDelta`] describes a single change to the database state. It is
//! used for durability (the WAL), for state replication between HA peers
//! (the Raft command stream) and for remote storage changes in distributed
//! deployments.
//!
//! Labels, properties and edge types are carried both as interned values
//! and as names. The values are used when applying deltas in a running
//! database; the names are authoritative on recovery, since the old
//! name<->value mapping is not guaranteed to be preserved.
//!
//! # Framing
//!
//! On the wire / on disk a delta is `Int(kind)`, `Int(transaction_id)`,
//! the per-kind field schedule, then the writer's rolling hash as a raw
//! u64. The decoder accumulates its own hash while reading and compares it
//! to the stored word *before* consuming it; a mismatch yields
//! `CorruptRecord` and the reader advances no further.

use std::io::{Read, Write};

use lattice_core::{Gid, GlobalAddress, NameId, PropertyValue, TxId};
use lattice_storage::GraphAccessor;

use crate::codec::{Decoder, Encoder};
use crate::error::{DurabilityError, DurabilityResult};
use crate::hashed_io::{HashedReader, HashedWriter};

/// Discriminator of a [`StateDelta`], as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i64)]
pub enum DeltaKind {
    /// Transaction opened.
    TxBegin = 0,
    /// Transaction committed.
    TxCommit = 1,
    /// Transaction aborted.
    TxAbort = 2,
    /// Vertex created.
    CreateVertex = 3,
    /// Edge created between two local vertices.
    CreateEdge = 4,
    /// Half-edge added to a vertex's out set (distributed).
    AddOutEdge = 5,
    /// Half-edge removed from a vertex's out set (distributed).
    RemoveOutEdge = 6,
    /// Half-edge added to a vertex's in set (distributed).
    AddInEdge = 7,
    /// Half-edge removed from a vertex's in set (distributed).
    RemoveInEdge = 8,
    /// Vertex property set (Null removes).
    SetVertexProperty = 9,
    /// Edge property set (Null removes).
    SetEdgeProperty = 10,
    /// Label added to a vertex.
    AddLabel = 11,
    /// Label removed from a vertex.
    RemoveLabel = 12,
    /// Vertex removed (with incident edges detached).
    RemoveVertex = 13,
    /// Edge removed.
    RemoveEdge = 14,
    /// Label + property index built.
    BuildIndex = 15,
}

impl DeltaKind {
    /// Returns the wire value of this kind.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Parses a wire value into a kind.
    #[must_use]
    pub const fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::TxBegin),
            1 => Some(Self::TxCommit),
            2 => Some(Self::TxAbort),
            3 => Some(Self::CreateVertex),
            4 => Some(Self::CreateEdge),
            5 => Some(Self::AddOutEdge),
            6 => Some(Self::RemoveOutEdge),
            7 => Some(Self::AddInEdge),
            8 => Some(Self::RemoveInEdge),
            9 => Some(Self::SetVertexProperty),
            10 => Some(Self::SetEdgeProperty),
            11 => Some(Self::AddLabel),
            12 => Some(Self::RemoveLabel),
            13 => Some(Self::RemoveVertex),
            14 => Some(Self::RemoveEdge),
            15 => Some(Self::BuildIndex),
            _ => None,
        }
    }

    /// Returns true for the transaction-control kinds.
    #[must_use]
    pub const fn is_transaction_control(self) -> bool {
        matches!(self, Self::TxBegin | Self::TxCommit | Self::TxAbort)
    }

    /// Returns true for the distributed half-edge kinds, which are illegal
    /// to apply on a single-node accessor.
    #[must_use]
    pub const fn is_half_edge(self) -> bool {
        matches!(
            self,
            Self::AddOutEdge | Self::RemoveOutEdge | Self::AddInEdge | Self::RemoveInEdge
        )
    }
}

/// A single, self-describing mutation record.
///
/// Immutable after emission: a delta is created inside a transaction,
/// persisted on commit and applied either locally or by a replaying peer.
#[derive(Debug, Clone, PartialEq)]
pub enum StateDelta {
    /// Transaction opened.
    TxBegin {
        /// Owning transaction.
        tx: TxId,
    },
    /// Transaction committed.
    TxCommit {
        /// Owning transaction.
        tx: TxId,
    },
    /// Transaction aborted.
    TxAbort {
        /// Owning transaction.
        tx: TxId,
    },
    /// Vertex created.
    CreateVertex {
        /// Owning transaction.
        tx: TxId,
        /// Id of the new vertex.
        vertex: Gid,
    },
    /// Edge created between two local vertices.
    CreateEdge {
        /// Owning transaction.
        tx: TxId,
        /// Id of the new edge.
        edge: Gid,
        /// Source vertex id.
        from: Gid,
        /// Destination vertex id.
        to: Gid,
        /// Edge type (value + name).
        edge_type: NameId,
    },
    /// Half-edge added to a vertex's out set. Distributed only; addresses
    /// are global by construction.
    AddOutEdge {
        /// Owning transaction.
        tx: TxId,
        /// Local vertex gaining the half-edge.
        vertex: Gid,
        /// Global address of the destination vertex.
        vertex_to: GlobalAddress,
        /// Global address of the edge record.
        edge: GlobalAddress,
        /// Interned edge type value.
        edge_type: u64,
    },
    /// Half-edge removed from a vertex's out set.
    RemoveOutEdge {
        /// Owning transaction.
        tx: TxId,
        /// Local vertex losing the half-edge.
        vertex: Gid,
        /// Global address of the edge record.
        edge: GlobalAddress,
    },
    /// Half-edge added to a vertex's in set.
    AddInEdge {
        /// Owning transaction.
        tx: TxId,
        /// Local vertex gaining the half-edge.
        vertex: Gid,
        /// Global address of the source vertex.
        vertex_from: GlobalAddress,
        /// Global address of the edge record.
        edge: GlobalAddress,
        /// Interned edge type value.
        edge_type: u64,
    },
    /// Half-edge removed from a vertex's in set.
    RemoveInEdge {
        /// Owning transaction.
        tx: TxId,
        /// Local vertex losing the half-edge.
        vertex: Gid,
        /// Global address of the edge record.
        edge: GlobalAddress,
    },
    /// Vertex property set; a Null value removes the property.
    SetVertexProperty {
        /// Owning transaction.
        tx: TxId,
        /// Target vertex.
        vertex: Gid,
        /// Property (value + name).
        property: NameId,
        /// New value.
        value: PropertyValue,
    },
    /// Edge property set; a Null value removes the property.
    SetEdgeProperty {
        /// Owning transaction.
        tx: TxId,
        /// Target edge.
        edge: Gid,
        /// Property (value + name).
        property: NameId,
        /// New value.
        value: PropertyValue,
    },
    /// Label added to a vertex.
    AddLabel {
        /// Owning transaction.
        tx: TxId,
        /// Target vertex.
        vertex: Gid,
        /// Label (value + name).
        label: NameId,
    },
    /// Label removed from a vertex.
    RemoveLabel {
        /// Owning transaction.
        tx: TxId,
        /// Target vertex.
        vertex: Gid,
        /// Label (value + name).
        label: NameId,
    },
    /// Vertex removed, detaching incident edges.
    RemoveVertex {
        /// Owning transaction.
        tx: TxId,
        /// Target vertex.
        vertex: Gid,
    },
    /// Edge removed.
    RemoveEdge {
        /// Owning transaction.
        tx: TxId,
        /// Target edge.
        edge: Gid,
    },
    /// Label + property index built.
    BuildIndex {
        /// Owning transaction.
        tx: TxId,
        /// Label (value + name).
        label: NameId,
        /// Property (value + name).
        property: NameId,
    },
}

impl StateDelta {
    /// Returns the kind discriminator.
    #[must_use]
    pub const fn kind(&self) -> DeltaKind {
        match self {
            Self::TxBegin { .. } => DeltaKind::TxBegin,
            Self::TxCommit { .. } => DeltaKind::TxCommit,
            Self::TxAbort { .. } => DeltaKind::TxAbort,
            Self::CreateVertex { .. } => DeltaKind::CreateVertex,
            Self::CreateEdge { .. } => DeltaKind::CreateEdge,
            Self::AddOutEdge { .. } => DeltaKind::AddOutEdge,
            Self::RemoveOutEdge { .. } => DeltaKind::RemoveOutEdge,
            Self::AddInEdge { .. } => DeltaKind::AddInEdge,
            Self::RemoveInEdge { .. } => DeltaKind::RemoveInEdge,
            Self::SetVertexProperty { .. } => DeltaKind::SetVertexProperty,
            Self::SetEdgeProperty { .. } => DeltaKind::SetEdgeProperty,
            Self::AddLabel { .. } => DeltaKind::AddLabel,
            Self::RemoveLabel { .. } => DeltaKind::RemoveLabel,
            Self::RemoveVertex { .. } => DeltaKind::RemoveVertex,
            Self::RemoveEdge { .. } => DeltaKind::RemoveEdge,
            Self::BuildIndex { .. } => DeltaKind::BuildIndex,
        }
    }

    /// Returns the owning transaction id.
    #[must_use]
    pub const fn tx(&self) -> TxId {
        match self {
            Self::TxBegin { tx }
            | Self::TxCommit { tx }
            | Self::TxAbort { tx }
            | Self::CreateVertex { tx, .. }
            | Self::CreateEdge { tx, .. }
            | Self::AddOutEdge { tx, .. }
            | Self::RemoveOutEdge { tx, .. }
            | Self::AddInEdge { tx, .. }
            | Self::RemoveInEdge { tx, .. }
            | Self::SetVertexProperty { tx, .. }
            | Self::SetEdgeProperty { tx, .. }
            | Self::AddLabel { tx, .. }
            | Self::RemoveLabel { tx, .. }
            | Self::RemoveVertex { tx, .. }
            | Self::RemoveEdge { tx, .. }
            | Self::BuildIndex { tx, .. } => *tx,
        }
    }

    /// Encodes the delta and the current writer hash to the stream.
    ///
    /// The hash word makes the record verifiable against every byte that
    /// preceded it in the stream.
    ///
    /// # Errors
    /// Returns an I/O error if the sink rejects a write.
    #[allow(clippy::cast_possible_wrap)] // Ids stay far below i64::MAX.
    pub fn encode<W: Write>(&self, writer: &mut HashedWriter<W>) -> DurabilityResult<()> {
        let mut encoder = Encoder::new(writer);
        encoder.write_int(self.kind().as_i64())?;
        encoder.write_int(self.tx().get() as i64)?;

        match self {
            Self::TxBegin { .. } | Self::TxCommit { .. } | Self::TxAbort { .. } => {}
            Self::CreateVertex { vertex, .. } => {
                encoder.write_int(vertex.get() as i64)?;
            }
            Self::CreateEdge {
                edge,
                from,
                to,
                edge_type,
                ..
            } => {
                encoder.write_int(edge.get() as i64)?;
                encoder.write_int(from.get() as i64)?;
                encoder.write_int(to.get() as i64)?;
                encoder.write_int(edge_type.id as i64)?;
                encoder.write_string(&edge_type.name)?;
            }
            Self::AddOutEdge {
                vertex,
                vertex_to,
                edge,
                edge_type,
                ..
            } => {
                encoder.write_int(vertex.get() as i64)?;
                encoder.write_int(vertex_to.raw() as i64)?;
                encoder.write_int(edge.raw() as i64)?;
                encoder.write_int(*edge_type as i64)?;
            }
            Self::RemoveOutEdge { vertex, edge, .. } | Self::RemoveInEdge { vertex, edge, .. } => {
                encoder.write_int(vertex.get() as i64)?;
                encoder.write_int(edge.raw() as i64)?;
            }
            Self::AddInEdge {
                vertex,
                vertex_from,
                edge,
                edge_type,
                ..
            } => {
                encoder.write_int(vertex.get() as i64)?;
                encoder.write_int(vertex_from.raw() as i64)?;
                encoder.write_int(edge.raw() as i64)?;
                encoder.write_int(*edge_type as i64)?;
            }
            Self::SetVertexProperty {
                vertex,
                property,
                value,
                ..
            } => {
                encoder.write_int(vertex.get() as i64)?;
                encoder.write_int(property.id as i64)?;
                encoder.write_string(&property.name)?;
                encoder.write_value(value)?;
            }
            Self::SetEdgeProperty {
                edge,
                property,
                value,
                ..
            } => {
                encoder.write_int(edge.get() as i64)?;
                encoder.write_int(property.id as i64)?;
                encoder.write_string(&property.name)?;
                encoder.write_value(value)?;
            }
            Self::AddLabel { vertex, label, .. } | Self::RemoveLabel { vertex, label, .. } => {
                encoder.write_int(vertex.get() as i64)?;
                encoder.write_int(label.id as i64)?;
                encoder.write_string(&label.name)?;
            }
            Self::RemoveVertex { vertex, .. } => {
                encoder.write_int(vertex.get() as i64)?;
            }
            Self::RemoveEdge { edge, .. } => {
                encoder.write_int(edge.get() as i64)?;
            }
            Self::BuildIndex {
                label, property, ..
            } => {
                encoder.write_int(label.id as i64)?;
                encoder.write_string(&label.name)?;
                encoder.write_int(property.id as i64)?;
                encoder.write_string(&property.name)?;
            }
        }

        let hash = writer.hash();
        writer.write_u64(hash)
    }

    /// Decodes one delta from the stream and verifies its trailing hash.
    ///
    /// # Errors
    /// Returns `Truncated`/`BadTag` on malformed input and `CorruptRecord`
    /// when the stored hash disagrees with the reader's accumulated hash.
    /// On any error the partial record is discarded and the reader must not
    /// be advanced further.
    #[allow(clippy::cast_sign_loss)] // Ids were encoded from u64 values.
    pub fn decode<R: Read>(reader: &mut HashedReader<R>) -> DurabilityResult<Self> {
        let mut decoder = Decoder::new(reader);

        let kind_value = decoder.read_int()?;
        let kind = DeltaKind::from_i64(kind_value).ok_or(DurabilityError::BadTag {
            tag: kind_value.clamp(0, 255) as u8,
            context: "delta kind",
        })?;
        let tx = TxId::new(decoder.read_int()? as u64);

        let delta = match kind {
            DeltaKind::TxBegin => Self::TxBegin { tx },
            DeltaKind::TxCommit => Self::TxCommit { tx },
            DeltaKind::TxAbort => Self::TxAbort { tx },
            DeltaKind::CreateVertex => Self::CreateVertex {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
            },
            DeltaKind::CreateEdge => Self::CreateEdge {
                tx,
                edge: Gid::new(decoder.read_int()? as u64),
                from: Gid::new(decoder.read_int()? as u64),
                to: Gid::new(decoder.read_int()? as u64),
                edge_type: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
            },
            DeltaKind::AddOutEdge => Self::AddOutEdge {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                vertex_to: GlobalAddress::from_raw(decoder.read_int()? as u64),
                edge: GlobalAddress::from_raw(decoder.read_int()? as u64),
                edge_type: decoder.read_int()? as u64,
            },
            DeltaKind::RemoveOutEdge => Self::RemoveOutEdge {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                edge: GlobalAddress::from_raw(decoder.read_int()? as u64),
            },
            DeltaKind::AddInEdge => Self::AddInEdge {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                vertex_from: GlobalAddress::from_raw(decoder.read_int()? as u64),
                edge: GlobalAddress::from_raw(decoder.read_int()? as u64),
                edge_type: decoder.read_int()? as u64,
            },
            DeltaKind::RemoveInEdge => Self::RemoveInEdge {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                edge: GlobalAddress::from_raw(decoder.read_int()? as u64),
            },
            DeltaKind::SetVertexProperty => Self::SetVertexProperty {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                property: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
                value: decoder.read_value()?,
            },
            DeltaKind::SetEdgeProperty => Self::SetEdgeProperty {
                tx,
                edge: Gid::new(decoder.read_int()? as u64),
                property: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
                value: decoder.read_value()?,
            },
            DeltaKind::AddLabel => Self::AddLabel {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                label: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
            },
            DeltaKind::RemoveLabel => Self::RemoveLabel {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
                label: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
            },
            DeltaKind::RemoveVertex => Self::RemoveVertex {
                tx,
                vertex: Gid::new(decoder.read_int()? as u64),
            },
            DeltaKind::RemoveEdge => Self::RemoveEdge {
                tx,
                edge: Gid::new(decoder.read_int()? as u64),
            },
            DeltaKind::BuildIndex => Self::BuildIndex {
                tx,
                label: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
                property: {
                    let id = decoder.read_int()? as u64;
                    let name = decoder.read_string()?;
                    NameId::new(id, name)
                },
            },
        };

        // The accumulated hash up to, but excluding, the stored hash word.
        let computed = reader.hash();
        let stored = reader.read_u64()?;
        if stored != computed {
            return Err(DurabilityError::CorruptRecord { stored, computed });
        }

        Ok(delta)
    }

    /// Applies a CRUD delta to an accessor.
    ///
    /// Transaction-control deltas are illegal here (the replay driver owns
    /// transaction handling), as are the distributed half-edge deltas on a
    /// single-node accessor (they are routed to the owning remote worker
    /// before ever reaching a local WAL). Lookup failures that can only
    /// arise from log corruption are fatal.
    ///
    /// # Errors
    /// Returns [`DurabilityError::ApplyFatal`] on any refusal.
    pub fn apply(&self, accessor: &mut dyn GraphAccessor) -> DurabilityResult<()> {
        let fatal = |reason: String| DurabilityError::ApplyFatal { reason };

        match self {
            Self::TxBegin { .. } | Self::TxCommit { .. } | Self::TxAbort { .. } => {
                Err(fatal("transaction control is not handled in apply".into()))
            }
            Self::AddOutEdge { .. }
            | Self::RemoveOutEdge { .. }
            | Self::AddInEdge { .. }
            | Self::RemoveInEdge { .. } => Err(fatal(
                "half-edge deltas cannot apply to a single-node accessor".into(),
            )),
            Self::CreateVertex { vertex, .. } => accessor
                .insert_vertex(*vertex)
                .map_err(|e| fatal(e.to_string())),
            Self::CreateEdge {
                edge,
                from,
                to,
                edge_type,
                ..
            } => accessor
                .insert_edge(*edge, *from, *to, &edge_type.name)
                .map_err(|e| fatal(e.to_string())),
            Self::SetVertexProperty {
                vertex,
                property,
                value,
                ..
            } => accessor
                .set_vertex_property(*vertex, &property.name, value.clone())
                .map_err(|e| fatal(e.to_string())),
            Self::SetEdgeProperty {
                edge,
                property,
                value,
                ..
            } => accessor
                .set_edge_property(*edge, &property.name, value.clone())
                .map_err(|e| fatal(e.to_string())),
            Self::AddLabel { vertex, label, .. } => accessor
                .add_label(*vertex, &label.name)
                .map_err(|e| fatal(e.to_string())),
            Self::RemoveLabel { vertex, label, .. } => accessor
                .remove_label(*vertex, &label.name)
                .map_err(|e| fatal(e.to_string())),
            Self::RemoveVertex { vertex, .. } => accessor
                .detach_remove_vertex(*vertex)
                .map_err(|e| fatal(e.to_string())),
            Self::RemoveEdge { edge, .. } => accessor
                .remove_edge(*edge)
                .map_err(|e| fatal(e.to_string())),
            Self::BuildIndex {
                label, property, ..
            } => accessor
                .build_index(&label.name, &property.name)
                .map_err(|e| fatal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::WorkerId;
    use lattice_storage::InMemoryGraph;

    fn addr(gid: u64, worker: u64) -> GlobalAddress {
        GlobalAddress::new(Gid::new(gid), WorkerId::new(worker))
    }

    fn all_kinds() -> Vec<StateDelta> {
        let tx = TxId::new(42);
        vec![
            StateDelta::TxBegin { tx },
            StateDelta::TxCommit { tx },
            StateDelta::TxAbort { tx },
            StateDelta::CreateVertex {
                tx,
                vertex: Gid::new(7),
            },
            StateDelta::CreateEdge {
                tx,
                edge: Gid::new(1),
                from: Gid::new(7),
                to: Gid::new(8),
                edge_type: NameId::new(0, "KNOWS"),
            },
            StateDelta::AddOutEdge {
                tx,
                vertex: Gid::new(7),
                vertex_to: addr(8, 2),
                edge: addr(1, 2),
                edge_type: 0,
            },
            StateDelta::RemoveOutEdge {
                tx,
                vertex: Gid::new(7),
                edge: addr(1, 2),
            },
            StateDelta::AddInEdge {
                tx,
                vertex: Gid::new(8),
                vertex_from: addr(7, 1),
                edge: addr(1, 2),
                edge_type: 0,
            },
            StateDelta::RemoveInEdge {
                tx,
                vertex: Gid::new(8),
                edge: addr(1, 2),
            },
            StateDelta::SetVertexProperty {
                tx,
                vertex: Gid::new(7),
                property: NameId::new(0, "age"),
                value: PropertyValue::Int(30),
            },
            StateDelta::SetEdgeProperty {
                tx,
                edge: Gid::new(1),
                property: NameId::new(1, "weight"),
                value: PropertyValue::Float(0.5),
            },
            StateDelta::AddLabel {
                tx,
                vertex: Gid::new(7),
                label: NameId::new(0, "Person"),
            },
            StateDelta::RemoveLabel {
                tx,
                vertex: Gid::new(7),
                label: NameId::new(0, "Person"),
            },
            StateDelta::RemoveVertex {
                tx,
                vertex: Gid::new(7),
            },
            StateDelta::RemoveEdge {
                tx,
                edge: Gid::new(1),
            },
            StateDelta::BuildIndex {
                tx,
                label: NameId::new(0, "Person"),
                property: NameId::new(0, "age"),
            },
        ]
    }

    #[test]
    fn test_roundtrip_every_kind() {
        for delta in all_kinds() {
            let mut writer = HashedWriter::new(Vec::new());
            delta.encode(&mut writer).unwrap();
            let buf = writer.get_ref().clone();

            let mut reader = HashedReader::new(&buf[..]);
            let decoded = StateDelta::decode(&mut reader).unwrap();
            assert_eq!(decoded, delta, "kind {:?}", delta.kind());
        }
    }

    #[test]
    fn test_chained_records_roundtrip() {
        // Records share one stream; each hash covers all prior bytes.
        let deltas = all_kinds();
        let mut writer = HashedWriter::new(Vec::new());
        for delta in &deltas {
            delta.encode(&mut writer).unwrap();
        }
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        for expected in &deltas {
            let decoded = StateDelta::decode(&mut reader).unwrap();
            assert_eq!(&decoded, expected);
        }
    }

    #[test]
    fn test_bit_flip_detected_and_stops_reader() {
        let deltas = all_kinds();
        let mut writer = HashedWriter::new(Vec::new());
        for delta in &deltas {
            delta.encode(&mut writer).unwrap();
        }
        let mut buf = writer.get_ref().clone();

        // Flip one bit inside the second record's bytes.
        buf[40] ^= 0x01;

        let mut reader = HashedReader::new(&buf[..]);
        let first = StateDelta::decode(&mut reader).unwrap();
        assert_eq!(first, deltas[0]);

        // The corrupted record fails; the reader advances no further.
        let result = StateDelta::decode(&mut reader);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_kind_is_bad_tag() {
        let mut writer = HashedWriter::new(Vec::new());
        let mut encoder = Encoder::new(&mut writer);
        encoder.write_int(99).unwrap(); // Not a valid kind.
        encoder.write_int(1).unwrap();
        let buf = writer.get_ref().clone();

        let mut reader = HashedReader::new(&buf[..]);
        let result = StateDelta::decode(&mut reader);
        assert!(matches!(result, Err(DurabilityError::BadTag { .. })));
    }

    #[test]
    fn test_kind_wire_values_are_stable() {
        // These values are the on-disk format; they must never change.
        assert_eq!(DeltaKind::TxBegin.as_i64(), 0);
        assert_eq!(DeltaKind::CreateVertex.as_i64(), 3);
        assert_eq!(DeltaKind::SetVertexProperty.as_i64(), 9);
        assert_eq!(DeltaKind::BuildIndex.as_i64(), 15);
        for value in 0..=15 {
            assert_eq!(DeltaKind::from_i64(value).unwrap().as_i64(), value);
        }
        assert!(DeltaKind::from_i64(16).is_none());
    }

    #[test]
    fn test_apply_create_and_set() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        let tx = TxId::new(1);

        StateDelta::CreateVertex {
            tx,
            vertex: Gid::new(7),
        }
        .apply(&mut graph)
        .unwrap();
        StateDelta::SetVertexProperty {
            tx,
            vertex: Gid::new(7),
            property: NameId::new(0, "age"),
            value: PropertyValue::Int(30),
        }
        .apply(&mut graph)
        .unwrap();

        assert_eq!(
            graph.vertex_property(Gid::new(7), "age"),
            Some(&PropertyValue::Int(30))
        );
    }

    #[test]
    fn test_apply_null_removes_property() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        let tx = TxId::new(1);
        graph.insert_vertex(Gid::new(1)).unwrap();
        graph
            .set_vertex_property(Gid::new(1), "p", PropertyValue::Int(1))
            .unwrap();

        StateDelta::SetVertexProperty {
            tx,
            vertex: Gid::new(1),
            property: NameId::new(0, "p"),
            value: PropertyValue::Null,
        }
        .apply(&mut graph)
        .unwrap();

        assert!(graph.vertex_property(Gid::new(1), "p").is_none());
    }

    #[test]
    fn test_apply_transaction_control_is_fatal() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        let result = StateDelta::TxBegin { tx: TxId::new(1) }.apply(&mut graph);
        assert!(matches!(result, Err(DurabilityError::ApplyFatal { .. })));
    }

    #[test]
    fn test_apply_half_edge_is_fatal() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        let result = StateDelta::AddOutEdge {
            tx: TxId::new(1),
            vertex: Gid::new(1),
            vertex_to: addr(2, 1),
            edge: addr(3, 1),
            edge_type: 0,
        }
        .apply(&mut graph);
        assert!(matches!(result, Err(DurabilityError::ApplyFatal { .. })));
    }

    #[test]
    fn test_apply_create_edge_missing_endpoint_is_fatal() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        let result = StateDelta::CreateEdge {
            tx: TxId::new(1),
            edge: Gid::new(0),
            from: Gid::new(1),
            to: Gid::new(2),
            edge_type: NameId::new(0, "KNOWS"),
        }
        .apply(&mut graph);
        assert!(matches!(result, Err(DurabilityError::ApplyFatal { .. })));
    }

    #[test]
    fn test_apply_remove_vertex_detaches() {
        let mut graph = InMemoryGraph::new(WorkerId::new(0));
        graph.insert_vertex(Gid::new(1)).unwrap();
        graph.insert_vertex(Gid::new(2)).unwrap();
        graph
            .insert_edge(Gid::new(0), Gid::new(1), Gid::new(2), "KNOWS")
            .unwrap();

        StateDelta::RemoveVertex {
            tx: TxId::new(1),
            vertex: Gid::new(1),
        }
        .apply(&mut graph)
        .unwrap();

        assert!(!graph.has_vertex(Gid::new(1)));
        assert_eq!(graph.edge_count(), 0);
    }
}
