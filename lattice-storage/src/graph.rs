//! In-memory graph store.
//!
//! A plain, single-worker implementation of [`GraphAccessor`] carrying
//! exactly the state the durability layer persists: vertices with labels
//! and properties, edges with a type and properties, the id<->name
//! mappers, the id generators and the label+property indexes.

use std::collections::{BTreeMap, BTreeSet};

use lattice_core::{Gid, NameId, PropertyValue, WorkerId};
use tracing::debug;

use crate::accessor::{AccessorError, AccessorResult, GraphAccessor};

/// Interns names to dense integer ids, in insertion order.
#[derive(Debug, Default, Clone)]
struct NameMapper {
    by_name: BTreeMap<String, u64>,
    by_id: BTreeMap<u64, String>,
    next_id: u64,
}

impl NameMapper {
    /// Returns the id for a name, interning it if new.
    fn intern(&mut self, name: &str) -> u64 {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_name.insert(name.to_owned(), id);
        self.by_id.insert(id, name.to_owned());
        id
    }

    fn name(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }
}

/// A stored vertex.
#[derive(Debug, Default, Clone)]
struct Vertex {
    labels: BTreeSet<u64>,
    properties: BTreeMap<u64, PropertyValue>,
    out_edges: BTreeSet<Gid>,
    in_edges: BTreeSet<Gid>,
}

/// A stored edge.
#[derive(Debug, Clone)]
struct Edge {
    from: Gid,
    to: Gid,
    edge_type: u64,
    properties: BTreeMap<u64, PropertyValue>,
    /// Stable id exposed to the query layer, persisted beside the edge.
    cypher_id: i64,
}

/// A vertex as seen by the snapshotter: names resolved, ordering stable.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexRecord {
    /// The vertex id.
    pub gid: Gid,
    /// Label names, sorted.
    pub labels: Vec<String>,
    /// Property name -> value.
    pub properties: BTreeMap<String, PropertyValue>,
}

/// An edge as seen by the snapshotter: names resolved, ordering stable.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    /// The edge id.
    pub gid: Gid,
    /// Source vertex id.
    pub from: Gid,
    /// Destination vertex id.
    pub to: Gid,
    /// Edge type name.
    pub edge_type: String,
    /// Property name -> value.
    pub properties: BTreeMap<String, PropertyValue>,
    /// The edge's Cypher id.
    pub cypher_id: i64,
}

/// Single-worker in-memory graph store.
///
/// `Clone` gives the snapshotter a consistent read copy, standing in for
/// the long-lived read transaction a multi-versioned engine would use.
#[derive(Debug, Clone)]
pub struct InMemoryGraph {
    worker_id: WorkerId,
    vertices: BTreeMap<Gid, Vertex>,
    edges: BTreeMap<Gid, Edge>,
    labels: NameMapper,
    properties: NameMapper,
    edge_types: NameMapper,
    /// Count of vertex ids ever generated (generator high-water mark).
    vertex_generated: u64,
    /// Count of edge ids ever generated (generator high-water mark).
    edge_generated: u64,
    /// (label id, property id) -> matching vertices.
    indexes: BTreeMap<(u64, u64), BTreeSet<Gid>>,
}

impl InMemoryGraph {
    /// Creates an empty graph owned by the given worker.
    #[must_use]
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            labels: NameMapper::default(),
            properties: NameMapper::default(),
            edge_types: NameMapper::default(),
            vertex_generated: 0,
            edge_generated: 0,
            indexes: BTreeMap::new(),
        }
    }

    /// Returns the owning worker id.
    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Generates a fresh vertex id, advancing the high-water mark.
    pub fn generate_vertex_id(&mut self) -> Gid {
        let gid = Gid::new(self.vertex_generated);
        self.vertex_generated += 1;
        gid
    }

    /// Generates a fresh edge id, advancing the high-water mark.
    pub fn generate_edge_id(&mut self) -> Gid {
        let gid = Gid::new(self.edge_generated);
        self.edge_generated += 1;
        gid
    }

    /// Returns `(vertex, edge)` generator high-water counts.
    #[must_use]
    pub const fn generator_counts(&self) -> (u64, u64) {
        (self.vertex_generated, self.edge_generated)
    }

    /// Restores the generator high-water counts from a snapshot.
    pub fn restore_generator_counts(&mut self, vertex: u64, edge: u64) {
        self.vertex_generated = vertex;
        self.edge_generated = edge;
    }

    /// Interns a label name and returns the id + name pair for a delta.
    pub fn label(&mut self, name: &str) -> NameId {
        NameId::new(self.labels.intern(name), name)
    }

    /// Interns a property name and returns the id + name pair for a delta.
    pub fn property(&mut self, name: &str) -> NameId {
        NameId::new(self.properties.intern(name), name)
    }

    /// Interns an edge type name and returns the id + name pair for a delta.
    pub fn edge_type(&mut self, name: &str) -> NameId {
        NameId::new(self.edge_types.intern(name), name)
    }

    /// Returns the number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> u64 {
        self.vertices.len() as u64
    }

    /// Returns the number of edges.
    #[must_use]
    pub fn edge_count(&self) -> u64 {
        self.edges.len() as u64
    }

    /// Returns true if the vertex exists.
    #[must_use]
    pub fn has_vertex(&self, gid: Gid) -> bool {
        self.vertices.contains_key(&gid)
    }

    /// Returns true if the edge exists.
    #[must_use]
    pub fn has_edge(&self, gid: Gid) -> bool {
        self.edges.contains_key(&gid)
    }

    /// Returns a vertex property by name, if present.
    #[must_use]
    pub fn vertex_property(&self, gid: Gid, property: &str) -> Option<&PropertyValue> {
        let vertex = self.vertices.get(&gid)?;
        let prop_id = self.properties.by_name.get(property)?;
        vertex.properties.get(prop_id)
    }

    /// Returns an edge property by name, if present.
    #[must_use]
    pub fn edge_property(&self, gid: Gid, property: &str) -> Option<&PropertyValue> {
        let edge = self.edges.get(&gid)?;
        let prop_id = self.properties.by_name.get(property)?;
        edge.properties.get(prop_id)
    }

    /// Returns true if the vertex carries the label.
    #[must_use]
    pub fn vertex_has_label(&self, gid: Gid, label: &str) -> bool {
        let Some(vertex) = self.vertices.get(&gid) else {
            return false;
        };
        self.labels
            .by_name
            .get(label)
            .is_some_and(|id| vertex.labels.contains(id))
    }

    /// Returns the existing index keys as `(label, property)` name pairs.
    #[must_use]
    pub fn index_keys(&self) -> Vec<(String, String)> {
        self.indexes
            .keys()
            .filter_map(|&(label, property)| {
                let label = self.labels.name(label)?.to_owned();
                let property = self.properties.name(property)?.to_owned();
                Some((label, property))
            })
            .collect()
    }

    /// Returns the vertices covered by a label+property index, if it exists.
    #[must_use]
    pub fn indexed_vertices(&self, label: &str, property: &str) -> Option<Vec<Gid>> {
        let label = *self.labels.by_name.get(label)?;
        let property = *self.properties.by_name.get(property)?;
        self.indexes
            .get(&(label, property))
            .map(|set| set.iter().copied().collect())
    }

    /// Returns all vertices as snapshot records, ordered by id.
    #[must_use]
    pub fn vertex_records(&self) -> Vec<VertexRecord> {
        self.vertices
            .iter()
            .map(|(&gid, vertex)| VertexRecord {
                gid,
                labels: vertex
                    .labels
                    .iter()
                    .filter_map(|&id| self.labels.name(id).map(str::to_owned))
                    .collect(),
                properties: vertex
                    .properties
                    .iter()
                    .filter_map(|(&id, value)| {
                        self.properties.name(id).map(|name| (name.to_owned(), value.clone()))
                    })
                    .collect(),
            })
            .collect()
    }

    /// Returns all edges as snapshot records, ordered by id.
    #[must_use]
    pub fn edge_records(&self) -> Vec<EdgeRecord> {
        self.edges
            .iter()
            .map(|(&gid, edge)| EdgeRecord {
                gid,
                from: edge.from,
                to: edge.to,
                edge_type: self
                    .edge_types
                    .name(edge.edge_type)
                    .unwrap_or_default()
                    .to_owned(),
                properties: edge
                    .properties
                    .iter()
                    .filter_map(|(&id, value)| {
                        self.properties.name(id).map(|name| (name.to_owned(), value.clone()))
                    })
                    .collect(),
                cypher_id: edge.cypher_id,
            })
            .collect()
    }

    /// Inserts an edge restoring an explicit Cypher id (snapshot load path).
    ///
    /// # Errors
    /// Same as [`GraphAccessor::insert_edge`].
    pub fn insert_edge_with_cypher_id(
        &mut self,
        gid: Gid,
        from: Gid,
        to: Gid,
        edge_type: &str,
        cypher_id: i64,
    ) -> AccessorResult<()> {
        self.insert_edge(gid, from, to, edge_type)?;
        if let Some(edge) = self.edges.get_mut(&gid) {
            edge.cypher_id = cypher_id;
        }
        Ok(())
    }

    /// Updates index membership for one vertex and one (label, property) key.
    fn reindex_vertex(&mut self, gid: Gid) {
        let Some(vertex) = self.vertices.get(&gid) else {
            for members in self.indexes.values_mut() {
                members.remove(&gid);
            }
            return;
        };
        for (&(label, property), members) in &mut self.indexes {
            let covered =
                vertex.labels.contains(&label) && vertex.properties.contains_key(&property);
            if covered {
                members.insert(gid);
            } else {
                members.remove(&gid);
            }
        }
    }

    fn remove_edge_internal(&mut self, gid: Gid) -> AccessorResult<Edge> {
        let edge = self
            .edges
            .remove(&gid)
            .ok_or(AccessorError::EdgeNotFound(gid))?;
        if let Some(from) = self.vertices.get_mut(&edge.from) {
            from.out_edges.remove(&gid);
        }
        if let Some(to) = self.vertices.get_mut(&edge.to) {
            to.in_edges.remove(&gid);
        }
        Ok(edge)
    }
}

impl GraphAccessor for InMemoryGraph {
    fn insert_vertex(&mut self, gid: Gid) -> AccessorResult<()> {
        if self.vertices.contains_key(&gid) {
            return Err(AccessorError::AlreadyExists {
                entity: "vertex",
                gid,
            });
        }
        self.vertices.insert(gid, Vertex::default());
        if gid.get() >= self.vertex_generated {
            self.vertex_generated = gid.get() + 1;
        }
        Ok(())
    }

    fn insert_edge(&mut self, gid: Gid, from: Gid, to: Gid, edge_type: &str)
        -> AccessorResult<()> {
        if self.edges.contains_key(&gid) {
            return Err(AccessorError::AlreadyExists {
                entity: "edge",
                gid,
            });
        }
        if !self.vertices.contains_key(&from) {
            return Err(AccessorError::VertexNotFound(from));
        }
        if !self.vertices.contains_key(&to) {
            return Err(AccessorError::VertexNotFound(to));
        }

        let edge_type = self.edge_types.intern(edge_type);
        #[allow(clippy::cast_possible_wrap)] // Gid values stay far below i64::MAX.
        let cypher_id = gid.get() as i64;
        self.edges.insert(
            gid,
            Edge {
                from,
                to,
                edge_type,
                properties: BTreeMap::new(),
                cypher_id,
            },
        );
        if let Some(vertex) = self.vertices.get_mut(&from) {
            vertex.out_edges.insert(gid);
        }
        if let Some(vertex) = self.vertices.get_mut(&to) {
            vertex.in_edges.insert(gid);
        }
        if gid.get() >= self.edge_generated {
            self.edge_generated = gid.get() + 1;
        }
        Ok(())
    }

    fn set_vertex_property(
        &mut self,
        vertex: Gid,
        property: &str,
        value: PropertyValue,
    ) -> AccessorResult<()> {
        let property = self.properties.intern(property);
        let record = self
            .vertices
            .get_mut(&vertex)
            .ok_or(AccessorError::VertexNotFound(vertex))?;
        if value.is_null() {
            record.properties.remove(&property);
        } else {
            record.properties.insert(property, value);
        }
        self.reindex_vertex(vertex);
        Ok(())
    }

    fn set_edge_property(
        &mut self,
        edge: Gid,
        property: &str,
        value: PropertyValue,
    ) -> AccessorResult<()> {
        let property = self.properties.intern(property);
        let record = self
            .edges
            .get_mut(&edge)
            .ok_or(AccessorError::EdgeNotFound(edge))?;
        if value.is_null() {
            record.properties.remove(&property);
        } else {
            record.properties.insert(property, value);
        }
        Ok(())
    }

    fn add_label(&mut self, vertex: Gid, label: &str) -> AccessorResult<()> {
        let label = self.labels.intern(label);
        let record = self
            .vertices
            .get_mut(&vertex)
            .ok_or(AccessorError::VertexNotFound(vertex))?;
        record.labels.insert(label);
        self.reindex_vertex(vertex);
        Ok(())
    }

    fn remove_label(&mut self, vertex: Gid, label: &str) -> AccessorResult<()> {
        let label = self.labels.intern(label);
        let record = self
            .vertices
            .get_mut(&vertex)
            .ok_or(AccessorError::VertexNotFound(vertex))?;
        record.labels.remove(&label);
        self.reindex_vertex(vertex);
        Ok(())
    }

    fn detach_remove_vertex(&mut self, vertex: Gid) -> AccessorResult<()> {
        let record = self
            .vertices
            .get(&vertex)
            .ok_or(AccessorError::VertexNotFound(vertex))?;

        // Detach all incident edges, then remove.
        let incident: Vec<Gid> = record
            .out_edges
            .iter()
            .chain(record.in_edges.iter())
            .copied()
            .collect();
        for edge in incident {
            // A self-loop appears in both sets; the second removal is a no-op.
            let _ = self.remove_edge_internal(edge);
        }

        self.vertices.remove(&vertex);
        self.reindex_vertex(vertex);
        Ok(())
    }

    fn remove_edge(&mut self, edge: Gid) -> AccessorResult<()> {
        self.remove_edge_internal(edge).map(|_| ())
    }

    fn build_index(&mut self, label: &str, property: &str) -> AccessorResult<()> {
        let label_id = self.labels.intern(label);
        let property_id = self.properties.intern(property);
        let key = (label_id, property_id);
        if self.indexes.contains_key(&key) {
            return Ok(());
        }

        // Synchronous: covers all visible vertices before returning.
        let members: BTreeSet<Gid> = self
            .vertices
            .iter()
            .filter(|(_, vertex)| {
                vertex.labels.contains(&label_id) && vertex.properties.contains_key(&property_id)
            })
            .map(|(&gid, _)| gid)
            .collect();
        debug!(label, property, covered = members.len(), "Built index");
        self.indexes.insert(key, members);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> InMemoryGraph {
        InMemoryGraph::new(WorkerId::new(0))
    }

    #[test]
    fn test_insert_and_query_vertex() {
        let mut g = graph();

        g.insert_vertex(Gid::new(7)).unwrap();
        g.set_vertex_property(Gid::new(7), "age", PropertyValue::Int(30))
            .unwrap();

        assert!(g.has_vertex(Gid::new(7)));
        assert_eq!(
            g.vertex_property(Gid::new(7), "age"),
            Some(&PropertyValue::Int(30))
        );
        assert_eq!(g.vertex_count(), 1);
    }

    #[test]
    fn test_duplicate_vertex_rejected() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();

        let result = g.insert_vertex(Gid::new(1));
        assert!(matches!(result, Err(AccessorError::AlreadyExists { .. })));
    }

    #[test]
    fn test_edge_requires_endpoints() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();

        let result = g.insert_edge(Gid::new(0), Gid::new(1), Gid::new(2), "KNOWS");
        assert_eq!(result, Err(AccessorError::VertexNotFound(Gid::new(2))));
    }

    #[test]
    fn test_null_property_removes() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();
        g.set_vertex_property(Gid::new(1), "name", PropertyValue::from("ada"))
            .unwrap();
        assert!(g.vertex_property(Gid::new(1), "name").is_some());

        g.set_vertex_property(Gid::new(1), "name", PropertyValue::Null)
            .unwrap();
        assert!(g.vertex_property(Gid::new(1), "name").is_none());
    }

    #[test]
    fn test_detach_remove_vertex() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();
        g.insert_vertex(Gid::new(2)).unwrap();
        g.insert_edge(Gid::new(0), Gid::new(1), Gid::new(2), "KNOWS")
            .unwrap();

        g.detach_remove_vertex(Gid::new(1)).unwrap();

        assert!(!g.has_vertex(Gid::new(1)));
        assert!(!g.has_edge(Gid::new(0)));
        assert!(g.has_vertex(Gid::new(2)));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_detach_remove_self_loop() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();
        g.insert_edge(Gid::new(0), Gid::new(1), Gid::new(1), "SELF")
            .unwrap();

        g.detach_remove_vertex(Gid::new(1)).unwrap();
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_index_covers_existing_and_new() {
        let mut g = graph();
        for i in 0..5 {
            g.insert_vertex(Gid::new(i)).unwrap();
            g.add_label(Gid::new(i), "L").unwrap();
            if i % 2 == 0 {
                g.set_vertex_property(Gid::new(i), "p", PropertyValue::Int(1))
                    .unwrap();
            }
        }

        g.build_index("L", "p").unwrap();
        assert_eq!(g.indexed_vertices("L", "p").unwrap().len(), 3);

        // New matching vertex joins the index.
        g.insert_vertex(Gid::new(10)).unwrap();
        g.add_label(Gid::new(10), "L").unwrap();
        g.set_vertex_property(Gid::new(10), "p", PropertyValue::Int(2))
            .unwrap();
        assert_eq!(g.indexed_vertices("L", "p").unwrap().len(), 4);

        // Removing the property drops the vertex from the index.
        g.set_vertex_property(Gid::new(10), "p", PropertyValue::Null)
            .unwrap();
        assert_eq!(g.indexed_vertices("L", "p").unwrap().len(), 3);
    }

    #[test]
    fn test_generator_counts_track_inserts() {
        let mut g = graph();
        g.insert_vertex(Gid::new(41)).unwrap();

        // Explicit inserts push the generator past the used id.
        assert_eq!(g.generator_counts().0, 42);
        assert_eq!(g.generate_vertex_id(), Gid::new(42));
    }

    #[test]
    fn test_records_resolve_names() {
        let mut g = graph();
        g.insert_vertex(Gid::new(1)).unwrap();
        g.insert_vertex(Gid::new(2)).unwrap();
        g.add_label(Gid::new(1), "Person").unwrap();
        g.set_vertex_property(Gid::new(1), "age", PropertyValue::Int(30))
            .unwrap();
        g.insert_edge(Gid::new(5), Gid::new(1), Gid::new(2), "KNOWS")
            .unwrap();

        let vertices = g.vertex_records();
        assert_eq!(vertices.len(), 2);
        assert_eq!(vertices[0].labels, vec!["Person".to_owned()]);
        assert_eq!(
            vertices[0].properties.get("age"),
            Some(&PropertyValue::Int(30))
        );

        let edges = g.edge_records();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].edge_type, "KNOWS");
        assert_eq!(edges[0].cypher_id, 5);
    }
}
