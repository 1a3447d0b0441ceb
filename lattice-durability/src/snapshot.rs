//! Snapshot creation and retention.
//!
//! A snapshot is a consistent point-in-time dump produced by a single
//! reader transaction with a frozen transaction snapshot set. Its layout,
//! in stream order:
//!
//! ```text
//! magic(8 bytes) | version(int) | worker_id(int)
//! | vertex_gen_count(int) | edge_gen_count(int)
//! | snapshot_tx_id(int) | snapshot_tx_set(list<int>)
//! | index_keys(list<string>, flat [label, property, ...])
//! | vertices(stream of vertex records)
//! | edges(stream of edge + cypher_id pairs)
//! | vertex_count(u64) | edge_count(u64) | file_hash(u64)
//! ```
//!
//! Failure at any point deletes the partial snapshot. After a successful
//! snapshot the retention pass keeps at most `max_retained` newest
//! snapshot files and deletes every WAL file fully covered by it.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use lattice_core::{PropertyValue, TxId, WorkerId};
use lattice_storage::{InMemoryGraph, Transaction};
use tracing::{error, info, warn};

use crate::codec::Encoder;
use crate::error::{DurabilityError, DurabilityResult};
use crate::hashed_io::HashedWriter;
use crate::wal::list_wal_files;

/// Magic bytes identifying a Lattice snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"LATTSNAP";

/// Current durability format version. Any mismatch is a hard failure.
pub const DURABILITY_VERSION: i64 = 6;

/// Subdirectory of the durability dir holding snapshots.
const SNAPSHOT_SUBDIR: &str = "snapshots";

/// Subdirectory of the durability dir holding WAL segments.
const WAL_SUBDIR: &str = "wal";

/// Returns the snapshot directory under a durability directory.
#[must_use]
pub fn snapshot_dir(durability_dir: &Path) -> PathBuf {
    durability_dir.join(SNAPSHOT_SUBDIR)
}

/// Returns the WAL directory under a durability directory.
#[must_use]
pub fn wal_dir(durability_dir: &Path) -> PathBuf {
    durability_dir.join(WAL_SUBDIR)
}

/// Returns the snapshot filename for a worker + snapshotting transaction.
fn snapshot_filename(worker: WorkerId, tx: TxId) -> String {
    format!("snapshot-{:020}-w{}.snap", tx.get(), worker.get())
}

/// Parses `(snapshot tx, worker)` out of a snapshot filename.
///
/// Foreign files yield `None` and are ignored.
#[must_use]
pub fn parse_snapshot_filename(name: &str) -> Option<(TxId, WorkerId)> {
    let rest = name.strip_prefix("snapshot-")?.strip_suffix(".snap")?;
    let (tx, worker) = rest.split_once("-w")?;
    Some((
        TxId::new(tx.parse::<u64>().ok()?),
        WorkerId::new(worker.parse::<u64>().ok()?),
    ))
}

/// Lists snapshot files in a directory, ascending by snapshot tx id.
pub(crate) fn list_snapshot_files(dir: &Path) -> DurabilityResult<Vec<(TxId, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let entries =
        std::fs::read_dir(dir).map_err(|e| DurabilityError::io("read snapshot dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DurabilityError::io("read snapshot dir", e))?;
        if let Some((tx, _)) = entry.file_name().to_str().and_then(parse_snapshot_filename) {
            files.push((tx, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

/// Produces a snapshot of the graph and runs the retention pass.
///
/// Returns the path of the new snapshot file.
///
/// # Errors
/// Returns an I/O error if the dump fails; the partial file is deleted
/// first.
#[allow(clippy::cast_possible_wrap)] // Ids and counts stay far below i64::MAX.
pub fn make_snapshot(
    graph: &InMemoryGraph,
    tx: &Transaction,
    durability_dir: &Path,
    max_retained: i64,
) -> DurabilityResult<PathBuf> {
    let dir = snapshot_dir(durability_dir);
    std::fs::create_dir_all(&dir).map_err(|e| DurabilityError::io("create snapshot dir", e))?;

    let path = dir.join(snapshot_filename(graph.worker_id(), tx.id));
    if path.exists() {
        return Err(DurabilityError::io(
            "create snapshot",
            format!("{} already exists", path.display()),
        ));
    }

    if let Err(e) = encode_snapshot(graph, tx, &path) {
        if path.exists() {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                error!(
                    path = %path.display(),
                    error = %remove_err,
                    "Failed to remove partial snapshot"
                );
            }
        }
        return Err(e);
    }

    info!(
        path = %path.display(),
        tx = tx.id.get(),
        vertices = graph.vertex_count(),
        edges = graph.edge_count(),
        "Wrote snapshot"
    );

    remove_old_snapshots(&dir, max_retained)?;
    remove_old_wals(&wal_dir(durability_dir), tx)?;
    Ok(path)
}

fn encode_snapshot(
    graph: &InMemoryGraph,
    tx: &Transaction,
    path: &Path,
) -> DurabilityResult<()> {
    let file = File::options()
        .create_new(true)
        .write(true)
        .open(path)
        .map_err(|e| DurabilityError::io("create snapshot", e))?;
    let mut writer = HashedWriter::new(BufWriter::new(file));

    writer.write_bytes(SNAPSHOT_MAGIC)?;

    #[allow(clippy::cast_possible_wrap)]
    {
        let mut encoder = Encoder::new(&mut writer);
        encoder.write_int(DURABILITY_VERSION)?;

        // The worker id guarantees consistent cluster state after recovery.
        encoder.write_int(graph.worker_id().get() as i64)?;

        // Generator high-water marks, used to restore the id generators.
        let (vertex_gen, edge_gen) = graph.generator_counts();
        encoder.write_int(vertex_gen as i64)?;
        encoder.write_int(edge_gen as i64)?;

        // The snapshotting transaction and its snapshot set bound WAL replay.
        encoder.write_int(tx.id.get() as i64)?;
        let snapshot_set: Vec<i64> = tx.snapshot.iter().map(|t| t.get() as i64).collect();
        encoder.write_int_list(&snapshot_set)?;

        // Label+property index keys, flat: [label, property, ...].
        let mut index_keys = Vec::new();
        for (label, property) in graph.index_keys() {
            index_keys.push(label);
            index_keys.push(property);
        }
        encoder.write_string_list(&index_keys)?;

        for vertex in graph.vertex_records() {
            encoder.write_int(vertex.gid.get() as i64)?;
            encoder.write_string_list(&vertex.labels)?;
            encoder.write_value(&PropertyValue::Map(vertex.properties))?;
        }
        for edge in graph.edge_records() {
            encoder.write_int(edge.gid.get() as i64)?;
            encoder.write_int(edge.from.get() as i64)?;
            encoder.write_int(edge.to.get() as i64)?;
            encoder.write_string(&edge.edge_type)?;
            encoder.write_value(&PropertyValue::Map(edge.properties))?;
            encoder.write_int(edge.cypher_id)?;
        }
    }

    // Trailer: raw counts, then the digest over everything before it.
    writer.write_u64(graph.vertex_count())?;
    writer.write_u64(graph.edge_count())?;
    let hash = writer.hash();
    writer.write_u64(hash)?;
    writer.close()?;

    writer
        .get_mut()
        .get_ref()
        .sync_data()
        .map_err(|e| DurabilityError::io("fsync snapshot", e))
}

/// Removes snapshot files so that only the `max_retained` newest are kept.
/// `max_retained == -1` retains everything.
fn remove_old_snapshots(dir: &Path, max_retained: i64) -> DurabilityResult<()> {
    if max_retained == -1 {
        return Ok(());
    }
    let files = list_snapshot_files(dir)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let keep = (max_retained.max(0)) as usize;
    if files.len() <= keep {
        return Ok(());
    }
    for (tx, path) in &files[..files.len() - keep] {
        if let Err(e) = std::fs::remove_file(path) {
            error!(path = %path.display(), error = %e, "Failed to remove old snapshot");
        } else {
            info!(path = %path.display(), tx = tx.get(), "Removed superseded snapshot");
        }
    }
    Ok(())
}

/// Removes WAL files that the snapshot transaction fully supersedes: every
/// file whose first transaction id is strictly below the snapshot's
/// minimum interesting transaction.
fn remove_old_wals(wal_dir: &Path, snapshot_tx: &Transaction) -> DurabilityResult<()> {
    let min_tx = snapshot_tx.min_interesting();
    for (first_tx, path) in list_wal_files(wal_dir)? {
        if first_tx < min_tx {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Unable to delete old wal file");
            } else {
                info!(path = %path.display(), first_tx = first_tx.get(), "Removed superseded WAL");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalConfig, WalWriter};
    use lattice_core::Gid;
    use lattice_storage::{GraphAccessor, TransactionEngine};

    fn graph_with_data() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new(WorkerId::new(1));
        graph.insert_vertex(Gid::new(1)).unwrap();
        graph.insert_vertex(Gid::new(2)).unwrap();
        graph
            .insert_edge(Gid::new(0), Gid::new(1), Gid::new(2), "KNOWS")
            .unwrap();
        graph
    }

    #[test]
    fn test_snapshot_file_created() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();
        let mut engine = TransactionEngine::new();
        let tx = engine.begin();

        let path = make_snapshot(&graph, &tx, dir.path(), -1).unwrap();
        assert!(path.exists());
        assert!(path.file_name().unwrap().to_str().unwrap().contains("-w1"));
    }

    #[test]
    fn test_existing_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();
        let mut engine = TransactionEngine::new();
        let tx = engine.begin();

        make_snapshot(&graph, &tx, dir.path(), -1).unwrap();
        assert!(make_snapshot(&graph, &tx, dir.path(), -1).is_err());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();
        let mut engine = TransactionEngine::new();

        for _ in 0..4 {
            let tx = engine.begin();
            make_snapshot(&graph, &tx, dir.path(), 2).unwrap();
            engine.finish(tx.id);
        }

        let files = list_snapshot_files(&snapshot_dir(dir.path())).unwrap();
        assert_eq!(files.len(), 2);
        // The newest two survive.
        assert_eq!(files[0].0, TxId::new(3));
        assert_eq!(files[1].0, TxId::new(4));
    }

    #[test]
    fn test_retention_unbounded() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();
        let mut engine = TransactionEngine::new();

        for _ in 0..3 {
            let tx = engine.begin();
            make_snapshot(&graph, &tx, dir.path(), -1).unwrap();
            engine.finish(tx.id);
        }

        assert_eq!(list_snapshot_files(&snapshot_dir(dir.path())).unwrap().len(), 3);
    }

    #[test]
    fn test_wal_pruning_with_empty_inflight_set() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();

        // Three WAL segments, first txs 1, 3, 9.
        let wal_path = wal_dir(dir.path());
        let config = WalConfig::new(&wal_path).with_rotate_size(1);
        let mut wal = WalWriter::open(config).unwrap();
        for tx in [1u64, 3, 9] {
            wal.commit(TxId::new(tx)).unwrap();
        }
        wal.close().unwrap();

        // Snapshot at tx 8 with nothing in flight: min interesting is 9,
        // so segments 1 and 3 are fully covered.
        let mut engine = TransactionEngine::new();
        engine.fast_forward(TxId::new(7));
        let tx = engine.begin();
        assert_eq!(tx.id, TxId::new(8));
        make_snapshot(&graph, &tx, dir.path(), -1).unwrap();

        let remaining = list_wal_files(&wal_path).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, TxId::new(9));
    }

    #[test]
    fn test_wal_pruning_respects_inflight_set() {
        let dir = tempfile::tempdir().unwrap();
        let graph = graph_with_data();

        let wal_path = wal_dir(dir.path());
        let config = WalConfig::new(&wal_path).with_rotate_size(1);
        let mut wal = WalWriter::open(config).unwrap();
        for tx in [1u64, 3, 9] {
            wal.commit(TxId::new(tx)).unwrap();
        }
        wal.close().unwrap();

        // Tx 3 is still in flight when the snapshot transaction begins, so
        // the segment starting at 3 must survive.
        let mut engine = TransactionEngine::new();
        engine.fast_forward(TxId::new(2));
        let in_flight = engine.begin();
        assert_eq!(in_flight.id, TxId::new(3));
        let snap_tx = engine.begin();
        make_snapshot(&graph, &snap_tx, dir.path(), -1).unwrap();

        let remaining: Vec<u64> = list_wal_files(&wal_path)
            .unwrap()
            .into_iter()
            .map(|(tx, _)| tx.get())
            .collect();
        assert_eq!(remaining, vec![3, 9]);
    }

    #[test]
    fn test_filename_roundtrip() {
        let name = snapshot_filename(WorkerId::new(2), TxId::new(50));
        assert_eq!(
            parse_snapshot_filename(&name),
            Some((TxId::new(50), WorkerId::new(2)))
        );
        assert_eq!(parse_snapshot_filename("wal-1.wal"), None);
    }
}
