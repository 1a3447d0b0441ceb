//! Cold-start recovery.
//!
//! Recovery loads the newest valid snapshot, then replays every WAL
//! segment the snapshot does not cover. Records are buffered per
//! transaction; a buffer is applied when its `TxCommit` arrives and
//! discarded on `TxAbort` or end-of-log-without-commit (a crash mid
//! commit). Replay is idempotent: recovering twice from the same files
//! yields the same state.
//!
//! A torn record at the tail of the last segment is benign (the rolling
//! hash rejects it and everything prior is usable). A torn record
//! mid-stream is fatal; the driver refuses to proceed past it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufReader;
use std::path::Path;

use lattice_core::{Gid, PropertyValue, TxId, WorkerId};
use lattice_storage::{GraphAccessor, InMemoryGraph, TransactionEngine};
use tracing::{info, warn};

use crate::codec::Decoder;
use crate::delta::{DeltaKind, StateDelta};
use crate::error::{DurabilityError, DurabilityResult};
use crate::hashed_io::{digest, HashedReader};
use crate::snapshot::{
    list_snapshot_files, snapshot_dir, wal_dir, DURABILITY_VERSION, SNAPSHOT_MAGIC,
};
use crate::wal::list_wal_files;

/// Size of the raw snapshot trailer: vertex count, edge count, file hash.
const SNAPSHOT_TRAILER_SIZE: usize = 24;

/// The state rebuilt by [`recover`].
#[derive(Debug)]
pub struct RecoveredState {
    /// The rebuilt graph.
    pub graph: InMemoryGraph,
    /// A transaction engine fast-forwarded past every recovered id.
    pub engine: TransactionEngine,
    /// The transaction id of the loaded snapshot, if one was found.
    pub snapshot_tx: Option<TxId>,
    /// Number of committed transactions replayed from the WAL.
    pub replayed_transactions: u64,
}

struct LoadedSnapshot {
    graph: InMemoryGraph,
    snapshot_tx: TxId,
    snapshot_set: Vec<TxId>,
}

/// Recovers database state from a durability directory.
///
/// # Errors
/// Returns a corruption error on a version mismatch, a torn record
/// mid-stream, or a delta the accessor refuses; an I/O error if files
/// cannot be read.
pub fn recover(durability_dir: &Path, worker: WorkerId) -> DurabilityResult<RecoveredState> {
    // Find the newest snapshot that loads cleanly. A version mismatch is a
    // hard failure; a corrupt file falls back to the next older one.
    let mut loaded: Option<LoadedSnapshot> = None;
    let snapshots = list_snapshot_files(&snapshot_dir(durability_dir))?;
    for (tx, path) in snapshots.iter().rev() {
        match load_snapshot(path, worker) {
            Ok(snapshot) => {
                info!(path = %path.display(), tx = tx.get(), "Loaded snapshot");
                loaded = Some(snapshot);
                break;
            }
            Err(e @ DurabilityError::VersionMismatch { .. }) => return Err(e),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unusable snapshot");
            }
        }
    }

    let (mut graph, snapshot_tx, snapshot_set) = match loaded {
        Some(snapshot) => (
            snapshot.graph,
            Some(snapshot.snapshot_tx),
            snapshot.snapshot_set,
        ),
        None => (InMemoryGraph::new(worker), None, Vec::new()),
    };

    // Every WAL file whose first transaction id is at least the snapshot's
    // minimum interesting transaction may still hold uncovered commits.
    let min_interesting = snapshot_tx.map(|tx| {
        snapshot_set.first().copied().unwrap_or_else(|| tx.next())
    });

    let wal_files = list_wal_files(&wal_dir(durability_dir))?;
    let replay: Vec<_> = wal_files
        .into_iter()
        .filter(|&(first_tx, _)| min_interesting.map_or(true, |min| first_tx >= min))
        .collect();

    let snapshot_set: BTreeSet<TxId> = snapshot_set.into_iter().collect();
    let covered = |tx: TxId| -> bool {
        snapshot_tx.is_some_and(|snap| tx <= snap && !snapshot_set.contains(&tx))
    };

    let mut buffers: BTreeMap<TxId, Vec<StateDelta>> = BTreeMap::new();
    let mut max_tx_seen = snapshot_tx.unwrap_or_default();
    let mut replayed_transactions = 0u64;

    let file_count = replay.len();
    for (file_number, (first_tx, path)) in replay.into_iter().enumerate() {
        let is_last_file = file_number + 1 == file_count;
        let file = std::fs::File::open(&path)
            .map_err(|e| DurabilityError::io("open wal segment", e))?;
        let mut reader = HashedReader::new(BufReader::new(file));

        info!(path = %path.display(), first_tx = first_tx.get(), "Replaying WAL segment");
        loop {
            if reader.at_eof() {
                break;
            }
            let delta = match StateDelta::decode(&mut reader) {
                Ok(delta) => delta,
                Err(e) => {
                    if is_last_file && e.is_recoverable_tail() && reader.at_eof() {
                        // Torn write from a crash mid-append; everything
                        // prior is usable.
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "Discarding torn record at WAL tail"
                        );
                        break;
                    }
                    return Err(e);
                }
            };

            let tx = delta.tx();
            max_tx_seen = max_tx_seen.max(tx);
            match delta.kind() {
                DeltaKind::TxBegin => {
                    buffers.insert(tx, Vec::new());
                }
                DeltaKind::TxCommit => {
                    if let Some(deltas) = buffers.remove(&tx) {
                        if !covered(tx) {
                            // Applied under a fresh local transaction that
                            // adopts the original id's logical effects.
                            for delta in &deltas {
                                delta.apply(&mut graph)?;
                            }
                            replayed_transactions += 1;
                        }
                    }
                }
                DeltaKind::TxAbort => {
                    buffers.remove(&tx);
                }
                _ => {
                    if !covered(tx) {
                        buffers.entry(tx).or_default().push(delta);
                    }
                }
            }
        }
    }

    // Buffers left over belong to transactions that crashed before their
    // commit marker; they are treated as aborted.
    if !buffers.is_empty() {
        warn!(
            transactions = buffers.len(),
            "Discarding transactions without a commit marker"
        );
    }

    let mut engine = TransactionEngine::new();
    engine.fast_forward(max_tx_seen);

    info!(
        vertices = graph.vertex_count(),
        edges = graph.edge_count(),
        replayed = replayed_transactions,
        "Recovery complete"
    );

    Ok(RecoveredState {
        graph,
        engine,
        snapshot_tx,
        replayed_transactions,
    })
}

/// Loads and verifies one snapshot file.
#[allow(clippy::cast_sign_loss)] // Counts and ids were encoded from u64s.
fn load_snapshot(path: &Path, worker: WorkerId) -> DurabilityResult<LoadedSnapshot> {
    let bytes = std::fs::read(path).map_err(|e| DurabilityError::io("read snapshot", e))?;
    if bytes.len() < SNAPSHOT_MAGIC.len() + SNAPSHOT_TRAILER_SIZE {
        return Err(DurabilityError::Truncated {
            needed: SNAPSHOT_MAGIC.len() + SNAPSHOT_TRAILER_SIZE - bytes.len(),
        });
    }

    // The trailer digest covers every byte before the hash word itself.
    let trailer_start = bytes.len() - SNAPSHOT_TRAILER_SIZE;
    let trailer = &bytes[trailer_start..];
    let vertex_count = u64::from_le_bytes(trailer[0..8].try_into().expect("8-byte slice"));
    let edge_count = u64::from_le_bytes(trailer[8..16].try_into().expect("8-byte slice"));
    let stored_hash = u64::from_le_bytes(trailer[16..24].try_into().expect("8-byte slice"));
    let computed = digest(&bytes[..bytes.len() - 8]);
    if computed != stored_hash {
        return Err(DurabilityError::CorruptRecord {
            stored: stored_hash,
            computed,
        });
    }

    let mut reader = HashedReader::new(&bytes[..trailer_start]);
    let mut magic = [0u8; 8];
    reader.read_bytes(&mut magic)?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(DurabilityError::BadTag {
            tag: magic[0],
            context: "snapshot magic",
        });
    }

    let mut decoder = Decoder::new(&mut reader);
    let version = decoder.read_int()?;
    if version != DURABILITY_VERSION {
        return Err(DurabilityError::VersionMismatch {
            found: version,
            expected: DURABILITY_VERSION,
        });
    }

    let file_worker = WorkerId::new(decoder.read_int()? as u64);
    if file_worker != worker {
        return Err(DurabilityError::io(
            "load snapshot",
            format!("snapshot belongs to {file_worker}, this is {worker}"),
        ));
    }

    let vertex_gen = decoder.read_int()? as u64;
    let edge_gen = decoder.read_int()? as u64;
    let snapshot_tx = TxId::new(decoder.read_int()? as u64);
    let snapshot_set: Vec<TxId> = decoder
        .read_int_list()?
        .into_iter()
        .map(|tx| TxId::new(tx as u64))
        .collect();
    let index_keys = decoder.read_string_list()?;

    let mut graph = InMemoryGraph::new(worker);
    for _ in 0..vertex_count {
        let gid = Gid::new(decoder.read_int()? as u64);
        let labels = decoder.read_string_list()?;
        let properties = match decoder.read_value()? {
            PropertyValue::Map(entries) => entries,
            _ => {
                return Err(DurabilityError::BadTag {
                    tag: 0,
                    context: "vertex properties map",
                })
            }
        };

        graph
            .insert_vertex(gid)
            .map_err(|e| DurabilityError::ApplyFatal {
                reason: e.to_string(),
            })?;
        for label in &labels {
            graph
                .add_label(gid, label)
                .map_err(|e| DurabilityError::ApplyFatal {
                    reason: e.to_string(),
                })?;
        }
        for (name, value) in properties {
            graph
                .set_vertex_property(gid, &name, value)
                .map_err(|e| DurabilityError::ApplyFatal {
                    reason: e.to_string(),
                })?;
        }
    }

    for _ in 0..edge_count {
        let gid = Gid::new(decoder.read_int()? as u64);
        let from = Gid::new(decoder.read_int()? as u64);
        let to = Gid::new(decoder.read_int()? as u64);
        let edge_type = decoder.read_string()?;
        let properties = match decoder.read_value()? {
            PropertyValue::Map(entries) => entries,
            _ => {
                return Err(DurabilityError::BadTag {
                    tag: 0,
                    context: "edge properties map",
                })
            }
        };
        let cypher_id = decoder.read_int()?;

        graph
            .insert_edge_with_cypher_id(gid, from, to, &edge_type, cypher_id)
            .map_err(|e| DurabilityError::ApplyFatal {
                reason: e.to_string(),
            })?;
        for (name, value) in properties {
            graph
                .set_edge_property(gid, &name, value)
                .map_err(|e| DurabilityError::ApplyFatal {
                    reason: e.to_string(),
                })?;
        }
    }

    // Generators restored last: inserts above already advanced them, the
    // stored high-water marks are authoritative.
    graph.restore_generator_counts(vertex_gen, edge_gen);

    // Indexes are rebuilt synchronously over the loaded vertices.
    let mut keys = index_keys.iter();
    while let (Some(label), Some(property)) = (keys.next(), keys.next()) {
        graph
            .build_index(label, property)
            .map_err(|e| DurabilityError::ApplyFatal {
                reason: e.to_string(),
            })?;
    }

    Ok(LoadedSnapshot {
        graph,
        snapshot_tx,
        snapshot_set,
    })
}
