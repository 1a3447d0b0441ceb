//! Write-ahead log writer.
//!
//! Mutation deltas are buffered in memory per transaction. On commit the
//! buffered records hit the active segment as `TxBegin`, the mutations in
//! emission order, then `TxCommit`, each framed with the running hash, and
//! the file is fsynced before the commit is acknowledged. On abort only a
//! `TxAbort` marker is written.
//!
//! A transaction whose log ends without either marker crashed mid-commit
//! and is treated as aborted on recovery.
//!
//! # File Layout
//!
//! ```text
//! /wal-dir/
//!   wal-00000000000000000001.wal   # Sealed segment
//!   wal-00000000000000000087.wal   # Active segment (current writes)
//! ```
//!
//! Segments are named after the first transaction id they contain, which
//! is what the snapshot retention pass and the recovery scan key on.
//! Rotation is by size or age, and only between transactions, so a
//! transaction's records never straddle a segment boundary.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use lattice_core::TxId;
use tracing::{debug, info};

use crate::delta::StateDelta;
use crate::error::{DurabilityError, DurabilityResult};
use crate::hashed_io::HashedWriter;
use crate::limits::{WAL_SEGMENT_AGE_SECONDS_MAX, WAL_SEGMENT_SIZE_BYTES_MAX};

/// WAL configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL segment files.
    pub dir: PathBuf,
    /// Rotate the active segment once it exceeds this size.
    pub rotate_size_bytes: u64,
    /// Rotate the active segment once it is older than this.
    pub rotate_age: Duration,
    /// Whether commit fsyncs the segment file. Disabled only by tests.
    pub sync_on_commit: bool,
}

impl WalConfig {
    /// Creates a configuration with default rotation limits.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rotate_size_bytes: WAL_SEGMENT_SIZE_BYTES_MAX,
            rotate_age: Duration::from_secs(WAL_SEGMENT_AGE_SECONDS_MAX),
            sync_on_commit: true,
        }
    }

    /// Sets the rotation size.
    #[must_use]
    pub const fn with_rotate_size(mut self, bytes: u64) -> Self {
        self.rotate_size_bytes = bytes;
        self
    }

    /// Sets the rotation age.
    #[must_use]
    pub const fn with_rotate_age(mut self, age: Duration) -> Self {
        self.rotate_age = age;
        self
    }
}

/// Returns the segment filename for the given first transaction id.
#[must_use]
pub(crate) fn wal_filename(first_tx: TxId) -> String {
    format!("wal-{:020}.wal", first_tx.get())
}

/// Parses the first transaction id out of a WAL segment filename.
///
/// Foreign files in the directory yield `None` and are ignored by the
/// retention and recovery passes.
#[must_use]
pub fn parse_wal_filename(name: &str) -> Option<TxId> {
    let rest = name.strip_prefix("wal-")?.strip_suffix(".wal")?;
    rest.parse::<u64>().ok().map(TxId::new)
}

/// The active segment being written to.
struct ActiveSegment {
    writer: HashedWriter<BufWriter<File>>,
    path: PathBuf,
    first_tx: TxId,
    created_at: Instant,
}

/// Per-transaction buffered record stream with fsync-on-commit.
///
/// Single producer: all commits are serialised through `&mut self`, which
/// is how transaction framing stays contiguous on disk.
pub struct WalWriter {
    config: WalConfig,
    buffers: BTreeMap<TxId, Vec<StateDelta>>,
    active: Option<ActiveSegment>,
}

impl WalWriter {
    /// Creates a WAL writer, creating the directory if needed.
    ///
    /// # Errors
    /// Returns an I/O error if the directory cannot be created.
    pub fn open(config: WalConfig) -> DurabilityResult<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| DurabilityError::io("create wal dir", e))?;
        Ok(Self {
            config,
            buffers: BTreeMap::new(),
            active: None,
        })
    }

    /// Buffers a mutation delta for its owning transaction.
    ///
    /// # Panics
    /// Panics on a transaction-control delta; the commit path writes those
    /// markers itself.
    pub fn buffer(&mut self, delta: StateDelta) {
        assert!(
            !delta.kind().is_transaction_control(),
            "transaction markers are written by commit/abort"
        );
        self.buffers.entry(delta.tx()).or_default().push(delta);
    }

    /// Returns the number of deltas buffered for a transaction.
    #[must_use]
    pub fn buffered(&self, tx: TxId) -> usize {
        self.buffers.get(&tx).map_or(0, Vec::len)
    }

    /// Commits a transaction: writes `TxBegin`, the buffered mutations in
    /// emission order, `TxCommit`, then flushes and fsyncs.
    ///
    /// # Errors
    /// Returns an I/O error if any write, flush or sync fails.
    pub fn commit(&mut self, tx: TxId) -> DurabilityResult<()> {
        let deltas = self.buffers.remove(&tx).unwrap_or_default();

        self.ensure_segment(tx)?;
        let active = self.active.as_mut().expect("segment exists after ensure");

        StateDelta::TxBegin { tx }.encode(&mut active.writer)?;
        for delta in &deltas {
            delta.encode(&mut active.writer)?;
        }
        StateDelta::TxCommit { tx }.encode(&mut active.writer)?;

        active.writer.flush()?;
        if self.config.sync_on_commit {
            active
                .writer
                .get_mut()
                .get_ref()
                .sync_data()
                .map_err(|e| DurabilityError::io("fsync", e))?;
        }

        debug!(tx = tx.get(), deltas = deltas.len(), "Committed transaction to WAL");
        Ok(())
    }

    /// Aborts a transaction: drops its buffer and writes `TxAbort`.
    ///
    /// # Errors
    /// Returns an I/O error if the write or flush fails.
    pub fn abort(&mut self, tx: TxId) -> DurabilityResult<()> {
        self.buffers.remove(&tx);

        self.ensure_segment(tx)?;
        let active = self.active.as_mut().expect("segment exists after ensure");

        StateDelta::TxAbort { tx }.encode(&mut active.writer)?;
        active.writer.flush()?;

        debug!(tx = tx.get(), "Aborted transaction in WAL");
        Ok(())
    }

    /// Seals the active segment so the next commit opens a fresh one.
    ///
    /// The snapshot protocol rotates here when the snapshot transaction
    /// begins: every segment sealed before that point holds only commits
    /// the snapshot will cover, which is what makes the retention rule
    /// (delete segments whose first tx id is below the snapshot's minimum
    /// interesting tx) safe.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub fn rotate(&mut self) -> DurabilityResult<()> {
        self.close()
    }

    /// Flushes and closes the active segment, if any.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub fn close(&mut self) -> DurabilityResult<()> {
        if let Some(mut active) = self.active.take() {
            active.writer.close()?;
            info!(path = %active.path.display(), "Sealed WAL segment");
        }
        Ok(())
    }

    /// Returns the path of the active segment, if one is open.
    #[must_use]
    pub fn active_segment_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// Ensures there is an active segment with room, rotating if needed.
    fn ensure_segment(&mut self, tx: TxId) -> DurabilityResult<()> {
        let needs_rotation = self.active.as_ref().is_some_and(|active| {
            active.writer.bytes_written() >= self.config.rotate_size_bytes
                || active.created_at.elapsed() >= self.config.rotate_age
        });
        if needs_rotation {
            self.close()?;
        }
        if self.active.is_some() {
            return Ok(());
        }

        let path = self.config.dir.join(wal_filename(tx));
        let file = File::options()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| DurabilityError::io("create wal segment", e))?;

        info!(path = %path.display(), first_tx = tx.get(), "Created WAL segment");
        self.active = Some(ActiveSegment {
            writer: HashedWriter::new(BufWriter::new(file)),
            path,
            first_tx: tx,
            created_at: Instant::now(),
        });
        Ok(())
    }

    /// Returns the first transaction id of the active segment, if any.
    #[must_use]
    pub fn active_segment_first_tx(&self) -> Option<TxId> {
        self.active.as_ref().map(|a| a.first_tx)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Lists the WAL segment files in a directory, ascending by first tx id.
pub(crate) fn list_wal_files(dir: &Path) -> DurabilityResult<Vec<(TxId, PathBuf)>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let entries = std::fs::read_dir(dir).map_err(|e| DurabilityError::io("read wal dir", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| DurabilityError::io("read wal dir", e))?;
        let name = entry.file_name();
        if let Some(first_tx) = name.to_str().and_then(parse_wal_filename) {
            files.push((first_tx, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashed_io::HashedReader;
    use crate::DeltaKind;
    use lattice_core::Gid;
    use std::io::BufReader;

    fn read_all(path: &Path) -> Vec<StateDelta> {
        let file = File::open(path).unwrap();
        let mut reader = HashedReader::new(BufReader::new(file));
        let mut deltas = Vec::new();
        loop {
            if reader.at_eof() {
                break;
            }
            deltas.push(StateDelta::decode(&mut reader).unwrap());
        }
        deltas
    }

    fn create_vertex(tx: u64, gid: u64) -> StateDelta {
        StateDelta::CreateVertex {
            tx: TxId::new(tx),
            vertex: Gid::new(gid),
        }
    }

    #[test]
    fn test_commit_frames_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(WalConfig::new(dir.path())).unwrap();

        wal.buffer(create_vertex(42, 7));
        wal.commit(TxId::new(42)).unwrap();
        let path = wal.active_segment_path().unwrap().to_owned();
        wal.close().unwrap();

        let deltas = read_all(&path);
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas[0].kind(), DeltaKind::TxBegin);
        assert_eq!(deltas[1], create_vertex(42, 7));
        assert_eq!(deltas[2].kind(), DeltaKind::TxCommit);
    }

    #[test]
    fn test_abort_writes_only_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(WalConfig::new(dir.path())).unwrap();

        wal.buffer(create_vertex(5, 1));
        wal.abort(TxId::new(5)).unwrap();
        let path = wal.active_segment_path().unwrap().to_owned();
        wal.close().unwrap();

        let deltas = read_all(&path);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].kind(), DeltaKind::TxAbort);
    }

    #[test]
    fn test_commits_interleave_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(WalConfig::new(dir.path())).unwrap();

        wal.buffer(create_vertex(1, 10));
        wal.buffer(create_vertex(2, 20));
        wal.commit(TxId::new(2)).unwrap();
        wal.commit(TxId::new(1)).unwrap();
        let path = wal.active_segment_path().unwrap().to_owned();
        wal.close().unwrap();

        let deltas = read_all(&path);
        // Each transaction's Begin..Commit pairing is contiguous.
        let txs: Vec<u64> = deltas.iter().map(|d| d.tx().get()).collect();
        assert_eq!(txs, vec![2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new(dir.path()).with_rotate_size(64);
        let mut wal = WalWriter::open(config).unwrap();

        wal.commit(TxId::new(1)).unwrap();
        let first = wal.active_segment_path().unwrap().to_owned();
        wal.commit(TxId::new(2)).unwrap();
        let second = wal.active_segment_path().unwrap().to_owned();
        wal.close().unwrap();

        assert_ne!(first, second);
        let files = list_wal_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].0, TxId::new(1));
        assert_eq!(files[1].0, TxId::new(2));
    }

    #[test]
    fn test_filename_roundtrip() {
        let name = wal_filename(TxId::new(87));
        assert_eq!(parse_wal_filename(&name), Some(TxId::new(87)));

        assert_eq!(parse_wal_filename("snapshot-1"), None);
        assert_eq!(parse_wal_filename("wal-junk.wal"), None);
    }

    #[test]
    fn test_list_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join(wal_filename(TxId::new(3))), b"").unwrap();

        let files = list_wal_files(dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, TxId::new(3));
    }

    #[test]
    #[should_panic(expected = "transaction markers are written by commit/abort")]
    fn test_buffering_marker_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WalWriter::open(WalConfig::new(dir.path())).unwrap();
        wal.buffer(StateDelta::TxBegin { tx: TxId::new(1) });
    }
}
