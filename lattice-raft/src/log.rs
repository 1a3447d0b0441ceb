//! Raft log entries and the in-memory log.

use lattice_core::{LogIndex, TermId};
use lattice_durability::StateDelta;

/// A single entry in the Raft log: a state delta stamped with the term it
/// was proposed under.
///
/// Two committed entries with the same index on any peer are byte
/// identical; the index space is dense and gaps are impossible.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// The term when this entry was created.
    pub term: TermId,
    /// The log index of this entry.
    pub index: LogIndex,
    /// The replicated command.
    pub delta: StateDelta,
}

impl LogEntry {
    /// Creates a new log entry.
    #[must_use]
    pub const fn new(term: TermId, index: LogIndex, delta: StateDelta) -> Self {
        Self { term, index, delta }
    }
}

/// In-memory Raft log with prefix compaction.
///
/// Entries below the compaction boundary live only in snapshots; the log
/// remembers the boundary's term so consistency checks against it still
/// answer correctly.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// Log entries above the compaction boundary.
    entries: Vec<LogEntry>,
    /// Index of the first retained entry (0 when the log is empty).
    first_index: u64,
    /// Last index covered by a snapshot (0 = nothing compacted).
    last_included_index: LogIndex,
    /// Term of the entry at `last_included_index`.
    last_included_term: TermId,
}

impl RaftLog {
    /// Creates a new empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            first_index: 0,
            last_included_index: LogIndex::new(0),
            last_included_term: TermId::new(0),
        }
    }

    /// Returns true if the log holds no entries above the boundary.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Returns the last log index, including the compaction boundary.
    #[must_use]
    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.last_included_index
        } else {
            #[allow(clippy::cast_possible_truncation)] // Bounded by memory.
            let idx = self.first_index + self.entries.len() as u64 - 1;
            LogIndex::new(idx)
        }
    }

    /// Returns the term of the last entry.
    #[must_use]
    pub fn last_term(&self) -> TermId {
        self.entries
            .last()
            .map_or(self.last_included_term, |e| e.term)
    }

    /// Gets a retained entry by index.
    #[must_use]
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if self.entries.is_empty() || index.get() < self.first_index {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)] // Bounded by entries.len().
        let offset = (index.get() - self.first_index) as usize;
        self.entries.get(offset)
    }

    /// Returns the term at a given index, answering for the compaction
    /// boundary as well. Unknown indexes report term 0.
    #[must_use]
    pub fn term_at(&self, index: LogIndex) -> TermId {
        if index == self.last_included_index {
            return self.last_included_term;
        }
        self.get(index).map_or(TermId::new(0), |e| e.term)
    }

    /// Appends an entry to the log.
    ///
    /// # Panics
    /// Panics if the entry index is not sequential.
    pub fn append(&mut self, entry: LogEntry) {
        // After compaction `first_index` already points past the boundary;
        // on a fresh log the first append fixes the base index.
        let expected_index = if self.entries.is_empty() && self.last_included_index.get() == 0 {
            self.first_index = entry.index.get();
            entry.index.get()
        } else {
            self.last_index().get() + 1
        };

        assert_eq!(
            entry.index.get(),
            expected_index,
            "log entry index must be sequential: expected {}, got {}",
            expected_index,
            entry.index.get()
        );

        self.entries.push(entry);
    }

    /// Appends entries, truncating a conflicting suffix first.
    pub fn append_entries(&mut self, entries: Vec<LogEntry>) {
        for entry in entries {
            if let Some(existing) = self.get(entry.index) {
                if existing.term != entry.term {
                    // Conflict: truncate from this point.
                    self.truncate_after(LogIndex::new(entry.index.get() - 1));
                }
            }

            if entry.index.get() > self.last_index().get() {
                self.append(entry);
            }
        }
    }

    /// Truncates the log after the given index, keeping entries up to and
    /// including `last_to_keep`.
    pub fn truncate_after(&mut self, last_to_keep: LogIndex) {
        if self.entries.is_empty() {
            return;
        }

        if last_to_keep.get() < self.first_index {
            self.entries.clear();
            return;
        }

        #[allow(clippy::cast_possible_truncation)] // Bounded by entries.len().
        let keep_count = (last_to_keep.get() - self.first_index + 1) as usize;
        if keep_count < self.entries.len() {
            self.entries.truncate(keep_count);
        }
    }

    /// Compacts the log to entries strictly above `last_included_index`.
    ///
    /// Called at an install-snapshot boundary; everything at or below the
    /// index is covered by the snapshot.
    pub fn compact_to(&mut self, last_included_index: LogIndex) {
        if last_included_index <= self.last_included_index {
            return;
        }

        let boundary_term = self.term_at(last_included_index);
        #[allow(clippy::cast_possible_truncation)] // Bounded by entries.len().
        let drop_count = self
            .entries
            .iter()
            .take_while(|e| e.index <= last_included_index)
            .count();
        self.entries.drain(..drop_count);

        self.last_included_index = last_included_index;
        self.last_included_term = boundary_term;
        self.first_index = last_included_index.get() + 1;
    }

    /// Returns the compaction boundary index.
    #[must_use]
    pub const fn last_included_index(&self) -> LogIndex {
        self.last_included_index
    }

    /// Returns entries from `start_index` to the end.
    #[must_use]
    pub fn entries_from(&self, start_index: LogIndex) -> Vec<LogEntry> {
        if self.entries.is_empty() || start_index.get() > self.last_index().get() {
            return Vec::new();
        }

        let start = if start_index.get() < self.first_index {
            0
        } else {
            #[allow(clippy::cast_possible_truncation)] // Bounded by entries.len().
            let s = (start_index.get() - self.first_index) as usize;
            s
        };

        self.entries[start..].to_vec()
    }

    /// Checks if our log is at least as up-to-date as
    /// (`other_term`, `other_index`), the voting rule.
    #[must_use]
    pub fn is_up_to_date(&self, other_term: TermId, other_index: LogIndex) -> bool {
        let my_term = self.last_term();
        let my_index = self.last_index();

        // Compare by term first, then by index.
        my_term > other_term || (my_term == other_term && my_index >= other_index)
    }
}
