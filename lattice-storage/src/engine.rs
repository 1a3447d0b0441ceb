//! Transaction engine.
//!
//! Issues globally monotonic transaction identifiers and records, for each
//! transaction, the *snapshot set*: the ids that were in flight when it
//! began. The snapshot set is what bounds WAL replay after a checkpoint.

use std::collections::BTreeSet;

use lattice_core::TxId;

/// A transaction handle issued by the [`TransactionEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// This transaction's id.
    pub id: TxId,
    /// Ids of transactions in flight when this one began, ascending.
    pub snapshot: Vec<TxId>,
}

impl Transaction {
    /// Returns the lowest transaction id whose effects this transaction
    /// might not observe: the head of the snapshot set, or `id + 1` when
    /// nothing was in flight.
    ///
    /// A snapshot taken under this transaction supersedes every WAL file
    /// whose first transaction id is strictly below this value.
    #[must_use]
    pub fn min_interesting(&self) -> TxId {
        self.snapshot
            .first()
            .copied()
            .unwrap_or_else(|| self.id.next())
    }
}

/// Issues monotonically increasing transaction ids and tracks which are
/// in flight.
#[derive(Debug)]
pub struct TransactionEngine {
    next_id: TxId,
    active: BTreeSet<TxId>,
}

impl TransactionEngine {
    /// Creates a new engine; the first transaction gets id 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: TxId::new(1),
            active: BTreeSet::new(),
        }
    }

    /// Begins a transaction, capturing the in-flight set as its snapshot.
    pub fn begin(&mut self) -> Transaction {
        let id = self.next_id;
        self.next_id = id.next();

        let snapshot = self.active.iter().copied().collect();
        self.active.insert(id);

        Transaction { id, snapshot }
    }

    /// Marks a transaction as finished (committed or aborted).
    pub fn finish(&mut self, id: TxId) {
        self.active.remove(&id);
    }

    /// Returns true if the transaction is still in flight.
    #[must_use]
    pub fn is_active(&self, id: TxId) -> bool {
        self.active.contains(&id)
    }

    /// Returns the id the next transaction will receive.
    #[must_use]
    pub const fn next_id(&self) -> TxId {
        self.next_id
    }

    /// Advances the id clock past `id`, if it is not already.
    ///
    /// Used after recovery so fresh transactions never reuse a replayed id.
    pub fn fast_forward(&mut self, id: TxId) {
        if self.next_id <= id {
            self.next_id = id.next();
        }
    }
}

impl Default for TransactionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut engine = TransactionEngine::new();

        let a = engine.begin();
        let b = engine.begin();

        assert_eq!(a.id, TxId::new(1));
        assert_eq!(b.id, TxId::new(2));
        assert!(a.id < b.id);
    }

    #[test]
    fn test_snapshot_captures_in_flight() {
        let mut engine = TransactionEngine::new();

        let a = engine.begin();
        let b = engine.begin();
        assert!(a.snapshot.is_empty());
        assert_eq!(b.snapshot, vec![a.id]);

        engine.finish(a.id);
        let c = engine.begin();
        assert_eq!(c.snapshot, vec![b.id]);
    }

    #[test]
    fn test_min_interesting() {
        let mut engine = TransactionEngine::new();

        // Empty snapshot: everything before id + 1 is covered.
        let a = engine.begin();
        assert_eq!(a.min_interesting(), TxId::new(2));

        // Non-empty snapshot: the oldest in-flight id bounds replay.
        let b = engine.begin();
        assert_eq!(b.min_interesting(), a.id);
    }

    #[test]
    fn test_fast_forward() {
        let mut engine = TransactionEngine::new();
        engine.fast_forward(TxId::new(100));
        assert_eq!(engine.begin().id, TxId::new(101));

        // Never moves backwards.
        engine.fast_forward(TxId::new(5));
        assert_eq!(engine.begin().id, TxId::new(102));
    }
}
