//! Id sequence service
//!
//! One atomic counter per id class. Seeds are injectable so tests get stable
//! ids; replay bumps the counters past every id it sees.

use super::id::{DatabaseId, SegmentId, TableId, TxnId};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct Sequence {
    database: AtomicU64,
    table: AtomicU64,
    txn: AtomicU64,
}

impl Sequence {
    pub fn new() -> Self {
        // Id 1 is reserved for the system database.
        Self::with_seeds(2, 1, 1)
    }

    pub fn with_seeds(database: u64, table: u64, txn: u64) -> Self {
        Self {
            database: AtomicU64::new(database),
            table: AtomicU64::new(table),
            txn: AtomicU64::new(txn),
        }
    }

    pub fn next_database_id(&self) -> DatabaseId {
        self.database.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_table_id(&self) -> TableId {
        self.table.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_txn_id(&self) -> TxnId {
        self.txn.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_segment_id(&self) -> SegmentId {
        SegmentId::generate()
    }

    /// Push a counter past a replayed id.
    pub fn observe_database_id(&self, id: DatabaseId) {
        self.database.fetch_max(id + 1, Ordering::SeqCst);
    }

    pub fn observe_table_id(&self, id: TableId) {
        self.table.fetch_max(id + 1, Ordering::SeqCst);
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let seq = Sequence::with_seeds(10, 100, 1);
        assert_eq!(seq.next_database_id(), 10);
        assert_eq!(seq.next_database_id(), 11);
        assert_eq!(seq.next_table_id(), 100);
        assert_eq!(seq.next_txn_id(), 1);
    }

    #[test]
    fn test_observe_skips_forward() {
        let seq = Sequence::new();
        seq.observe_table_id(500);
        assert_eq!(seq.next_table_id(), 501);
        // Observing something older is a no-op.
        seq.observe_table_id(3);
        assert_eq!(seq.next_table_id(), 502);
    }
}
