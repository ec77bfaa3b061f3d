pub mod model;
pub mod wal;

// Re-export commonly used types
pub use model::row::Row;
pub use model::value::Value;
use ember_transaction::Timestamp;
use serde::{Deserialize, Serialize};

pub type DatabaseId = u64;
pub type TableId = u64;
pub type IndexId = u64;
pub type RowId = u64;

/// Identifies one row across all tables of a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey {
    pub table: TableId,
    pub row: RowId,
}

impl RowKey {
    pub fn new(table: TableId, row: RowId) -> Self {
        Self { table, row }
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.row)
    }
}

/// The read view of one transaction: its own id plus its start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub txn_id: Timestamp,
    pub start_ts: Timestamp,
}

impl Snapshot {
    pub fn new(txn_id: Timestamp, start_ts: Timestamp) -> Self {
        Self { txn_id, start_ts }
    }

    /// A read view that sees every committed version and nothing uncommitted.
    pub fn committed() -> Self {
        Self {
            txn_id: Timestamp::with_ts(Timestamp::TXN_ID_START),
            start_ts: Timestamp::max_commit_ts(),
        }
    }

    /// A version stamped `ts` is visible if this transaction wrote it, or if it
    /// was committed no later than the snapshot.
    pub fn sees(&self, ts: Timestamp) -> bool {
        ts == self.txn_id || (ts.is_commit_ts() && ts <= self.start_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_visibility() {
        let me = Timestamp::with_ts(Timestamp::TXN_ID_START + 5);
        let other = Timestamp::with_ts(Timestamp::TXN_ID_START + 6);
        let snapshot = Snapshot::new(me, Timestamp::with_ts(10));

        assert!(snapshot.sees(Timestamp::with_ts(3)));
        assert!(snapshot.sees(Timestamp::with_ts(10)));
        assert!(!snapshot.sees(Timestamp::with_ts(11)));
        assert!(snapshot.sees(me));
        assert!(!snapshot.sees(other));
    }
}
