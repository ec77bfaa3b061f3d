//! The interface a storage engine exposes for driving transactions.

use std::sync::Arc;

use crate::transaction::Transaction;
use crate::{IsolationLevel, Timestamp};

/// Owns the set of live transactions of one storage engine.
///
/// Ids and timestamps come from the [`TimestampOracle`](crate::TimestampOracle)
/// handed to the manager at construction; the manager only decides which
/// transactions are alive and what may be reclaimed.
pub trait TxnManager {
    type Transaction: Transaction + Send + Sync;
    type Error;

    /// Register a fresh transaction reading the latest committed state.
    fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Arc<Self::Transaction>, Self::Error>;

    /// Retire a committed or aborted transaction. Committed ones are parked
    /// until cleanup can reclaim their undo data.
    fn finish_transaction(&self, txn: &Self::Transaction) -> Result<(), Self::Error>;

    /// Reclaim parked transactions that committed below the watermark.
    /// Returns how many were reclaimed.
    fn garbage_collect(&self) -> Result<usize, Self::Error>;

    /// Oldest start timestamp any live reader may still use.
    fn low_watermark(&self) -> Timestamp;
}
