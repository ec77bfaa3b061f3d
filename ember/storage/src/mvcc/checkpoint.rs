use std::sync::Arc;

use ember_transaction::Timestamp;
use parking_lot::MutexGuard;

use crate::database::Database;
use crate::error::StorageResult;

/// Holds the commit lock so no transaction is mid-commit while a checkpoint
/// coordinator reads a consistent point of the database.
///
/// New transactions cannot begin while the guard is alive either, since they
/// draw their snapshot under the same lock. Committing or beginning from the
/// thread that holds the guard deadlocks.
pub struct CommitQuiesceGuard<'a> {
    _commit: MutexGuard<'a, ()>,
    database: Arc<Database>,
    latest_commit_ts: Timestamp,
}

impl<'a> CommitQuiesceGuard<'a> {
    pub(super) fn new(
        commit: MutexGuard<'a, ()>,
        database: Arc<Database>,
        latest_commit_ts: Timestamp,
    ) -> Self {
        Self {
            _commit: commit,
            database,
            latest_commit_ts,
        }
    }

    /// Commit timestamp of the last transaction committed before the guard.
    pub fn latest_commit_ts(&self) -> Timestamp {
        self.latest_commit_ts
    }

    /// Every record below this LSN belongs to a finished commit.
    pub fn next_lsn(&self) -> u64 {
        self.database.wal_manager().next_lsn()
    }

    /// Discard log records below `lsn` once the state they describe has been
    /// persisted elsewhere. Returns the number of records removed.
    pub fn truncate_wal_until(&self, lsn: u64) -> StorageResult<usize> {
        let removed = self.database.wal_manager().truncate_until(lsn)?;
        tracing::info!(
            database = %self.database.name(),
            lsn,
            removed,
            "truncated write-ahead log"
        );
        Ok(removed)
    }
}
