use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_skiplist::{SkipMap, SkipSet};
use ember_transaction::{
    IsolationLevel, Timestamp, TimestampOracle, Transaction, TransactionState, TxnManager,
};
use parking_lot::{Mutex, MutexGuard};

use super::checkpoint::CommitQuiesceGuard;
use super::cleanup_state::CleanupState;
use super::commit_state::commit_participants;
use super::rollback_state::abort_transaction;
use super::transaction::MemTransaction;
use crate::database::Database;
use crate::error::{StorageError, StorageResult, TransactionError};

/// State shared by every transaction manager of one database instance: the
/// timestamp oracle, the commit lock that totally orders commits, and the start
/// timestamps pinned by meta-transactions.
#[derive(Debug, Default)]
pub struct TransactionClock {
    oracle: TimestampOracle,
    commit_lock: Mutex<()>,
    pinned: SkipSet<(Timestamp, Timestamp)>,
}

impl TransactionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_oracle(oracle: TimestampOracle) -> Self {
        Self {
            oracle,
            ..Self::default()
        }
    }

    pub fn oracle(&self) -> &TimestampOracle {
        &self.oracle
    }

    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Draw a transaction id and a start timestamp. The caller holds the commit
    /// lock, so no commit can interleave between the two draws.
    pub(crate) fn draw_ids(&self) -> StorageResult<(Timestamp, Timestamp)> {
        let txn_id = self
            .oracle
            .next_txn_id()
            .map_err(TransactionError::Timestamp)?;
        let start_ts = self.oracle.next_ts().map_err(TransactionError::Timestamp)?;
        Ok((txn_id, start_ts))
    }

    pub(crate) fn pin(&self, start_ts: Timestamp, txn_id: Timestamp) {
        self.pinned.insert((start_ts, txn_id));
    }

    pub(crate) fn unpin(&self, start_ts: Timestamp, txn_id: Timestamp) {
        self.pinned.remove(&(start_ts, txn_id));
    }

    fn lowest_pinned(&self) -> Option<Timestamp> {
        self.pinned.front().map(|entry| entry.value().0)
    }
}

/// How commit validates a write that could not be applied in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Any version committed after the snapshot conflicts.
    #[default]
    RowLevel,
    /// A newer committed version conflicts only if it changed a column the
    /// deferred update writes. Deletes are still checked per row.
    CellLevel,
}

#[derive(Debug, Clone)]
pub struct TxnManagerConfig {
    /// Run cleanup once this many committed transactions await it.
    pub gc_trigger_threshold: usize,
    /// Upper bound on transactions reclaimed by one cleanup pass.
    pub cleanup_batch_size: usize,
    pub conflict_policy: ConflictPolicy,
}

impl Default for TxnManagerConfig {
    fn default() -> Self {
        Self {
            gc_trigger_threshold: 50,
            cleanup_batch_size: 64,
            conflict_policy: ConflictPolicy::RowLevel,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnManagerStats {
    pub active: usize,
    pub pending_cleanup: usize,
    pub committed: u64,
    pub aborted: u64,
    pub conflicts: u64,
    pub reclaimed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    committed: AtomicU64,
    aborted: AtomicU64,
    conflicts: AtomicU64,
    reclaimed: AtomicU64,
}

/// A manager for managing transactions.
pub struct MemTxnManager {
    /// Weak reference to the database to avoid circular references
    database: Weak<Database>,
    clock: Arc<TransactionClock>,
    config: TxnManagerConfig,
    /// Active transactions keyed by txn id.
    active_txns: SkipMap<Timestamp, Arc<MemTransaction>>,
    /// Committed transactions whose undo buffers await cleanup, keyed by commit ts.
    committed_txns: SkipMap<Timestamp, Arc<MemTransaction>>,
    latest_commit_ts: AtomicU64,
    /// The watermark is the minimum start timestamp of the active transactions.
    /// If there is no active transaction, it is the next unassigned timestamp.
    watermark: AtomicU64,
    cleanup_lock: Mutex<()>,
    counters: Counters,
}

impl TxnManager for MemTxnManager {
    type Error = StorageError;
    type Transaction = MemTransaction;

    fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
    ) -> Result<Arc<Self::Transaction>, Self::Error> {
        self.begin_transaction_at(None, isolation_level)
    }

    fn finish_transaction(&self, txn: &Self::Transaction) -> Result<(), Self::Error> {
        let Some(entry) = self.active_txns.remove(&txn.txn_id()) else {
            return Err(StorageError::Transaction(
                TransactionError::TransactionNotFound(txn.txn_id().to_string()),
            ));
        };

        match (txn.state(), txn.commit_ts()) {
            (TransactionState::Committed, Some(commit_ts)) => {
                self.committed_txns.insert(commit_ts, entry.value().clone());
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.lowest_active_start();

        if self.committed_txns.len() >= self.config.gc_trigger_threshold {
            self.garbage_collect()?;
        }
        Ok(())
    }

    /// Reclaim up to `cleanup_batch_size` committed transactions whose commit
    /// timestamp is below the watermark. Returns without work if another
    /// thread is already cleaning up.
    fn garbage_collect(&self) -> Result<usize, Self::Error> {
        let Some(_cleanup) = self.cleanup_lock.try_lock() else {
            return Ok(0);
        };
        let watermark = self.lowest_active_start();

        let mut reclaimed = 0;
        while reclaimed < self.config.cleanup_batch_size {
            let Some(entry) = self.committed_txns.front() else {
                break;
            };
            if *entry.key() >= watermark {
                break;
            }
            CleanupState::new(entry.value()).run();
            entry.remove();
            reclaimed += 1;
        }

        if reclaimed > 0 {
            self.counters
                .reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            tracing::debug!(reclaimed, %watermark, "cleaned up committed transactions");
        }
        Ok(reclaimed)
    }

    fn low_watermark(&self) -> Timestamp {
        Timestamp::with_ts(self.watermark.load(Ordering::Acquire))
    }
}

impl MemTxnManager {
    pub(crate) fn new(
        database: Weak<Database>,
        clock: Arc<TransactionClock>,
        config: TxnManagerConfig,
    ) -> Self {
        Self {
            database,
            clock,
            config,
            active_txns: SkipMap::new(),
            committed_txns: SkipMap::new(),
            latest_commit_ts: AtomicU64::new(0),
            watermark: AtomicU64::new(0),
            cleanup_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &TxnManagerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }

    /// Begin a transaction. With `ids` the transaction joins a meta-transaction
    /// whose id and start timestamp were already drawn, and it commits or
    /// rolls back only through that meta-transaction.
    pub fn begin_transaction_at(
        &self,
        ids: Option<(Timestamp, Timestamp)>,
        isolation_level: IsolationLevel,
    ) -> StorageResult<Arc<MemTransaction>> {
        let database = self
            .database
            .upgrade()
            .ok_or_else(|| StorageError::invalid_state("database is closed"))?;

        let txn = match ids {
            Some((txn_id, start_ts)) => {
                let txn = Arc::new(MemTransaction::new(
                    database,
                    txn_id,
                    start_ts,
                    isolation_level,
                    true,
                ));
                self.active_txns.insert(txn_id, txn.clone());
                txn
            }
            None => {
                let _commit = self.clock.lock_commits();
                let (txn_id, start_ts) = self.clock.draw_ids()?;
                let txn = Arc::new(MemTransaction::new(
                    database,
                    txn_id,
                    start_ts,
                    isolation_level,
                    false,
                ));
                self.active_txns.insert(txn_id, txn.clone());
                txn
            }
        };

        tracing::debug!(txn_id = %txn.txn_id(), start_ts = %txn.start_ts(), "begin transaction");
        Ok(txn)
    }

    pub fn commit(&self, txn: &MemTransaction) -> StorageResult<Timestamp> {
        self.check_owner(txn)?;
        commit_participants(&self.clock, &[txn])
    }

    pub fn rollback(&self, txn: &MemTransaction) -> StorageResult<()> {
        self.check_owner(txn)?;
        abort_transaction(txn)
    }

    fn check_owner(&self, txn: &MemTransaction) -> StorageResult<()> {
        if txn.is_meta_owned() {
            return Err(StorageError::invalid_state(format!(
                "transaction {} is part of a meta transaction",
                txn.txn_id()
            )));
        }
        if self.active_txns.contains_key(&txn.txn_id()) {
            return Ok(());
        }
        Err(StorageError::invalid_state(format!(
            "transaction {} is not active in this database",
            txn.txn_id()
        )))
    }

    pub(crate) fn record_commit(&self, commit_ts: Timestamp) {
        self.latest_commit_ts
            .fetch_max(commit_ts.raw(), Ordering::AcqRel);
    }

    pub(crate) fn record_conflict(&self) {
        self.counters.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn latest_commit_ts(&self) -> Timestamp {
        Timestamp::with_ts(self.latest_commit_ts.load(Ordering::Acquire))
    }

    /// Minimum start timestamp over active and pinned transactions, or the next
    /// unassigned timestamp if there are none. Computed under the commit lock so
    /// a concurrent begin cannot slip below it, and never lower than any value
    /// returned before.
    pub fn lowest_active_start(&self) -> Timestamp {
        let computed = {
            let _commit = self.clock.lock_commits();
            self.compute_watermark()
        };
        let previous = self
            .watermark
            .fetch_max(computed.raw(), Ordering::AcqRel);
        Timestamp::with_ts(previous.max(computed.raw()))
    }

    fn compute_watermark(&self) -> Timestamp {
        let active_min = self
            .active_txns
            .iter()
            .map(|entry| entry.value().start_ts())
            .min();
        [active_min, self.clock.lowest_pinned()]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or_else(|| self.clock.oracle().current_ts())
    }

    /// Reclaim every committed transaction below the watermark.
    pub fn run_cleanup(&self) -> StorageResult<usize> {
        let mut total = 0;
        loop {
            let reclaimed = self.garbage_collect()?;
            total += reclaimed;
            if reclaimed < self.config.cleanup_batch_size {
                return Ok(total);
            }
        }
    }

    /// Block new commits until the returned guard is dropped.
    pub fn quiesce_commits(&self) -> StorageResult<CommitQuiesceGuard<'_>> {
        let database = self
            .database
            .upgrade()
            .ok_or_else(|| StorageError::invalid_state("database is closed"))?;
        Ok(CommitQuiesceGuard::new(
            self.clock.lock_commits(),
            database,
            self.latest_commit_ts(),
        ))
    }

    pub fn active_count(&self) -> usize {
        self.active_txns.len()
    }

    pub fn pending_cleanup(&self) -> usize {
        self.committed_txns.len()
    }

    pub fn stats(&self) -> TxnManagerStats {
        TxnManagerStats {
            active: self.active_txns.len(),
            pending_cleanup: self.committed_txns.len(),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            conflicts: self.counters.conflicts.load(Ordering::Relaxed),
            reclaimed: self.counters.reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for MemTxnManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTxnManager")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .field("watermark", &self.low_watermark())
            .finish()
    }
}
