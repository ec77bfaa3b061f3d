use std::collections::BTreeMap;
use std::sync::Arc;

use ember_transaction::{
    AtomicTransactionState, IsolationLevel, Timestamp, Transaction, TransactionState,
};
use parking_lot::Mutex;

use super::commit_state::commit_participants;
use super::rollback_state::abort_transaction;
use super::transaction::{MemTransaction, TxnMark};
use super::txn_manager::TransactionClock;
use crate::common::DatabaseId;
use crate::database::Database;
use crate::error::{StorageError, StorageResult};

/// Per-database positions captured by [`MetaTransaction::savepoint`].
#[derive(Debug, Clone, Default)]
pub struct MetaMark {
    marks: BTreeMap<DatabaseId, TxnMark>,
}

/// A logical transaction spanning every database it touches.
///
/// The id and start timestamp are drawn once; a physical [`MemTransaction`]
/// sharing them is opened lazily the first time a database is used. The start
/// timestamp stays pinned on the shared clock until the meta-transaction ends,
/// so no database reclaims versions it may still read.
pub struct MetaTransaction {
    clock: Arc<TransactionClock>,
    txn_id: Timestamp,
    start_ts: Timestamp,
    isolation_level: IsolationLevel,
    commit_ts: Mutex<Option<Timestamp>>,
    state: AtomicTransactionState,
    transactions: Mutex<BTreeMap<DatabaseId, Arc<MemTransaction>>>,
}

impl MetaTransaction {
    pub fn begin(clock: Arc<TransactionClock>, isolation_level: IsolationLevel) -> StorageResult<Self> {
        let (txn_id, start_ts) = {
            let _commit = clock.lock_commits();
            let (txn_id, start_ts) = clock.draw_ids()?;
            clock.pin(start_ts, txn_id);
            (txn_id, start_ts)
        };
        tracing::debug!(%txn_id, %start_ts, "begin meta transaction");
        Ok(Self {
            clock,
            txn_id,
            start_ts,
            isolation_level,
            commit_ts: Mutex::new(None),
            state: AtomicTransactionState::new(),
            transactions: Mutex::new(BTreeMap::new()),
        })
    }

    /// The physical transaction for `database`, opened on first use.
    pub fn get_transaction(&self, database: &Arc<Database>) -> StorageResult<Arc<MemTransaction>> {
        if self.state.load() != TransactionState::Active {
            return Err(StorageError::invalid_state(format!(
                "meta transaction {} is {:?}",
                self.txn_id,
                self.state.load()
            )));
        }
        if !Arc::ptr_eq(database.clock(), &self.clock) {
            return Err(StorageError::InvalidArgument(format!(
                "database {} is not attached to this instance",
                database.name()
            )));
        }

        let mut transactions = self.transactions.lock();
        if let Some(txn) = transactions.get(&database.id()) {
            return Ok(txn.clone());
        }
        let txn = database
            .txn_manager()
            .begin_transaction_at(Some((self.txn_id, self.start_ts)), self.isolation_level)?;
        transactions.insert(database.id(), txn.clone());
        Ok(txn)
    }

    /// Databases touched so far.
    pub fn participants(&self) -> Vec<DatabaseId> {
        self.transactions.lock().keys().copied().collect()
    }

    /// Record a named savepoint in every database touched so far.
    pub fn savepoint(&self, name: &str) -> StorageResult<MetaMark> {
        let transactions = self.transactions.lock();
        let mut marks = BTreeMap::new();
        for (id, txn) in transactions.iter() {
            marks.insert(*id, txn.savepoint(name)?);
        }
        Ok(MetaMark { marks })
    }

    /// Undo everything done after `mark` in every database. Databases first
    /// touched after the mark are rolled back to their beginning.
    pub fn rollback_to(&self, mark: &MetaMark) -> StorageResult<()> {
        let transactions: Vec<_> = self
            .transactions
            .lock()
            .iter()
            .map(|(id, txn)| (*id, txn.clone()))
            .collect();
        for (id, txn) in transactions {
            let position = mark.marks.get(&id).copied().unwrap_or_default();
            txn.rollback_to(position)?;
        }
        Ok(())
    }

    fn finish(&self, to: TransactionState) -> StorageResult<()> {
        self.state.transition(to)?;
        Ok(())
    }

    fn snapshot_participants(&self) -> Vec<Arc<MemTransaction>> {
        self.transactions.lock().values().cloned().collect()
    }
}

impl Transaction for MetaTransaction {
    type Error = StorageError;

    fn txn_id(&self) -> Timestamp {
        self.txn_id
    }

    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn commit_ts(&self) -> Option<Timestamp> {
        *self.commit_ts.lock()
    }

    fn isolation_level(&self) -> &IsolationLevel {
        &self.isolation_level
    }

    fn state(&self) -> TransactionState {
        self.state.load()
    }

    /// Commit every participant at one timestamp.
    ///
    /// A meta-transaction that touched no database is a read-only commit: it
    /// draws no commit timestamp and returns its start timestamp, which is not
    /// ordered against the commit timestamps of writing transactions.
    fn commit(&self) -> Result<Timestamp, Self::Error> {
        self.finish(TransactionState::Committing)?;
        let participants = self.snapshot_participants();
        let refs: Vec<&MemTransaction> = participants.iter().map(|txn| txn.as_ref()).collect();

        let result = if refs.is_empty() {
            Ok(self.start_ts)
        } else {
            commit_participants(&self.clock, &refs)
        };
        self.clock.unpin(self.start_ts, self.txn_id);

        match result {
            Ok(commit_ts) => {
                *self.commit_ts.lock() = Some(commit_ts);
                self.finish(TransactionState::Committed)?;
                Ok(commit_ts)
            }
            Err(e) => {
                for txn in &participants {
                    if txn.state() == TransactionState::Active {
                        abort_transaction(txn)?;
                    }
                }
                self.finish(TransactionState::RollingBack)?;
                self.finish(TransactionState::Aborted)?;
                Err(e)
            }
        }
    }

    fn abort(&self) -> Result<(), Self::Error> {
        self.finish(TransactionState::RollingBack)?;
        for txn in self.snapshot_participants() {
            if txn.state() == TransactionState::Active {
                abort_transaction(&txn)?;
            }
        }
        self.clock.unpin(self.start_ts, self.txn_id);
        self.finish(TransactionState::Aborted)
    }
}

impl Drop for MetaTransaction {
    fn drop(&mut self) {
        if self.state.load() == TransactionState::Active
            && let Err(e) = self.abort()
        {
            tracing::error!(txn_id = %self.txn_id, error = %e, "rollback on drop failed");
        }
    }
}

impl std::fmt::Debug for MetaTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaTransaction")
            .field("txn_id", &self.txn_id)
            .field("start_ts", &self.start_ts)
            .field("state", &self.state.load())
            .field("participants", &self.participants())
            .finish()
    }
}
