use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use ember_transaction::{
    AtomicTransactionState, IsolationLevel, SharedUndoBuffer, Timestamp, Transaction,
    TransactionState, UndoBuffer, UndoLink, UndoMark,
};
use parking_lot::Mutex;
use smol_str::SmolStr;

use super::rollback_state::RollbackState;
use super::undo::{IndexUndo, RowUndo, UndoEntry};
use crate::common::{Row, RowId, RowKey, Snapshot, TableId};
use crate::database::Database;
use crate::error::{StorageError, StorageResult};
use crate::table::RowVersion;

/// A write to a row whose current version this transaction could not take over
/// in place. It is validated and installed when the transaction commits.
#[derive(Debug, Clone)]
pub(crate) struct DeferredWrite {
    pub key: RowKey,
    /// The version visible to the snapshot when the row was first written.
    pub base: Row,
    /// Columns written so far. Empty for a delete.
    pub columns: BTreeSet<usize>,
    /// Row image after every write; `None` once deleted.
    pub result: Option<Row>,
}

/// Position in a transaction's undo buffer and deferred writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnMark {
    pub(crate) undo: UndoMark,
    pub(crate) local: usize,
}

pub struct MemTransaction {
    database: Arc<Database>, // Database the transaction reads and writes

    // ---- Transaction Config ----
    isolation_level: IsolationLevel,

    // ---- Timestamp management ----
    /// Start timestamp assigned when the transaction begins
    start_ts: Timestamp,
    commit_ts: OnceLock<Timestamp>, // Commit timestamp assigned upon committing
    txn_id: Timestamp,              // Unique transaction identifier

    // ---- Transaction state tracking ----
    state: AtomicTransactionState,

    // ---- Undo logs ----
    pub(super) undo_buffer: SharedUndoBuffer<UndoEntry>,

    // ---- Deferred writes, in write order ----
    pub(super) deferred: Mutex<Vec<DeferredWrite>>,

    /// Set for participants of a meta-transaction, which only commit or roll
    /// back through it.
    meta_owned: bool,
}

impl Transaction for MemTransaction {
    type Error = StorageError;

    fn txn_id(&self) -> Timestamp {
        self.txn_id
    }

    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn commit_ts(&self) -> Option<Timestamp> {
        self.commit_ts.get().copied()
    }

    fn isolation_level(&self) -> &IsolationLevel {
        &self.isolation_level
    }

    fn state(&self) -> TransactionState {
        self.state.load()
    }

    fn commit(&self) -> Result<Timestamp, Self::Error> {
        self.database.txn_manager().commit(self)
    }

    fn abort(&self) -> Result<(), Self::Error> {
        self.database.txn_manager().rollback(self)
    }
}

impl MemTransaction {
    pub(super) fn new(
        database: Arc<Database>,
        txn_id: Timestamp,
        start_ts: Timestamp,
        isolation_level: IsolationLevel,
        meta_owned: bool,
    ) -> Self {
        let undo_buffer = UndoBuffer::new_shared(database.undo_allocator().clone());
        Self {
            database,
            isolation_level,
            start_ts,
            commit_ts: OnceLock::new(),
            txn_id,
            state: AtomicTransactionState::new(),
            undo_buffer,
            deferred: Mutex::new(Vec::new()),
            meta_owned,
        }
    }

    pub fn is_meta_owned(&self) -> bool {
        self.meta_owned
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.txn_id, self.start_ts)
    }

    pub(super) fn state_machine(&self) -> &AtomicTransactionState {
        &self.state
    }

    pub(super) fn set_commit_ts(&self, commit_ts: Timestamp) {
        let _ = self.commit_ts.set(commit_ts);
    }

    /// Number of undo entries recorded so far.
    pub fn undo_len(&self) -> usize {
        self.undo_buffer.read().len()
    }

    pub fn ensure_active(&self) -> StorageResult<()> {
        match self.state.load() {
            TransactionState::Active => Ok(()),
            state => Err(StorageError::invalid_state(format!(
                "transaction {} is {:?}",
                self.txn_id, state
            ))),
        }
    }

    /// Append an undo entry and return a link to it.
    pub(crate) fn push_undo(&self, entry: UndoEntry) -> StorageResult<UndoLink<UndoEntry>> {
        let ptr = self.undo_buffer.write().append(entry)?;
        Ok(UndoLink::new(&self.undo_buffer, ptr))
    }

    /// Whether the current version of a row may be overwritten in place.
    pub(crate) fn owns_or_sees(&self, version: &RowVersion) -> bool {
        version.commit_ts == self.txn_id
            || (version.commit_ts.is_commit_ts() && version.commit_ts <= self.start_ts)
    }

    /// Replace the current version with `data`, recording the old version in the
    /// undo buffer. The caller holds the row's write lock.
    pub(crate) fn write_in_place(
        &self,
        key: RowKey,
        version: &mut RowVersion,
        data: Row,
    ) -> StorageResult<Row> {
        let link = self.push_undo(UndoEntry::Row(RowUndo {
            key,
            before: Some(version.data.clone()),
            timestamp: version.commit_ts,
            next: version.undo.clone(),
        }))?;
        version.undo = Some(link);
        version.commit_ts = self.txn_id;
        Ok(std::mem::replace(&mut version.data, data))
    }

    /// Keep every index on `table` in step with a row changing from `old` to
    /// `new`. The caller holds the row's write lock, so cleanup never judges
    /// the row's keys halfway through.
    pub(crate) fn maintain_indexes(
        &self,
        table: TableId,
        row: RowId,
        old: Option<&Row>,
        new: &Row,
    ) -> StorageResult<()> {
        for index in self.database.indexes_on(table) {
            let Some(new_key) = new.get(index.column()).cloned() else {
                continue;
            };
            let old_key = old.and_then(|old| old.get(index.column())).cloned();
            if old_key.as_ref() == Some(&new_key) {
                continue;
            }
            let inserted = index.insert(new_key.clone(), row);
            let recorded = self.push_undo(UndoEntry::Index(IndexUndo {
                index: index.id(),
                row,
                inserted: inserted.then(|| new_key.clone()),
                superseded: old_key,
            }));
            if let Err(e) = recorded {
                // Unrecorded keys would outlive a rollback.
                if inserted {
                    index.remove(&new_key, row);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// The latest deferred image of `key`, if the row has been written through
    /// the deferred path.
    pub(crate) fn deferred_image(&self, key: RowKey) -> Option<Option<Row>> {
        self.deferred
            .lock()
            .iter()
            .rev()
            .find(|write| write.key == key)
            .map(|write| write.result.clone())
    }

    pub(crate) fn deferred_for_table(&self, table: TableId) -> Vec<DeferredWrite> {
        let deferred = self.deferred.lock();
        let mut latest: Vec<DeferredWrite> = Vec::new();
        for write in deferred.iter().filter(|w| w.key.table == table) {
            match latest.iter_mut().find(|w| w.key == write.key) {
                Some(slot) => *slot = write.clone(),
                None => latest.push(write.clone()),
            }
        }
        latest
    }

    /// Record a deferred write. `change` is applied to the latest deferred image
    /// of the row, or to `base` (the version the snapshot sees) for the first
    /// deferred write to it, and returns `false` to delete the row.
    pub(crate) fn defer_write(
        &self,
        key: RowKey,
        base: Option<Row>,
        columns: &[usize],
        change: impl FnOnce(&mut Row) -> bool,
    ) -> StorageResult<()> {
        let mut deferred = self.deferred.lock();
        let previous = deferred.iter().rev().find(|write| write.key == key);
        let (base, mut written, current) = match (previous, base) {
            (Some(write), _) => (write.base.clone(), write.columns.clone(), write.result.clone()),
            (None, Some(base)) => (base.clone(), BTreeSet::new(), Some(base)),
            (None, None) => (Row::new(Vec::new()), BTreeSet::new(), None),
        };
        let Some(mut image) = current else {
            return Err(StorageError::RowNotFound(key.to_string()));
        };
        let keep = change(&mut image);
        written.extend(columns.iter().copied());
        deferred.push(DeferredWrite {
            key,
            base,
            columns: written,
            result: keep.then_some(image),
        });
        Ok(())
    }

    /// Current position, for a later [`MemTransaction::rollback_to`].
    pub fn mark(&self) -> TxnMark {
        TxnMark {
            undo: self.undo_buffer.read().mark(),
            local: self.deferred.lock().len(),
        }
    }

    /// Append a savepoint marker and return the position just after it.
    pub fn savepoint(&self, name: &str) -> StorageResult<TxnMark> {
        self.ensure_active()?;
        self.push_undo(UndoEntry::Marker(SmolStr::new(name)))?;
        Ok(self.mark())
    }

    /// Undo everything recorded after `mark` and return the freed undo memory to
    /// the allocator. The transaction stays active.
    pub fn rollback_to(&self, mark: TxnMark) -> StorageResult<()> {
        self.ensure_active()?;
        let entries: Vec<UndoEntry> = self
            .undo_buffer
            .read()
            .iter_since(mark.undo)
            .cloned()
            .collect();
        RollbackState::new(self).apply(entries.iter().rev());
        self.undo_buffer.write().truncate(mark.undo);
        self.deferred.lock().truncate(mark.local);
        tracing::debug!(
            txn_id = %self.txn_id,
            undone = entries.len(),
            "rolled back to savepoint"
        );
        Ok(())
    }
}

impl std::fmt::Debug for MemTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransaction")
            .field("database", &self.database.name())
            .field("txn_id", &self.txn_id)
            .field("start_ts", &self.start_ts)
            .field("commit_ts", &self.commit_ts.get())
            .field("state", &self.state.load())
            .field("meta_owned", &self.meta_owned)
            .finish()
    }
}
