use ember_transaction::{Transaction, TransactionState, TxnManager};

use super::transaction::MemTransaction;
use super::undo::UndoEntry;
use crate::catalog::CatalogEntryKind;
use crate::error::StorageResult;

/// Walks undo entries newest first and reverses each one.
///
/// Only the owning, uncommitted transaction ever rolls its entries back, so
/// every entry must apply cleanly. A mismatch means the version chains are
/// corrupt and panics.
pub(crate) struct RollbackState<'a> {
    txn: &'a MemTransaction,
}

impl<'a> RollbackState<'a> {
    pub(crate) fn new(txn: &'a MemTransaction) -> Self {
        Self { txn }
    }

    /// Undo the whole transaction and return its undo memory.
    pub(crate) fn run(&self) {
        let entries: Vec<UndoEntry> = self.txn.undo_buffer.read().iter().cloned().collect();
        self.apply(entries.iter().rev());
        self.txn.undo_buffer.write().release();
        self.txn.deferred.lock().clear();
    }

    /// Reverse `entries`, which must be given newest first.
    pub(crate) fn apply<'e>(&self, entries: impl Iterator<Item = &'e UndoEntry>) {
        for entry in entries {
            match entry {
                UndoEntry::Row(undo) => self.undo_row(undo),
                UndoEntry::Index(undo) => {
                    if let (Some(key), Some(index)) =
                        (&undo.inserted, self.txn.database().index(undo.index))
                    {
                        index.remove(key, undo.row);
                    }
                }
                UndoEntry::Catalog(undo) => {
                    let database = self.txn.database();
                    database.catalog().detach(&undo.entry);
                    match undo.entry.kind() {
                        CatalogEntryKind::Table(info) => database.remove_table_storage(info.id),
                        CatalogEntryKind::Index(info) => database.remove_index_storage(info.id),
                        CatalogEntryKind::Dropped => {}
                    }
                }
                UndoEntry::Marker(_) => {}
            }
        }
    }

    fn undo_row(&self, undo: &super::undo::RowUndo) {
        let Some(table) = self.txn.database().table(undo.key.table) else {
            // The table was dropped and reclaimed underneath the writer.
            return;
        };
        let row = table
            .get(undo.key.row)
            .unwrap_or_else(|| panic!("row {} missing during rollback", undo.key));

        let mut version = row.write();
        assert_eq!(
            version.commit_ts,
            self.txn.txn_id(),
            "row {} is not owned by the rolling back transaction",
            undo.key
        );
        match &undo.before {
            None => {
                drop(version);
                table.remove(undo.key.row);
            }
            Some(before) => {
                version.data = before.clone();
                version.commit_ts = undo.timestamp;
                version.undo = undo.next.clone();
            }
        }
    }
}

/// Drive `txn` from `Active` or `Committing` through rollback to `Aborted` and
/// retire it from its manager.
pub(crate) fn abort_transaction(txn: &MemTransaction) -> StorageResult<()> {
    txn.state_machine()
        .transition(TransactionState::RollingBack)?;
    RollbackState::new(txn).run();
    txn.state_machine().transition(TransactionState::Aborted)?;
    txn.database().txn_manager().finish_transaction(txn)?;
    tracing::debug!(
        database = %txn.database().name(),
        txn_id = %txn.txn_id(),
        "rolled back transaction"
    );
    Ok(())
}
