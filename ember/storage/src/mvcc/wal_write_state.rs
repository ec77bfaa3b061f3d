use std::collections::HashSet;

use ember_transaction::{Timestamp, Transaction};

use super::transaction::MemTransaction;
use super::undo::UndoEntry;
use crate::catalog::CatalogEntryKind;
use crate::common::RowKey;
use crate::common::wal::redo::{Operation, WalDelta};
use crate::error::{StorageError, StorageResult, TransactionError};

/// Turns a committing transaction's undo buffer into redo records.
///
/// Each row the transaction touched is logged once, with the image it finally
/// left, at the position of its first undo entry. A row inserted and deleted by
/// the same transaction produces nothing.
pub(super) struct WalWriteState<'a> {
    txn: &'a MemTransaction,
}

impl<'a> WalWriteState<'a> {
    pub(super) fn new(txn: &'a MemTransaction) -> Self {
        Self { txn }
    }

    pub(super) fn deltas(&self) -> Vec<WalDelta> {
        let database = self.txn.database();
        let entries: Vec<UndoEntry> = self.txn.undo_buffer.read().iter().cloned().collect();

        let mut seen: HashSet<RowKey> = HashSet::new();
        let mut deltas = Vec::new();
        for entry in &entries {
            match entry {
                UndoEntry::Row(undo) => {
                    if !seen.insert(undo.key) {
                        continue;
                    }
                    let Some(row) = database
                        .table(undo.key.table)
                        .and_then(|table| table.get(undo.key.row))
                    else {
                        continue;
                    };
                    let data = row.read().data.clone();
                    let (table, row) = (undo.key.table, undo.key.row);
                    let delta = match (undo.is_insert(), data.is_tombstone) {
                        (true, true) => continue,
                        (true, false) => WalDelta::InsertRow {
                            table,
                            row,
                            values: data.values,
                        },
                        (false, true) => WalDelta::DeleteRow { table, row },
                        (false, false) => WalDelta::UpdateRow {
                            table,
                            row,
                            values: data.values,
                        },
                    };
                    deltas.push(delta);
                }
                UndoEntry::Catalog(undo) => {
                    let name = undo.entry.name().clone();
                    deltas.push(match undo.entry.kind() {
                        CatalogEntryKind::Table(info) => WalDelta::CreateTable {
                            id: info.id,
                            name,
                            columns: info.columns.clone(),
                        },
                        CatalogEntryKind::Index(info) => WalDelta::CreateIndex {
                            id: info.id,
                            name,
                            table: info.table,
                            column: info.column,
                        },
                        CatalogEntryKind::Dropped => WalDelta::DropEntry { name },
                    });
                }
                UndoEntry::Index(undo) => {
                    if let Some(key) = &undo.inserted {
                        deltas.push(WalDelta::IndexInsert {
                            index: undo.index,
                            key: key.clone(),
                            row: undo.row,
                        });
                    }
                }
                UndoEntry::Marker(_) => {}
            }
        }
        deltas
    }

    /// Log every delta followed by the commit marker, then flush. A transaction
    /// without durable changes writes nothing.
    pub(super) fn write(&self, commit_ts: Timestamp) -> StorageResult<()> {
        let deltas = self.deltas();
        if deltas.is_empty() {
            return Ok(());
        }
        let wal = self.txn.database().wal_manager();
        let txn_id = self.txn.txn_id();
        let result = (|| {
            for delta in deltas {
                wal.append(txn_id, Operation::Delta(delta))?;
            }
            wal.append(txn_id, Operation::CommitTransaction(commit_ts))?;
            wal.flush()
        })();
        result.map_err(|e| {
            StorageError::Transaction(TransactionError::DurabilityFailure(format!(
                "{} in database {}: {e}",
                txn_id,
                self.txn.database().name()
            )))
        })
    }

    /// Mark an already logged commit as void. Used when another participant of
    /// the same meta-transaction failed to log.
    pub(super) fn write_abort(&self) {
        let wal = self.txn.database().wal_manager();
        let result = wal
            .append(self.txn.txn_id(), Operation::AbortTransaction)
            .and_then(|_| wal.flush());
        if let Err(e) = result {
            tracing::error!(
                txn_id = %self.txn.txn_id(),
                error = %e,
                "failed to log abort marker"
            );
        }
    }
}
