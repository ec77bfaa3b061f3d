//! Reclaims the undo data of a committed transaction once no active snapshot
//! can reach it.
//!
//! Cleanup runs only for transactions whose commit timestamp is below the
//! watermark. Every snapshot still alive then sees the versions that
//! transaction wrote (or something newer), so the versions it replaced can go:
//! row chains are cut where they enter the buffer, rows it deleted are removed
//! together with their index keys, index keys it superseded are removed when no
//! version carries them any more, and catalog entries it replaced are unlinked.

use std::sync::Arc;

use ember_transaction::Transaction;

use super::transaction::MemTransaction;
use super::undo::UndoEntry;
use crate::catalog::{CatalogEntry, CatalogEntryKind};
use crate::common::{IndexId, RowId, RowKey, Value};
use crate::table::VersionedRow;

enum Task {
    Row(RowKey),
    Index { index: IndexId, row: RowId, key: Value },
    Catalog(Arc<CatalogEntry>),
}

pub(crate) struct CleanupState<'a> {
    txn: &'a MemTransaction,
}

impl<'a> CleanupState<'a> {
    pub(crate) fn new(txn: &'a MemTransaction) -> Self {
        Self { txn }
    }

    pub(crate) fn run(&self) {
        let Some(commit_ts) = self.txn.commit_ts() else {
            return;
        };
        let tasks: Vec<Task> = self
            .txn
            .undo_buffer
            .read()
            .iter()
            .filter_map(|entry| match entry {
                UndoEntry::Row(undo) => Some(Task::Row(undo.key)),
                UndoEntry::Index(undo) => undo.superseded.clone().map(|key| Task::Index {
                    index: undo.index,
                    row: undo.row,
                    key,
                }),
                UndoEntry::Catalog(undo) => Some(Task::Catalog(undo.entry.clone())),
                UndoEntry::Marker(_) => None,
            })
            .collect();

        let database = self.txn.database();
        let mut deferred_index_tasks = Vec::new();
        for task in tasks {
            match task {
                Task::Row(key) => {
                    let Some(table) = database.table(key.table) else {
                        continue;
                    };
                    let Some(row) = table.get(key.row) else {
                        continue;
                    };
                    let mut version = row.write();
                    if version
                        .undo
                        .as_ref()
                        .is_some_and(|link| link.points_into(&self.txn.undo_buffer))
                    {
                        version.undo = None;
                    }
                    if version.data.is_tombstone && version.commit_ts == commit_ts {
                        let values = version.data.values.clone();
                        drop(version);
                        table.remove(key.row);
                        for index in database.indexes_on(key.table) {
                            if let Some(value) = values.get(index.column()) {
                                index.remove(value, key.row);
                            }
                        }
                    }
                }
                Task::Index { index, row, key } => deferred_index_tasks.push((index, row, key)),
                Task::Catalog(entry) => {
                    let previous = entry.take_previous();
                    if entry.is_dropped() {
                        match previous.as_ref().map(|p| p.kind()) {
                            Some(CatalogEntryKind::Table(info)) => {
                                database.remove_table_storage(info.id)
                            }
                            Some(CatalogEntryKind::Index(info)) => {
                                database.remove_index_storage(info.id)
                            }
                            _ => {}
                        }
                        database.catalog().remove_if_head(&entry);
                    }
                }
            }
        }

        // Free the buffer before judging superseded keys, so the versions it
        // held no longer count as carrying them.
        self.txn.undo_buffer.write().release();

        for (index_id, row_id, key) in deferred_index_tasks {
            let Some(index) = database.index(index_id) else {
                continue;
            };
            let Some(row) = database.table(index.table()).and_then(|table| table.get(row_id))
            else {
                index.remove(&key, row_id);
                continue;
            };
            // Writers add index keys under the row lock; hold it until the key
            // is gone so a key re-added meanwhile is not removed.
            let version = row.write();
            let still_carried = VersionedRow::version_chain_any(&version, |data| {
                data.get(index.column()) == Some(&key)
            });
            if !still_carried {
                index.remove(&key, row_id);
            }
        }

        tracing::trace!(txn_id = %self.txn.txn_id(), %commit_ts, "reclaimed undo buffer");
    }
}
