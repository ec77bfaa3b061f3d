//! Undo entries recorded by storage transactions.

use std::sync::Arc;

use ember_transaction::{Timestamp, UndoLink};
use smol_str::SmolStr;

use crate::catalog::CatalogEntry;
use crate::common::{IndexId, Row, RowId, RowKey, Value};

/// One reversible mutation.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    Row(RowUndo),
    Catalog(CatalogUndo),
    Index(IndexUndo),
    /// Savepoint boundary. Memory-only, never logged.
    Marker(SmolStr),
}

/// The version of a row that an in-place write replaced.
#[derive(Debug, Clone)]
pub struct RowUndo {
    pub key: RowKey,
    /// `None` when the write inserted the row.
    pub before: Option<Row>,
    /// Commit timestamp (or writer id) of `before`.
    pub timestamp: Timestamp,
    /// The row's undo chain before this write.
    pub next: Option<UndoLink<UndoEntry>>,
}

impl RowUndo {
    pub fn is_insert(&self) -> bool {
        self.before.is_none()
    }
}

/// A catalog entry this transaction put on top of its chain.
#[derive(Debug, Clone)]
pub struct CatalogUndo {
    pub entry: Arc<CatalogEntry>,
}

#[derive(Debug, Clone)]
pub struct IndexUndo {
    pub index: IndexId,
    pub row: RowId,
    /// Key this transaction added to the index; absent if it was already there.
    pub inserted: Option<Value>,
    /// Key of the replaced version, removable once no version carries it.
    pub superseded: Option<Value>,
}

impl UndoEntry {
    pub fn as_row(&self) -> Option<&RowUndo> {
        match self {
            UndoEntry::Row(undo) => Some(undo),
            _ => None,
        }
    }
}
