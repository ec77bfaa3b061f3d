use crossbeam_skiplist::SkipSet;

use crate::common::{IndexId, RowId, TableId, Value};

/// Ordered single-column index.
///
/// Entries are not versioned: a key stays in the set while any version of the
/// row might still carry it, and readers recheck every candidate against the
/// row version their snapshot sees.
#[derive(Debug)]
pub struct MemoryIndex {
    id: IndexId,
    table: TableId,
    column: usize,
    entries: SkipSet<(Value, RowId)>,
}

impl MemoryIndex {
    pub fn new(id: IndexId, table: TableId, column: usize) -> Self {
        Self {
            id,
            table,
            column,
            entries: SkipSet::new(),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn table(&self) -> TableId {
        self.table
    }

    pub fn column(&self) -> usize {
        self.column
    }

    /// Returns `true` if the entry was not present before.
    pub fn insert(&self, key: Value, row: RowId) -> bool {
        if self.entries.contains(&(key.clone(), row)) {
            return false;
        }
        self.entries.insert((key, row));
        true
    }

    pub fn remove(&self, key: &Value, row: RowId) -> bool {
        self.entries.remove(&(key.clone(), row)).is_some()
    }

    pub fn contains(&self, key: &Value, row: RowId) -> bool {
        self.entries.contains(&(key.clone(), row))
    }

    /// Candidate rows stored under `key`.
    pub fn lookup(&self, key: &Value) -> Vec<RowId> {
        let lower = (key.clone(), RowId::MIN);
        let upper = (key.clone(), RowId::MAX);
        self.entries
            .range(lower..=upper)
            .map(|entry| entry.value().1)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
