//! Row storage with in-place current versions and undo-linked history.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ember_transaction::{Timestamp, UndoLink, UndoPtr};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{Row, RowId, Snapshot, TableId};
use crate::mvcc::undo::UndoEntry;

/// The newest version of a row.
#[derive(Debug)]
pub struct RowVersion {
    pub data: Row,
    /// Commit timestamp, or the writer's transaction id while uncommitted.
    pub commit_ts: Timestamp,
    /// Newest undo entry holding the version this one replaced.
    pub undo: Option<UndoLink<UndoEntry>>,
}

#[derive(Debug)]
pub struct VersionedRow {
    current: RwLock<RowVersion>,
}

impl VersionedRow {
    pub fn new(data: Row, commit_ts: Timestamp) -> Self {
        Self {
            current: RwLock::new(RowVersion {
                data,
                commit_ts,
                undo: None,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RowVersion> {
        self.current.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RowVersion> {
        self.current.write()
    }

    /// The version of this row `snapshot` sees, including deleted versions.
    ///
    /// A link that no longer resolves while the current version changed means
    /// its owner rolled back or was reclaimed meanwhile, and the walk restarts.
    pub fn visible_version(&self, snapshot: Snapshot) -> Option<Row> {
        'restart: loop {
            let (head, mut link) = {
                let current = self.current.read();
                if snapshot.sees(current.commit_ts) {
                    return Some(current.data.clone());
                }
                (Self::head_of(&current), current.undo.clone())
            };

            while let Some(current_link) = link {
                let step = current_link.read(|entry| match entry {
                    UndoEntry::Row(undo) => {
                        if snapshot.sees(undo.timestamp) {
                            Ok(undo.before.clone())
                        } else {
                            Err(undo.next.clone())
                        }
                    }
                    _ => Err(None),
                });
                match step {
                    Some(Ok(before)) => return before,
                    Some(Err(next)) => link = next,
                    None if self.head_changed(head) => continue 'restart,
                    None => return None,
                }
            }
            return None;
        }
    }

    /// The live (not deleted) version of this row `snapshot` sees.
    pub fn visible(&self, snapshot: Snapshot) -> Option<Row> {
        self.visible_version(snapshot)
            .filter(|row| !row.is_tombstone)
    }

    /// Call `f` on the current version and every version reachable through the
    /// undo chain, newest first.
    pub fn for_each_version(&self, mut f: impl FnMut(&Row)) {
        self.any_version(|row| {
            f(row);
            false
        });
    }

    /// Whether the current version or any version still reachable through the
    /// undo chain satisfies `pred`.
    pub fn any_version(&self, mut pred: impl FnMut(&Row) -> bool) -> bool {
        'restart: loop {
            let (head, mut link) = {
                let current = self.current.read();
                if pred(&current.data) {
                    return true;
                }
                (Self::head_of(&current), current.undo.clone())
            };
            while let Some(current_link) = link {
                let step = current_link.read(|entry| match entry {
                    UndoEntry::Row(undo) => (undo.before.clone(), undo.next.clone()),
                    _ => (None, None),
                });
                match step {
                    Some((before, next)) => {
                        if before.as_ref().is_some_and(&mut pred) {
                            return true;
                        }
                        link = next;
                    }
                    None if self.head_changed(head) => continue 'restart,
                    None => return false,
                }
            }
            return false;
        }
    }

    /// [`VersionedRow::any_version`] for a caller holding the row's lock. The
    /// head cannot move, so a link that no longer resolves ends the chain.
    pub fn version_chain_any(version: &RowVersion, mut pred: impl FnMut(&Row) -> bool) -> bool {
        if pred(&version.data) {
            return true;
        }
        let mut link = version.undo.clone();
        while let Some(current_link) = link {
            let step = current_link.read(|entry| match entry {
                UndoEntry::Row(undo) => (undo.before.clone(), undo.next.clone()),
                _ => (None, None),
            });
            let Some((before, next)) = step else {
                return false;
            };
            if before.as_ref().is_some_and(&mut pred) {
                return true;
            }
            link = next;
        }
        false
    }

    fn head_of(version: &RowVersion) -> (Timestamp, Option<UndoPtr>) {
        (version.commit_ts, version.undo.as_ref().map(UndoLink::ptr))
    }

    fn head_changed(&self, head: (Timestamp, Option<UndoPtr>)) -> bool {
        Self::head_of(&self.current.read()) != head
    }
}

#[derive(Debug)]
pub struct DataTable {
    id: TableId,
    arity: usize,
    next_row_id: AtomicU64,
    rows: DashMap<RowId, Arc<VersionedRow>>,
}

impl DataTable {
    pub fn new(id: TableId, arity: usize) -> Self {
        Self {
            id,
            arity,
            next_row_id: AtomicU64::new(1),
            rows: DashMap::new(),
        }
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn next_row_id(&self) -> RowId {
        self.next_row_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure row ids handed out later are greater than `row`.
    pub fn observe_row_id(&self, row: RowId) {
        self.next_row_id.fetch_max(row + 1, Ordering::SeqCst);
    }

    pub fn get(&self, row: RowId) -> Option<Arc<VersionedRow>> {
        self.rows.get(&row).map(|r| r.value().clone())
    }

    pub fn insert(&self, row: RowId, version: VersionedRow) -> Arc<VersionedRow> {
        let version = Arc::new(version);
        self.rows.insert(row, version.clone());
        version
    }

    pub fn remove(&self, row: RowId) -> Option<Arc<VersionedRow>> {
        self.rows.remove(&row).map(|(_, v)| v)
    }

    /// Every stored row ordered by id.
    pub fn rows(&self) -> Vec<(RowId, Arc<VersionedRow>)> {
        let mut rows: Vec<_> = self
            .rows
            .iter()
            .map(|r| (*r.key(), r.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
