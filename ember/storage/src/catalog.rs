//! Versioned catalog of named tables and indexes.
//!
//! Every name maps to a chain of [`CatalogEntry`] values, newest first. An entry
//! is stamped with its writer's transaction id until commit and with the commit
//! timestamp afterwards, so readers resolve the entry their snapshot sees by
//! walking the chain. A drop installs a [`CatalogEntryKind::Dropped`] entry on top.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ember_transaction::Timestamp;
use parking_lot::RwLock;
use smol_str::SmolStr;

use crate::common::{IndexId, Snapshot, TableId};
use crate::error::{CatalogError, StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: TableId,
    pub columns: Vec<SmolStr>,
}

impl TableInfo {
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: IndexId,
    pub table: TableId,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEntryKind {
    Table(TableInfo),
    Index(IndexInfo),
    Dropped,
}

#[derive(Debug)]
pub struct CatalogEntry {
    name: SmolStr,
    kind: CatalogEntryKind,
    timestamp: AtomicU64,
    previous: RwLock<Option<Arc<CatalogEntry>>>,
}

impl CatalogEntry {
    fn new(name: SmolStr, kind: CatalogEntryKind, timestamp: Timestamp) -> Self {
        Self {
            name,
            kind,
            timestamp: AtomicU64::new(timestamp.raw()),
            previous: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn kind(&self) -> &CatalogEntryKind {
        &self.kind
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::with_ts(self.timestamp.load(Ordering::Acquire))
    }

    pub fn set_timestamp(&self, ts: Timestamp) {
        self.timestamp.store(ts.raw(), Ordering::Release);
    }

    pub fn previous(&self) -> Option<Arc<CatalogEntry>> {
        self.previous.read().clone()
    }

    /// Unlink every older entry and return the one directly below.
    pub fn take_previous(&self) -> Option<Arc<CatalogEntry>> {
        self.previous.write().take()
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.kind, CatalogEntryKind::Dropped)
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: DashMap<SmolStr, Arc<CatalogEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The newest entry for `name` that `snapshot` can see, skipping names whose
    /// visible entry is a drop marker.
    pub fn lookup(&self, name: &str, snapshot: Snapshot) -> Option<Arc<CatalogEntry>> {
        let head = self.entries.get(name)?.value().clone();
        Self::visible_in_chain(head, snapshot).filter(|entry| !entry.is_dropped())
    }

    fn visible_in_chain(head: Arc<CatalogEntry>, snapshot: Snapshot) -> Option<Arc<CatalogEntry>> {
        let mut current = Some(head);
        while let Some(entry) = current {
            if snapshot.sees(entry.timestamp()) {
                return Some(entry);
            }
            current = entry.previous();
        }
        None
    }

    /// Put a new entry on top of the chain for `name`.
    ///
    /// Installing [`CatalogEntryKind::Dropped`] requires a live entry visible to
    /// `snapshot`; any other kind requires that none is visible. The chain head
    /// must be committed within the snapshot or owned by the writer, otherwise
    /// the change conflicts with a concurrent one.
    pub fn install(
        &self,
        name: &str,
        kind: CatalogEntryKind,
        snapshot: Snapshot,
    ) -> StorageResult<Arc<CatalogEntry>> {
        let name = SmolStr::new(name);
        let dropping = matches!(kind, CatalogEntryKind::Dropped);
        let entry = Arc::new(CatalogEntry::new(name.clone(), kind, snapshot.txn_id));

        match self.entries.entry(name.clone()) {
            Entry::Vacant(vacant) => {
                if dropping {
                    return Err(CatalogError::NotFound(name).into());
                }
                vacant.insert(entry.clone());
            }
            Entry::Occupied(mut occupied) => {
                let head = occupied.get().clone();
                if !snapshot.sees(head.timestamp()) {
                    return Err(StorageError::conflict(format!(
                        "catalog entry {name} was changed concurrently"
                    )));
                }
                match (dropping, head.is_dropped()) {
                    (true, true) => return Err(CatalogError::NotFound(name).into()),
                    (false, false) => return Err(CatalogError::AlreadyExists(name).into()),
                    _ => {}
                }
                *entry.previous.write() = Some(head);
                occupied.insert(entry.clone());
            }
        }
        Ok(entry)
    }

    /// Undo [`Catalog::install`]: make the entry below `entry` the head again.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is not the current head. Only the uncommitted owner of
    /// the head detaches it, so anything else is a corrupted chain.
    pub fn detach(&self, entry: &Arc<CatalogEntry>) {
        match self.entries.entry(entry.name.clone()) {
            Entry::Occupied(mut occupied) => {
                assert!(
                    Arc::ptr_eq(occupied.get(), entry),
                    "catalog entry {} is not the chain head",
                    entry.name
                );
                match entry.previous() {
                    Some(previous) => {
                        occupied.insert(previous);
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(_) => panic!("catalog entry {} missing on detach", entry.name),
        }
    }

    /// Remove the chain for `entry`'s name if `entry` is still its head.
    pub fn remove_if_head(&self, entry: &Arc<CatalogEntry>) -> bool {
        self.entries
            .remove_if(&entry.name, |_, head| Arc::ptr_eq(head, entry))
            .is_some()
    }

    /// Install an already committed entry, replacing whatever chain exists.
    pub fn install_committed(&self, name: &str, kind: CatalogEntryKind, ts: Timestamp) {
        let name = SmolStr::new(name);
        if matches!(kind, CatalogEntryKind::Dropped) {
            self.entries.remove(&name);
            return;
        }
        let entry = Arc::new(CatalogEntry::new(name.clone(), kind, ts));
        self.entries.insert(name, entry);
    }

    /// Every live entry visible to `snapshot`, sorted by name.
    pub fn list(&self, snapshot: Snapshot) -> Vec<Arc<CatalogEntry>> {
        let heads: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut visible: Vec<_> = heads
            .into_iter()
            .filter_map(|head| Self::visible_in_chain(head, snapshot))
            .filter(|entry| !entry.is_dropped())
            .collect();
        visible.sort_by(|a, b| a.name.cmp(&b.name));
        visible
    }

    /// Length of the chain for `name`.
    pub fn chain_len(&self, name: &str) -> usize {
        let mut current = self.entries.get(name).map(|e| e.value().clone());
        let mut len = 0;
        while let Some(entry) = current {
            len += 1;
            current = entry.previous();
        }
        len
    }
}
