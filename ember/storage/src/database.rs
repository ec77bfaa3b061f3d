use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ember_transaction::{
    IsolationLevel, Timestamp, Transaction, TxnManager, UndoAllocator, UndoAllocatorConfig,
};
use smol_str::SmolStr;

use crate::catalog::{Catalog, CatalogEntryKind, IndexInfo, TableInfo};
use crate::common::wal::LogSink;
use crate::common::wal::redo::{Operation, WalDelta, WalManager, WalManagerConfig};
use crate::common::{DatabaseId, IndexId, Row, RowId, RowKey, Snapshot, TableId, Value};
use crate::error::{CatalogError, StorageError, StorageResult, TransactionError};
use crate::index::MemoryIndex;
use crate::mvcc::transaction::MemTransaction;
use crate::mvcc::txn_manager::{MemTxnManager, TransactionClock, TxnManagerConfig};
use crate::mvcc::undo::{CatalogUndo, RowUndo, UndoEntry};
use crate::table::{DataTable, VersionedRow};

#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub wal: WalManagerConfig,
    pub txn: TxnManagerConfig,
    pub undo: UndoAllocatorConfig,
}

/// One database: catalog, row storage, indexes, and the transaction and log
/// managers that guard them.
pub struct Database {
    id: DatabaseId,
    name: SmolStr,
    clock: Arc<TransactionClock>,
    catalog: Catalog,
    tables: DashMap<TableId, Arc<DataTable>>,
    indexes: DashMap<IndexId, Arc<MemoryIndex>>,
    next_object_id: AtomicU64,
    txn_manager: MemTxnManager,
    wal_manager: WalManager,
    undo_allocator: Arc<UndoAllocator<UndoEntry>>,
}

impl Database {
    /// Open a standalone database with its own clock, replaying its log.
    pub fn open(config: DatabaseConfig) -> StorageResult<Arc<Self>> {
        Self::open_in(Arc::new(TransactionClock::new()), 0, "main", config)
    }

    /// Open a database that shares `clock` with the other databases of an
    /// instance.
    pub fn open_in(
        clock: Arc<TransactionClock>,
        id: DatabaseId,
        name: &str,
        config: DatabaseConfig,
    ) -> StorageResult<Arc<Self>> {
        let wal_manager = WalManager::new(config.wal.clone())?;
        Self::open_with_wal(clock, id, name, config, wal_manager)
    }

    /// Open a database logging into `sink`.
    pub fn open_with_sink(
        clock: Arc<TransactionClock>,
        id: DatabaseId,
        name: &str,
        config: DatabaseConfig,
        sink: Box<dyn LogSink>,
    ) -> StorageResult<Arc<Self>> {
        Self::open_with_wal(clock, id, name, config, WalManager::with_sink(sink))
    }

    fn open_with_wal(
        clock: Arc<TransactionClock>,
        id: DatabaseId,
        name: &str,
        config: DatabaseConfig,
        wal_manager: WalManager,
    ) -> StorageResult<Arc<Self>> {
        let database = Arc::new_cyclic(|weak| Self {
            id,
            name: SmolStr::new(name),
            clock: clock.clone(),
            catalog: Catalog::new(),
            tables: DashMap::new(),
            indexes: DashMap::new(),
            next_object_id: AtomicU64::new(1),
            txn_manager: MemTxnManager::new(weak.clone(), clock.clone(), config.txn.clone()),
            wal_manager,
            undo_allocator: Arc::new(UndoAllocator::new(config.undo.clone())),
        });
        database.replay_wal()?;
        Ok(database)
    }

    pub fn id(&self) -> DatabaseId {
        self.id
    }

    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn txn_manager(&self) -> &MemTxnManager {
        &self.txn_manager
    }

    pub fn wal_manager(&self) -> &WalManager {
        &self.wal_manager
    }

    pub fn undo_allocator(&self) -> &Arc<UndoAllocator<UndoEntry>> {
        &self.undo_allocator
    }

    pub fn begin_transaction(&self) -> StorageResult<Arc<MemTransaction>> {
        self.txn_manager.begin_transaction(IsolationLevel::Snapshot)
    }

    pub fn table(&self, id: TableId) -> Option<Arc<DataTable>> {
        self.tables.get(&id).map(|t| t.value().clone())
    }

    pub fn index(&self, id: IndexId) -> Option<Arc<MemoryIndex>> {
        self.indexes.get(&id).map(|i| i.value().clone())
    }

    /// Every physical index over `table`, committed or not.
    pub(crate) fn indexes_on(&self, table: TableId) -> Vec<Arc<MemoryIndex>> {
        self.indexes
            .iter()
            .filter(|index| index.table() == table)
            .map(|index| index.value().clone())
            .collect()
    }

    pub(crate) fn remove_table_storage(&self, id: TableId) {
        self.tables.remove(&id);
    }

    pub(crate) fn remove_index_storage(&self, id: IndexId) {
        self.indexes.remove(&id);
    }

    fn next_object_id(&self) -> u64 {
        self.next_object_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_txn(&self, txn: &MemTransaction) -> StorageResult<()> {
        if !std::ptr::eq(txn.database().as_ref(), self) {
            return Err(StorageError::InvalidArgument(format!(
                "transaction {} belongs to database {}",
                txn.txn_id(),
                txn.database().name()
            )));
        }
        txn.ensure_active()
    }

    fn data_table(&self, id: TableId) -> StorageResult<Arc<DataTable>> {
        self.table(id)
            .ok_or_else(|| StorageError::TableNotFound(id.to_string()))
    }

    // ---- Catalog operations ----

    /// Install a catalog entry and record it in the transaction's undo buffer.
    fn install_entry(
        &self,
        txn: &MemTransaction,
        name: &str,
        kind: CatalogEntryKind,
    ) -> StorageResult<()> {
        let entry = self.catalog.install(name, kind, txn.snapshot())?;
        if let Err(e) = txn.push_undo(UndoEntry::Catalog(CatalogUndo {
            entry: entry.clone(),
        })) {
            self.catalog.detach(&entry);
            return Err(e);
        }
        Ok(())
    }

    pub fn create_table(
        &self,
        txn: &MemTransaction,
        name: &str,
        columns: &[&str],
    ) -> StorageResult<TableId> {
        self.check_txn(txn)?;
        if columns.is_empty() {
            return Err(StorageError::InvalidArgument(format!(
                "table {name} needs at least one column"
            )));
        }
        let id = self.next_object_id();
        let info = TableInfo {
            id,
            columns: columns.iter().map(|c| SmolStr::new(c)).collect(),
        };
        self.tables
            .insert(id, Arc::new(DataTable::new(id, columns.len())));
        if let Err(e) = self.install_entry(txn, name, CatalogEntryKind::Table(info)) {
            self.tables.remove(&id);
            return Err(e);
        }
        tracing::debug!(database = %self.name, table = name, id, "created table");
        Ok(id)
    }

    /// Drop a table together with every index on it.
    pub fn drop_table(&self, txn: &MemTransaction, name: &str) -> StorageResult<()> {
        let info = self.lookup_table(txn, name)?;
        let dependents: Vec<SmolStr> = self
            .catalog
            .list(txn.snapshot())
            .into_iter()
            .filter(|entry| {
                matches!(entry.kind(), CatalogEntryKind::Index(index) if index.table == info.id)
            })
            .map(|entry| entry.name().clone())
            .collect();
        for index in dependents {
            self.install_entry(txn, &index, CatalogEntryKind::Dropped)?;
        }
        self.install_entry(txn, name, CatalogEntryKind::Dropped)
    }

    pub fn create_index(
        &self,
        txn: &MemTransaction,
        name: &str,
        table_name: &str,
        column: &str,
    ) -> StorageResult<IndexId> {
        let table = self.lookup_table(txn, table_name)?;
        let column_idx = table.column_index(column).ok_or_else(|| {
            StorageError::InvalidArgument(format!("table {table_name} has no column {column}"))
        })?;
        let data = self.data_table(table.id)?;

        let id = self.next_object_id();
        let index = Arc::new(MemoryIndex::new(id, table.id, column_idx));
        self.indexes.insert(id, index.clone());
        let info = IndexInfo {
            id,
            table: table.id,
            column: column_idx,
        };
        if let Err(e) = self.install_entry(txn, name, CatalogEntryKind::Index(info)) {
            self.indexes.remove(&id);
            return Err(e);
        }

        // Writers register keys in every physical index from now on; cover
        // everything already stored, in any version.
        for (row_id, row) in data.rows() {
            row.for_each_version(|version| {
                if let Some(key) = version.get(column_idx) {
                    index.insert(key.clone(), row_id);
                }
            });
        }
        Ok(id)
    }

    pub fn drop_index(&self, txn: &MemTransaction, name: &str) -> StorageResult<()> {
        self.lookup_index(txn, name)?;
        self.install_entry(txn, name, CatalogEntryKind::Dropped)
    }

    pub fn lookup_table(&self, txn: &MemTransaction, name: &str) -> StorageResult<TableInfo> {
        self.check_txn(txn)?;
        match self.catalog.lookup(name, txn.snapshot()) {
            Some(entry) => match entry.kind() {
                CatalogEntryKind::Table(info) => Ok(info.clone()),
                _ => Err(CatalogError::WrongKind(SmolStr::new(name), "table").into()),
            },
            None => Err(StorageError::TableNotFound(name.to_string())),
        }
    }

    pub fn lookup_index(&self, txn: &MemTransaction, name: &str) -> StorageResult<IndexInfo> {
        self.check_txn(txn)?;
        match self.catalog.lookup(name, txn.snapshot()) {
            Some(entry) => match entry.kind() {
                CatalogEntryKind::Index(info) => Ok(info.clone()),
                _ => Err(CatalogError::WrongKind(SmolStr::new(name), "index").into()),
            },
            None => Err(StorageError::IndexNotFound(name.to_string())),
        }
    }

    /// Names of the tables `txn` can see.
    pub fn list_tables(&self, txn: &MemTransaction) -> StorageResult<Vec<SmolStr>> {
        self.check_txn(txn)?;
        Ok(self
            .catalog
            .list(txn.snapshot())
            .into_iter()
            .filter(|entry| matches!(entry.kind(), CatalogEntryKind::Table(_)))
            .map(|entry| entry.name().clone())
            .collect())
    }

    // ---- Row operations ----

    pub fn insert_row(
        &self,
        txn: &MemTransaction,
        table_id: TableId,
        values: Vec<Value>,
    ) -> StorageResult<RowId> {
        self.check_txn(txn)?;
        let table = self.data_table(table_id)?;
        if values.len() != table.arity() {
            return Err(StorageError::InvalidArgument(format!(
                "table {table_id} expects {} values, got {}",
                table.arity(),
                values.len()
            )));
        }

        let row_id = table.next_row_id();
        let key = RowKey::new(table_id, row_id);
        let row = Row::new(values);
        let version = VersionedRow::new(row.clone(), txn.txn_id());
        let link = txn.push_undo(UndoEntry::Row(RowUndo {
            key,
            before: None,
            timestamp: Timestamp::with_ts(0),
            next: None,
        }))?;
        version.write().undo = Some(link);
        let stored = table.insert(row_id, version);

        let _locked = stored.write();
        txn.maintain_indexes(table_id, row_id, None, &row)?;
        Ok(row_id)
    }

    /// Overwrite `columns` of a row with `values`.
    pub fn update_row(
        &self,
        txn: &MemTransaction,
        table_id: TableId,
        row_id: RowId,
        columns: &[usize],
        values: &[Value],
    ) -> StorageResult<()> {
        self.check_txn(txn)?;
        let table = self.data_table(table_id)?;
        if columns.len() != values.len() || columns.iter().any(|c| *c >= table.arity()) {
            return Err(StorageError::InvalidArgument(format!(
                "invalid update of columns {columns:?} in table {table_id}"
            )));
        }
        self.write_row(txn, &table, row_id, columns, |row| {
            row.set_values(columns, values);
            true
        })
    }

    pub fn delete_row(
        &self,
        txn: &MemTransaction,
        table_id: TableId,
        row_id: RowId,
    ) -> StorageResult<()> {
        self.check_txn(txn)?;
        let table = self.data_table(table_id)?;
        self.write_row(txn, &table, row_id, &[], |row| {
            row.is_tombstone = true;
            false
        })
    }

    /// Apply `change` to a row in place when the transaction may take over its
    /// current version, and defer it to commit otherwise. `change` returns
    /// `false` for a delete.
    fn write_row(
        &self,
        txn: &MemTransaction,
        table: &DataTable,
        row_id: RowId,
        columns: &[usize],
        change: impl FnOnce(&mut Row) -> bool,
    ) -> StorageResult<()> {
        let key = RowKey::new(table.id(), row_id);
        if txn.deferred_image(key).is_some() {
            return txn.defer_write(key, None, columns, change);
        }
        let row = table
            .get(row_id)
            .ok_or_else(|| StorageError::RowNotFound(key.to_string()))?;

        let mut version = row.write();
        if !txn.owns_or_sees(&version) {
            drop(version);
            let base = row.visible(txn.snapshot());
            return txn.defer_write(key, base, columns, change);
        }
        if version.data.is_tombstone {
            return Err(StorageError::RowNotFound(key.to_string()));
        }
        let mut new = version.data.clone();
        change(&mut new);
        let old = txn.write_in_place(key, &mut version, new.clone())?;
        if !new.is_tombstone {
            txn.maintain_indexes(table.id(), row_id, Some(&old), &new)?;
        }
        Ok(())
    }

    pub fn get_row(
        &self,
        txn: &MemTransaction,
        table_id: TableId,
        row_id: RowId,
    ) -> StorageResult<Option<Row>> {
        self.check_txn(txn)?;
        let table = self.data_table(table_id)?;
        if let Some(image) = txn.deferred_image(RowKey::new(table_id, row_id)) {
            return Ok(image);
        }
        Ok(table
            .get(row_id)
            .and_then(|row| row.visible(txn.snapshot())))
    }

    /// Every row of the table visible to `txn`, ordered by row id.
    pub fn scan(&self, txn: &MemTransaction, table_id: TableId) -> StorageResult<Vec<(RowId, Row)>> {
        self.check_txn(txn)?;
        let table = self.data_table(table_id)?;
        let snapshot = txn.snapshot();
        let mut rows: BTreeMap<RowId, Row> = table
            .rows()
            .into_iter()
            .filter_map(|(id, row)| row.visible(snapshot).map(|data| (id, data)))
            .collect();
        for write in txn.deferred_for_table(table_id) {
            match write.result {
                Some(image) => rows.insert(write.key.row, image),
                None => rows.remove(&write.key.row),
            };
        }
        Ok(rows.into_iter().collect())
    }

    /// Rows visible to `txn` whose indexed column equals `key`.
    pub fn index_lookup(
        &self,
        txn: &MemTransaction,
        index_name: &str,
        key: &Value,
    ) -> StorageResult<Vec<(RowId, Row)>> {
        let info = self.lookup_index(txn, index_name)?;
        let index = self
            .index(info.id)
            .ok_or_else(|| StorageError::IndexNotFound(index_name.to_string()))?;

        let mut candidates: Vec<RowId> = index.lookup(key);
        candidates.extend(
            txn.deferred_for_table(info.table)
                .into_iter()
                .map(|write| write.key.row),
        );
        candidates.sort_unstable();
        candidates.dedup();

        let mut rows = Vec::new();
        for row_id in candidates {
            if let Some(row) = self.get_row(txn, info.table, row_id)?
                && row.get(info.column) == Some(key)
            {
                rows.push((row_id, row));
            }
        }
        Ok(rows)
    }

    // ---- Recovery and shutdown ----

    /// Rebuild committed state from the log. Deltas of a transaction apply only
    /// once its commit marker is read, and never if an abort marker voids it.
    fn replay_wal(&self) -> StorageResult<()> {
        let records = self.wal_manager.read_all()?;
        let Some(last) = records.last() else {
            return Ok(());
        };
        self.wal_manager.set_next_lsn(last.lsn + 1);

        let aborted: HashSet<Timestamp> = records
            .iter()
            .filter(|record| matches!(record.op, Operation::AbortTransaction))
            .map(|record| record.txn_id)
            .collect();
        let oracle = self.clock.oracle();
        let mut pending: HashMap<Timestamp, Vec<WalDelta>> = HashMap::new();
        let mut committed = 0usize;

        for record in &records {
            if record.txn_id.is_txn_id() {
                oracle
                    .observe_txn_id(record.txn_id)
                    .map_err(TransactionError::Timestamp)?;
            }
            match &record.op {
                Operation::Delta(delta) => pending
                    .entry(record.txn_id)
                    .or_default()
                    .push(delta.clone()),
                Operation::CommitTransaction(commit_ts) => {
                    oracle
                        .observe_commit_ts(*commit_ts)
                        .map_err(TransactionError::Timestamp)?;
                    let deltas = pending.remove(&record.txn_id).unwrap_or_default();
                    if aborted.contains(&record.txn_id) {
                        continue;
                    }
                    for delta in deltas {
                        self.apply_delta(delta, *commit_ts)?;
                    }
                    self.txn_manager.record_commit(*commit_ts);
                    committed += 1;
                }
                Operation::AbortTransaction => {
                    pending.remove(&record.txn_id);
                }
                Operation::Shutdown {
                    next_ts,
                    next_txn_id,
                } => {
                    if *next_ts > 1 {
                        oracle
                            .observe_commit_ts(Timestamp::with_ts(next_ts - 1))
                            .map_err(TransactionError::Timestamp)?;
                    }
                    if *next_txn_id > Timestamp::TXN_ID_START + 1 {
                        oracle
                            .observe_txn_id(Timestamp::with_ts(next_txn_id - 1))
                            .map_err(TransactionError::Timestamp)?;
                    }
                }
            }
        }

        tracing::info!(
            database = %self.name,
            records = records.len(),
            committed,
            discarded = pending.len() + aborted.len(),
            "replayed write-ahead log"
        );
        Ok(())
    }

    fn apply_delta(&self, delta: WalDelta, commit_ts: Timestamp) -> StorageResult<()> {
        match delta {
            WalDelta::CreateTable { id, name, columns } => {
                self.next_object_id.fetch_max(id + 1, Ordering::SeqCst);
                self.tables
                    .insert(id, Arc::new(DataTable::new(id, columns.len())));
                self.catalog.install_committed(
                    &name,
                    CatalogEntryKind::Table(TableInfo { id, columns }),
                    commit_ts,
                );
            }
            WalDelta::CreateIndex {
                id,
                name,
                table,
                column,
            } => {
                self.next_object_id.fetch_max(id + 1, Ordering::SeqCst);
                let index = Arc::new(MemoryIndex::new(id, table, column));
                for (row_id, row) in self.data_table(table)?.rows() {
                    if let Some(key) = row.read().data.get(column) {
                        index.insert(key.clone(), row_id);
                    }
                }
                self.indexes.insert(id, index);
                self.catalog.install_committed(
                    &name,
                    CatalogEntryKind::Index(IndexInfo { id, table, column }),
                    commit_ts,
                );
            }
            WalDelta::DropEntry { name } => {
                if let Some(entry) = self.catalog.lookup(&name, Snapshot::committed()) {
                    match entry.kind() {
                        CatalogEntryKind::Table(info) => self.remove_table_storage(info.id),
                        CatalogEntryKind::Index(info) => self.remove_index_storage(info.id),
                        CatalogEntryKind::Dropped => {}
                    }
                }
                self.catalog
                    .install_committed(&name, CatalogEntryKind::Dropped, commit_ts);
            }
            WalDelta::InsertRow { table, row, values } | WalDelta::UpdateRow { table, row, values } => {
                let data = self.data_table(table)?;
                data.observe_row_id(row);
                data.insert(row, VersionedRow::new(Row::new(values), commit_ts));
            }
            WalDelta::DeleteRow { table, row } => {
                let data = self.data_table(table)?;
                if let Some(removed) = data.remove(row) {
                    let values = removed.read().data.values.clone();
                    for index in self.indexes_on(table) {
                        if let Some(key) = values.get(index.column()) {
                            index.remove(key, row);
                        }
                    }
                }
            }
            WalDelta::IndexInsert { index, key, row } => {
                if let Some(index) = self.index(index) {
                    index.insert(key, row);
                }
            }
        }
        Ok(())
    }

    /// Reclaim all undo data and log the counter values so a reopened database
    /// never reuses an id or timestamp. Fails while transactions are active.
    pub fn shutdown(&self) -> StorageResult<()> {
        if self.txn_manager.active_count() > 0 {
            return Err(StorageError::invalid_state(format!(
                "database {} has {} active transactions",
                self.name,
                self.txn_manager.active_count()
            )));
        }
        self.txn_manager.run_cleanup()?;
        let oracle = self.clock.oracle();
        self.wal_manager.append(Timestamp::with_ts(0), Operation::Shutdown {
            next_ts: oracle.current_ts().raw(),
            next_txn_id: oracle.current_txn_id().raw(),
        })?;
        self.wal_manager.flush()?;
        tracing::info!(database = %self.name, "database shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tables", &self.tables.len())
            .field("indexes", &self.indexes.len())
            .field("txn_manager", &self.txn_manager)
            .finish()
    }
}
