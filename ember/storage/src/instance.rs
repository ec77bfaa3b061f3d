use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ember_transaction::IsolationLevel;
use smol_str::SmolStr;

use crate::common::DatabaseId;
use crate::database::{Database, DatabaseConfig};
use crate::error::{CatalogError, StorageError, StorageResult};
use crate::mvcc::meta_transaction::MetaTransaction;
use crate::mvcc::txn_manager::TransactionClock;

/// A set of attached databases sharing one transaction clock, so a single
/// meta-transaction can read and write all of them atomically.
#[derive(Debug, Default)]
pub struct DatabaseInstance {
    clock: Arc<TransactionClock>,
    databases: DashMap<SmolStr, Arc<Database>>,
    next_database_id: AtomicU64,
}

impl DatabaseInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clock(&self) -> &Arc<TransactionClock> {
        &self.clock
    }

    /// Open a database under `name`, replaying its log against the shared clock.
    pub fn attach(&self, name: &str, config: DatabaseConfig) -> StorageResult<Arc<Database>> {
        match self.databases.entry(SmolStr::new(name)) {
            Entry::Occupied(_) => Err(CatalogError::AlreadyExists(SmolStr::new(name)).into()),
            Entry::Vacant(vacant) => {
                let id = self.next_database_id.fetch_add(1, Ordering::SeqCst);
                let database = Database::open_in(self.clock.clone(), id, name, config)?;
                vacant.insert(database.clone());
                tracing::info!(database = name, id, "attached database");
                Ok(database)
            }
        }
    }

    /// Shut down and forget the database `name`.
    pub fn detach(&self, name: &str) -> StorageResult<()> {
        let database = self
            .get(name)
            .ok_or_else(|| StorageError::DatabaseNotFound(name.to_string()))?;
        database.shutdown()?;
        self.databases.remove(name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.get(name).map(|db| db.value().clone())
    }

    pub fn database_names(&self) -> Vec<SmolStr> {
        let mut names: Vec<_> = self.databases.iter().map(|db| db.key().clone()).collect();
        names.sort();
        names
    }

    /// Begin a meta-transaction over this instance's databases.
    pub fn begin(&self) -> StorageResult<MetaTransaction> {
        MetaTransaction::begin(self.clock.clone(), IsolationLevel::Snapshot)
    }

    pub fn database_id(&self, name: &str) -> Option<DatabaseId> {
        self.get(name).map(|db| db.id())
    }
}
