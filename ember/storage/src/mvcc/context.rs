use std::sync::Arc;

use ember_transaction::{IsolationLevel, Timestamp, Transaction};
use smol_str::SmolStr;

use super::meta_transaction::{MetaMark, MetaTransaction};
use super::transaction::MemTransaction;
use crate::database::Database;
use crate::error::{StorageError, StorageResult};
use crate::instance::DatabaseInstance;

/// Per-session owner of the current meta-transaction.
///
/// A context is reusable: after a commit or rollback the next
/// [`TransactionContext::begin_transaction`] starts a fresh transaction.
/// Dropping a context with an open transaction rolls it back.
pub struct TransactionContext {
    instance: Arc<DatabaseInstance>,
    current: Option<Arc<MetaTransaction>>,
    savepoints: Vec<(SmolStr, MetaMark)>,
}

impl TransactionContext {
    pub fn new(instance: Arc<DatabaseInstance>) -> Self {
        Self {
            instance,
            current: None,
            savepoints: Vec::new(),
        }
    }

    pub fn instance(&self) -> &Arc<DatabaseInstance> {
        &self.instance
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Arc<MetaTransaction>> {
        self.current.as_ref()
    }

    pub fn begin_transaction(&mut self) -> StorageResult<Arc<MetaTransaction>> {
        if self.current.is_some() {
            return Err(StorageError::invalid_state(
                "a transaction is already active in this context",
            ));
        }
        let txn = Arc::new(MetaTransaction::begin(
            self.instance.clock().clone(),
            IsolationLevel::Snapshot,
        )?);
        self.current = Some(txn.clone());
        Ok(txn)
    }

    fn active(&self) -> StorageResult<&Arc<MetaTransaction>> {
        self.current
            .as_ref()
            .ok_or_else(|| StorageError::invalid_state("no active transaction in this context"))
    }

    /// The attached database `name` together with the current transaction's
    /// physical transaction in it.
    pub fn transaction(&self, name: &str) -> StorageResult<(Arc<Database>, Arc<MemTransaction>)> {
        let meta = self.active()?;
        let database = self
            .instance
            .get(name)
            .ok_or_else(|| StorageError::DatabaseNotFound(name.to_string()))?;
        let txn = meta.get_transaction(&database)?;
        Ok((database, txn))
    }

    pub fn commit(&mut self) -> StorageResult<Timestamp> {
        let txn = self.take_active()?;
        txn.commit()
    }

    pub fn rollback(&mut self) -> StorageResult<()> {
        let txn = self.take_active()?;
        txn.abort()
    }

    fn take_active(&mut self) -> StorageResult<Arc<MetaTransaction>> {
        self.savepoints.clear();
        self.current
            .take()
            .ok_or_else(|| StorageError::invalid_state("no active transaction in this context"))
    }

    /// Run `f` inside a transaction. Without an active transaction one is begun,
    /// committed if `f` succeeds and rolled back if it fails; inside an active
    /// transaction `f` simply runs in it.
    pub fn execute<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> StorageResult<T>,
    ) -> StorageResult<T> {
        if self.current.is_some() {
            return f(self);
        }
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                if self.current.is_some() {
                    self.commit()?;
                }
                Ok(value)
            }
            Err(e) => {
                if self.current.is_some() {
                    self.rollback()?;
                }
                Err(e)
            }
        }
    }

    /// Define a savepoint. Reusing a name moves it.
    pub fn savepoint(&mut self, name: &str) -> StorageResult<()> {
        let mark = self.active()?.savepoint(name)?;
        self.savepoints.retain(|(existing, _)| existing != name);
        self.savepoints.push((SmolStr::new(name), mark));
        Ok(())
    }

    /// Undo everything done since savepoint `name`. The savepoint stays defined;
    /// savepoints defined after it are forgotten.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> StorageResult<()> {
        let position = self.find_savepoint(name)?;
        let meta = self.active()?.clone();
        meta.rollback_to(&self.savepoints[position].1)?;
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    /// Forget savepoint `name` and every savepoint defined after it, keeping
    /// their changes.
    pub fn release_savepoint(&mut self, name: &str) -> StorageResult<()> {
        let position = self.find_savepoint(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    fn find_savepoint(&self, name: &str) -> StorageResult<usize> {
        self.active()?;
        self.savepoints
            .iter()
            .rposition(|(existing, _)| existing == name)
            .ok_or_else(|| StorageError::InvalidArgument(format!("no savepoint named {name}")))
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if let Some(txn) = self.current.take()
            && let Err(e) = txn.abort()
        {
            tracing::error!(txn_id = %txn.txn_id(), error = %e, "rollback on context drop failed");
        }
    }
}
