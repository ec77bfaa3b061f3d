use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ember_storage::common::wal::{LogSink, MemoryLogSink};
use ember_storage::error::WalError;
use ember_storage::mvcc::TransactionClock;
use ember_storage::{Database, DatabaseConfig, StorageResult, TableId, Value};
use ember_transaction::Transaction;

pub const NAME: usize = 0;
pub const AGE: usize = 1;

pub fn create_empty_database() -> Arc<Database> {
    Database::open(DatabaseConfig::default()).unwrap()
}

/// Create `people(name, age)` holding Alice (row 1, 25) and Bob (row 2, 30).
pub fn create_people(db: &Database) -> TableId {
    let txn = db.begin_transaction().unwrap();
    let table = db.create_table(&txn, "people", &["name", "age"]).unwrap();
    db.insert_row(&txn, table, vec![Value::from("Alice"), Value::from(25)])
        .unwrap();
    db.insert_row(&txn, table, vec![Value::from("Bob"), Value::from(30)])
        .unwrap();
    txn.commit().unwrap();
    table
}

pub fn create_test_database() -> (Arc<Database>, TableId) {
    let db = create_empty_database();
    let table = create_people(&db);
    (db, table)
}

#[allow(dead_code)]
pub fn age_of(db: &Database, table: TableId, row: u64) -> Option<Value> {
    let txn = db.begin_transaction().unwrap();
    let age = db
        .get_row(&txn, table, row)
        .unwrap()
        .and_then(|row| row.get(AGE).cloned());
    txn.commit().unwrap();
    age
}

/// A memory log sink whose appends fail while `failing` is set.
#[derive(Debug, Clone, Default)]
pub struct FlakySink {
    inner: MemoryLogSink,
    failing: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl FlakySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn open_database(&self) -> Arc<Database> {
        Database::open_with_sink(
            Arc::new(TransactionClock::new()),
            0,
            "main",
            DatabaseConfig::default(),
            Box::new(self.clone()),
        )
        .unwrap()
    }
}

impl LogSink for FlakySink {
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(WalError::Io(std::io::Error::other("disk full")).into());
        }
        self.inner.append(payload)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        self.inner.read_all()
    }

    fn rewrite(&mut self, payloads: &[Vec<u8>]) -> StorageResult<()> {
        self.inner.rewrite(payloads)
    }
}
