//! Redo records and the per-database WAL manager.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use ember_transaction::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use super::log_file::FileLogSink;
use super::{LogRecord, LogSink, MemoryLogSink};
use crate::common::{IndexId, RowId, TableId, Value};
use crate::error::{StorageError, StorageResult, WalError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedoEntry {
    pub lsn: u64,          // Log sequence number
    pub txn_id: Timestamp, // Transaction ID
    pub op: Operation,     // Operation
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Delta(WalDelta),
    CommitTransaction(Timestamp), // transaction commit timestamp
    AbortTransaction,
    /// Counter values persisted at clean shutdown.
    Shutdown { next_ts: u64, next_txn_id: u64 },
}

/// One logical change, in the final state the committing transaction left it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalDelta {
    CreateTable {
        id: TableId,
        name: SmolStr,
        columns: Vec<SmolStr>,
    },
    CreateIndex {
        id: IndexId,
        name: SmolStr,
        table: TableId,
        column: usize,
    },
    DropEntry {
        name: SmolStr,
    },
    InsertRow {
        table: TableId,
        row: RowId,
        values: Vec<Value>,
    },
    UpdateRow {
        table: TableId,
        row: RowId,
        values: Vec<Value>,
    },
    DeleteRow {
        table: TableId,
        row: RowId,
    },
    IndexInsert {
        index: IndexId,
        key: Value,
        row: RowId,
    },
}

impl LogRecord for RedoEntry {
    fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| StorageError::Wal(WalError::SerializationFailed(e.to_string())))
    }

    fn from_bytes(bytes: Vec<u8>) -> StorageResult<Self> {
        postcard::from_bytes(&bytes)
            .map_err(|e| StorageError::Wal(WalError::DeserializationFailed(e.to_string())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct WalManagerConfig {
    /// Log file location. `None` keeps the log in memory.
    pub wal_path: Option<PathBuf>,
}

impl WalManagerConfig {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            wal_path: Some(path.into()),
        }
    }
}

/// Assigns log sequence numbers and serializes records into a [`LogSink`].
pub struct WalManager {
    sink: Mutex<Box<dyn LogSink>>,
    next_lsn: AtomicU64,
}

impl WalManager {
    pub fn new(config: WalManagerConfig) -> StorageResult<Self> {
        let sink: Box<dyn LogSink> = match config.wal_path {
            Some(path) => Box::new(FileLogSink::open(path)?),
            None => Box::new(MemoryLogSink::new()),
        };
        Ok(Self::with_sink(sink))
    }

    pub fn with_sink(sink: Box<dyn LogSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
            next_lsn: AtomicU64::new(0),
        }
    }

    /// The LSN the next appended record will receive.
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst)
    }

    pub fn set_next_lsn(&self, lsn: u64) {
        self.next_lsn.store(lsn, Ordering::SeqCst);
    }

    /// Append one record. The LSN is drawn while the sink is held, so LSN order
    /// matches file order.
    pub fn append(&self, txn_id: Timestamp, op: Operation) -> StorageResult<u64> {
        let mut sink = self.sink.lock();
        let lsn = self.next_lsn.load(Ordering::SeqCst);
        let bytes = RedoEntry { lsn, txn_id, op }.to_bytes()?;
        sink.append(&bytes)?;
        self.next_lsn.store(lsn + 1, Ordering::SeqCst);
        Ok(lsn)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.sink.lock().flush()
    }

    /// All records, ordered by LSN.
    pub fn read_all(&self) -> StorageResult<Vec<RedoEntry>> {
        let payloads = self.sink.lock().read_all()?;
        let mut records = payloads
            .into_iter()
            .map(RedoEntry::from_bytes)
            .collect::<StorageResult<Vec<_>>>()?;
        records.sort_by_key(|entry| entry.lsn);
        Ok(records)
    }

    /// Drop every record with `lsn < min_lsn`.
    pub fn truncate_until(&self, min_lsn: u64) -> StorageResult<usize> {
        let mut sink = self.sink.lock();
        let payloads = sink.read_all()?;
        let total = payloads.len();
        let mut retained = Vec::with_capacity(total);
        for payload in payloads {
            if RedoEntry::from_bytes(payload.clone())?.lsn >= min_lsn {
                retained.push(payload);
            }
        }
        sink.rewrite(&retained)?;
        Ok(total - retained.len())
    }
}
