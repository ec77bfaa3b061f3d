//! Multi-version storage for the ember database system.
//!
//! Rows live in per-table maps holding their newest version in place; older
//! versions are reached through undo entries owned by the transaction that
//! replaced them. Transactions read a snapshot fixed at begin, write in place
//! when they may take over a row and defer the write to commit otherwise, and
//! commit under one instance-wide lock that orders commit timestamps. Committed
//! changes are logged as redo deltas and replayed when a database is reopened.

pub mod catalog;
pub mod common;
pub mod database;
pub mod error;
pub mod index;
pub mod instance;
pub mod mvcc;
pub mod table;

pub use common::{Row, RowId, RowKey, Snapshot, TableId, Value};
pub use database::{Database, DatabaseConfig};
pub use error::{ErrorKind, StorageError, StorageResult};
pub use instance::DatabaseInstance;
pub use mvcc::{MemTransaction, MemTxnManager, MetaTransaction, TransactionContext};
