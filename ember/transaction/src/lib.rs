//! Common transaction infrastructure for the ember database system.
//!
//! This crate provides the storage-agnostic parts of multi-version concurrency
//! control: timestamp and transaction-id generation, the transaction lifecycle
//! state machine, the transaction/manager traits, and the chunked undo storage
//! that version chains point into.

pub mod error;
pub mod manager;
pub mod timestamp;
pub mod transaction;
pub mod undo;

pub use error::{StateTransitionError, TimestampError, UndoError};
// Re-export commonly used types
pub use manager::TxnManager;
pub use timestamp::{Counter, Domain, Timestamp, TimestampOracle};
pub use transaction::{AtomicTransactionState, IsolationLevel, Transaction, TransactionState};
pub use undo::{
    SharedUndoBuffer, UndoAllocator, UndoAllocatorConfig, UndoBuffer, UndoLink, UndoMark, UndoPtr,
};
