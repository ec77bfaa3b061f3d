pub mod checkpoint;
pub mod cleanup_state;
pub mod commit_state;
pub mod context;
pub mod meta_transaction;
pub mod rollback_state;
pub mod transaction;
pub mod txn_manager;
pub mod undo;
pub mod wal_write_state;

// Re-export commonly used types for transactions
pub use checkpoint::CommitQuiesceGuard;
pub use context::TransactionContext;
pub use meta_transaction::{MetaMark, MetaTransaction};
pub use transaction::{MemTransaction, TxnMark};
pub use txn_manager::{
    ConflictPolicy, MemTxnManager, TransactionClock, TxnManagerConfig, TxnManagerStats,
};
pub use undo::UndoEntry;
