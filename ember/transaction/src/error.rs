use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("expected commit-ts, but got txn-id ({0})")]
    WrongDomainCommit(u64),

    #[error("expected txn-id, but got commit-ts ({0})")]
    WrongDomainTxnId(u64),

    #[error("commit-ts overflow, reached {0}")]
    CommitTsOverflow(u64),

    #[error("txn-id overflow, reached {0}")]
    TxnIdOverflow(u64),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UndoError {
    #[error("undo memory exhausted: {live} live chunks, limit {limit}")]
    ResourceExhausted { live: usize, limit: usize },

    #[error("undo pointer {0:?} does not address a live entry")]
    InvalidPointer(crate::undo::UndoPtr),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal transaction state transition {from:?} -> {to:?}")]
pub struct StateTransitionError {
    pub from: crate::transaction::TransactionState,
    pub to: crate::transaction::TransactionState,
}
