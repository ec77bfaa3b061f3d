use ember_transaction::{StateTransitionError, TimestampError, UndoError};
use smol_str::SmolStr;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Undo error: {0}")]
    Undo(#[from] UndoError),
    #[error("Row {0} not found")]
    RowNotFound(String),
    #[error("Table {0} not found")]
    TableNotFound(String),
    #[error("Index {0} not found")]
    IndexNotFound(String),
    #[error("Database {0} not found")]
    DatabaseNotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Write-Write conflict: {0}")]
    WriteWriteConflict(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Durability failure: {0}")]
    DurabilityFailure(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Timestamp error: {0}")]
    Timestamp(#[from] TimestampError),
}

impl From<StateTransitionError> for TransactionError {
    fn from(e: StateTransitionError) -> Self {
        TransactionError::InvalidState(e.to_string())
    }
}

impl From<StateTransitionError> for StorageError {
    fn from(e: StateTransitionError) -> Self {
        StorageError::Transaction(e.into())
    }
}

#[derive(Error, Debug)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Catalog entry {0} already exists")]
    AlreadyExists(SmolStr),
    #[error("Catalog entry {0} not found")]
    NotFound(SmolStr),
    #[error("Catalog entry {0} is not a {1}")]
    WrongKind(SmolStr, &'static str),
}

/// The outcome classes a caller of the transaction layer can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Write-write conflict. Retry the whole transaction.
    Conflict,
    /// Operation attempted in the wrong transaction phase.
    InvalidState,
    /// The log could not be written; the transaction was rolled back.
    Durability,
    /// Id space or undo memory ran out.
    ResourceExhausted,
    Other,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Transaction(e) => match e {
                TransactionError::WriteWriteConflict(_) => ErrorKind::Conflict,
                TransactionError::InvalidState(_) | TransactionError::TransactionNotFound(_) => {
                    ErrorKind::InvalidState
                }
                TransactionError::DurabilityFailure(_) => ErrorKind::Durability,
                TransactionError::ResourceExhausted(_) | TransactionError::Timestamp(_) => {
                    ErrorKind::ResourceExhausted
                }
            },
            StorageError::Wal(_) => ErrorKind::Durability,
            StorageError::Undo(UndoError::ResourceExhausted { .. }) => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        StorageError::Transaction(TransactionError::WriteWriteConflict(msg.into()))
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        StorageError::Transaction(TransactionError::InvalidState(msg.into()))
    }
}
