//! Transaction trait and related functionality
//!
//! This module defines the core transaction interface, the lifecycle state
//! machine shared by every transaction implementation, and related types.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::timestamp::Timestamp;

/// Isolation level for transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Snapshot isolation - reads see a consistent snapshot
    #[default]
    Snapshot,
}

/// Lifecycle of a transaction.
///
/// ```text
/// Active -> Committing -> Committed
///    |          |
///    v          v
/// RollingBack -> Aborted
/// ```
///
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Active = 0,
    Committing = 1,
    Committed = 2,
    RollingBack = 3,
    Aborted = 4,
}

impl TransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Committing,
            2 => Self::Committed,
            3 => Self::RollingBack,
            _ => Self::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: Self) -> bool {
        use TransactionState::*;
        matches!(
            (self, to),
            (Active, Committing)
                | (Active, RollingBack)
                | (Committing, Committed)
                | (Committing, RollingBack)
                | (RollingBack, Aborted)
        )
    }
}

/// Lock-free holder of a [`TransactionState`] that only permits legal transitions.
#[derive(Debug)]
pub struct AtomicTransactionState(AtomicU8);

impl AtomicTransactionState {
    pub fn new() -> Self {
        Self(AtomicU8::new(TransactionState::Active as u8))
    }

    pub fn load(&self) -> TransactionState {
        TransactionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to`, failing if the current state has no edge to it. Concurrent
    /// callers race on a compare-exchange, so at most one of them wins.
    pub fn transition(&self, to: TransactionState) -> Result<TransactionState, StateTransitionError> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = TransactionState::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(StateTransitionError { from, to });
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for AtomicTransactionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait defining the core operations that all transactions must support.
/// This trait abstracts the fundamental transaction behavior across different
/// storage implementations.
pub trait Transaction: Send + Sync {
    /// The error type for transaction operations
    type Error;

    /// Get the transaction ID
    fn txn_id(&self) -> Timestamp;

    /// Get the start timestamp of the transaction
    fn start_ts(&self) -> Timestamp;

    /// Get the commit timestamp of the transaction
    fn commit_ts(&self) -> Option<Timestamp>;

    /// Get the isolation level of the transaction
    fn isolation_level(&self) -> &IsolationLevel;

    /// Current lifecycle state
    fn state(&self) -> TransactionState;

    /// Commit the transaction, returning the commit timestamp on success
    fn commit(&self) -> Result<Timestamp, Self::Error>;

    /// Abort the transaction and rollback all changes
    fn abort(&self) -> Result<(), Self::Error>;
}
