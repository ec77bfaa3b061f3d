//! Timestamps, transaction ids, and the oracle that hands both out.
//!
//! Both live in one `u64` space split by the top bit: commit timestamps below
//! `1 << 63`, transaction ids from `1 << 63` up. A version stamped with its
//! writer's id therefore compares greater than every snapshot and stays hidden
//! until the writer commits and restamps it.
//!
//! The counters sit in an explicit [`TimestampOracle`] created when a database
//! instance opens and shared by every attached database, rather than in
//! process-wide statics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// A commit timestamp or a transaction id, told apart by the highest bit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// First value of the transaction id range.
    pub const TXN_ID_START: u64 = 1 << 63;

    pub fn with_ts(raw: u64) -> Self {
        Self(raw)
    }

    /// Largest value still in the commit timestamp range.
    pub fn max_commit_ts() -> Self {
        Self(Self::TXN_ID_START - 1)
    }

    pub fn is_txn_id(&self) -> bool {
        self.0 >= Self::TXN_ID_START
    }

    pub fn is_commit_ts(&self) -> bool {
        self.0 < Self::TXN_ID_START
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_txn_id() {
            write!(f, "txn#{}", self.0 - Self::TXN_ID_START)
        } else {
            write!(f, "ts#{}", self.0)
        }
    }
}

/// Which half of the [`Timestamp`] space a [`Counter`] draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    CommitTs,
    TxnId,
}

impl Domain {
    /// First value handed out by a fresh counter.
    fn seed(self) -> u64 {
        match self {
            Domain::CommitTs => 1,
            Domain::TxnId => Timestamp::TXN_ID_START + 1,
        }
    }

    /// Values at or past this bound are never handed out.
    fn limit(self) -> u64 {
        match self {
            Domain::CommitTs => Timestamp::max_commit_ts().raw(),
            Domain::TxnId => u64::MAX,
        }
    }

    fn contains(self, ts: Timestamp) -> bool {
        match self {
            Domain::CommitTs => ts.is_commit_ts(),
            Domain::TxnId => ts.is_txn_id(),
        }
    }

    fn overflow(self, at: u64) -> TimestampError {
        match self {
            Domain::CommitTs => TimestampError::CommitTsOverflow(at),
            Domain::TxnId => TimestampError::TxnIdOverflow(at),
        }
    }

    fn wrong_domain(self, got: u64) -> TimestampError {
        match self {
            Domain::CommitTs => TimestampError::WrongDomainCommit(got),
            Domain::TxnId => TimestampError::WrongDomainTxnId(got),
        }
    }
}

/// Monotonic counter over one [`Domain`].
#[derive(Debug)]
pub struct Counter {
    domain: Domain,
    next: AtomicU64,
}

impl Counter {
    pub fn new(domain: Domain) -> Self {
        Self::starting_at(domain, domain.seed())
    }

    /// A counter whose first value is `start`, or the domain seed if `start`
    /// lies below it.
    pub fn starting_at(domain: Domain, start: u64) -> Self {
        Self {
            domain,
            next: AtomicU64::new(start.max(domain.seed())),
        }
    }

    pub fn next(&self) -> Result<Timestamp, TimestampError> {
        let limit = self.domain.limit();
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                (cur < limit).then_some(cur + 1)
            })
            .map(Timestamp::with_ts)
            .map_err(|cur| self.domain.overflow(cur))
    }

    /// The value the next call to [`Counter::next`] returns.
    pub fn peek(&self) -> Timestamp {
        Timestamp::with_ts(self.next.load(Ordering::SeqCst))
    }

    /// Move past `seen` so it is never handed out again.
    pub fn advance_past(&self, seen: Timestamp) -> Result<(), TimestampError> {
        if !self.domain.contains(seen) {
            return Err(self.domain.wrong_domain(seen.raw()));
        }
        if seen.raw() >= self.domain.limit() {
            return Err(self.domain.overflow(seen.raw()));
        }
        self.next.fetch_max(seen.raw() + 1, Ordering::SeqCst);
        Ok(())
    }
}

/// The pair of counters every transaction manager of an instance draws from.
///
/// Counters start fresh on open; recovery moves them past every persisted id
/// and timestamp with [`TimestampOracle::observe_txn_id`] and
/// [`TimestampOracle::observe_commit_ts`].
#[derive(Debug)]
pub struct TimestampOracle {
    timestamps: Counter,
    txn_ids: Counter,
}

impl Default for TimestampOracle {
    fn default() -> Self {
        Self {
            timestamps: Counter::new(Domain::CommitTs),
            txn_ids: Counter::new(Domain::TxnId),
        }
    }
}

impl TimestampOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from previously persisted next values.
    pub fn resume(next_ts: u64, next_txn_id: u64) -> Self {
        Self {
            timestamps: Counter::starting_at(Domain::CommitTs, next_ts),
            txn_ids: Counter::starting_at(Domain::TxnId, next_txn_id),
        }
    }

    pub fn next_txn_id(&self) -> Result<Timestamp, TimestampError> {
        self.txn_ids.next()
    }

    pub fn next_ts(&self) -> Result<Timestamp, TimestampError> {
        self.timestamps.next()
    }

    pub fn current_ts(&self) -> Timestamp {
        self.timestamps.peek()
    }

    pub fn current_txn_id(&self) -> Timestamp {
        self.txn_ids.peek()
    }

    pub fn observe_commit_ts(&self, ts: Timestamp) -> Result<(), TimestampError> {
        self.timestamps.advance_past(ts)
    }

    pub fn observe_txn_id(&self, txn_id: Timestamp) -> Result<(), TimestampError> {
        self.txn_ids.advance_past(txn_id)
    }
}
