//! Commit protocol.
//!
//! A commit runs entirely under the instance-wide commit lock and has two
//! phases. The check phase verifies that the transaction still owns every row it
//! wrote in place and validates each deferred write against the conflict policy,
//! installing the ones that pass. Only when every participant passed does the
//! apply phase draw a commit timestamp, log the changes and stamp the versions.
//! Any failure rolls every participant back before the error is returned.

use std::collections::BTreeSet;

use ember_transaction::{Timestamp, Transaction, TransactionState, TxnManager};

use super::rollback_state::abort_transaction;
use super::transaction::{DeferredWrite, MemTransaction};
use super::txn_manager::{ConflictPolicy, TransactionClock};
use super::undo::UndoEntry;
use super::wal_write_state::WalWriteState;
use crate::common::{Row, RowKey};
use crate::error::{ErrorKind, StorageError, StorageResult, TransactionError};

/// A deferred write that passed validation, with the image to install and the
/// version it was validated against.
struct ResolvedWrite {
    key: RowKey,
    observed: Timestamp,
    data: Row,
}

pub(super) struct CommitState<'a> {
    txn: &'a MemTransaction,
}

impl<'a> CommitState<'a> {
    pub(super) fn new(txn: &'a MemTransaction) -> Self {
        Self { txn }
    }

    /// Check phase.
    pub(super) fn prepare(&self) -> StorageResult<()> {
        self.verify_ownership()?;
        let policy = self.txn.database().txn_manager().config().conflict_policy;
        let resolved = self
            .collapse_deferred()
            .into_iter()
            .map(|write| self.validate(write, policy))
            .collect::<StorageResult<Vec<_>>>()?;
        for write in resolved {
            self.install(write)?;
        }
        Ok(())
    }

    fn verify_ownership(&self) -> StorageResult<()> {
        let database = self.txn.database();
        let keys: BTreeSet<RowKey> = self
            .txn
            .undo_buffer
            .read()
            .iter()
            .filter_map(UndoEntry::as_row)
            .map(|undo| undo.key)
            .collect();
        for key in keys {
            let Some(row) = database.table(key.table).and_then(|t| t.get(key.row)) else {
                continue;
            };
            let owner = row.read().commit_ts;
            if owner != self.txn.txn_id() {
                return Err(StorageError::invalid_state(format!(
                    "row {key} written by {} is held by {owner}",
                    self.txn.txn_id()
                )));
            }
        }
        Ok(())
    }

    /// Latest deferred image per row, in order of the first write to each row.
    fn collapse_deferred(&self) -> Vec<DeferredWrite> {
        let deferred = self.txn.deferred.lock();
        let mut latest: Vec<DeferredWrite> = Vec::new();
        for write in deferred.iter() {
            match latest.iter_mut().find(|w| w.key == write.key) {
                Some(slot) => *slot = write.clone(),
                None => latest.push(write.clone()),
            }
        }
        latest
    }

    fn validate(&self, write: DeferredWrite, policy: ConflictPolicy) -> StorageResult<ResolvedWrite> {
        let conflict = |reason: &str| {
            StorageError::conflict(format!(
                "row {} written by {}: {reason}",
                write.key,
                self.txn.txn_id()
            ))
        };
        let row = self
            .txn
            .database()
            .table(write.key.table)
            .and_then(|table| table.get(write.key.row))
            .ok_or_else(|| conflict("row no longer exists"))?;
        let version = row.read();

        let data = match &write.result {
            Some(image) => image.clone(),
            None => {
                let mut tombstone = version.data.clone();
                tombstone.is_tombstone = true;
                tombstone
            }
        };

        if self.txn.owns_or_sees(&version) {
            return Ok(ResolvedWrite {
                key: write.key,
                observed: version.commit_ts,
                data,
            });
        }
        if !version.commit_ts.is_commit_ts() {
            return Err(conflict("row is held by an active transaction"));
        }
        if version.data.is_tombstone {
            return Err(conflict("row was deleted concurrently"));
        }

        match (policy, &write.result) {
            (ConflictPolicy::CellLevel, Some(image)) => {
                let touched = write.base.changed_columns(&version.data);
                if touched.iter().any(|column| write.columns.contains(column)) {
                    return Err(conflict("column changed concurrently"));
                }
                let columns: Vec<usize> = write.columns.iter().copied().collect();
                let values: Vec<_> = columns
                    .iter()
                    .filter_map(|column| image.get(*column).cloned())
                    .collect();
                let mut merged = version.data.clone();
                merged.set_values(&columns, &values);
                Ok(ResolvedWrite {
                    key: write.key,
                    observed: version.commit_ts,
                    data: merged,
                })
            }
            _ => Err(conflict("row changed after snapshot")),
        }
    }

    fn install(&self, write: ResolvedWrite) -> StorageResult<()> {
        let row = self
            .txn
            .database()
            .table(write.key.table)
            .and_then(|table| table.get(write.key.row))
            .ok_or_else(|| StorageError::conflict(format!("row {} vanished", write.key)))?;
        let mut version = row.write();
        if version.commit_ts != write.observed {
            return Err(StorageError::conflict(format!(
                "row {} changed during commit",
                write.key
            )));
        }
        let new = write.data.clone();
        let old = self.txn.write_in_place(write.key, &mut version, write.data)?;
        if !new.is_tombstone {
            self.txn
                .maintain_indexes(write.key.table, write.key.row, Some(&old), &new)?;
        }
        Ok(())
    }

    /// Apply phase: make every version written by the transaction carry
    /// `commit_ts`. Only ever runs after the WAL accepted the commit.
    pub(super) fn stamp(&self, commit_ts: Timestamp) {
        let database = self.txn.database();
        let mut rows = BTreeSet::new();
        let mut entries = Vec::new();
        for entry in self.txn.undo_buffer.read().iter() {
            match entry {
                UndoEntry::Row(undo) => {
                    rows.insert(undo.key);
                }
                UndoEntry::Catalog(undo) => entries.push(undo.entry.clone()),
                UndoEntry::Index(_) | UndoEntry::Marker(_) => {}
            }
        }

        for entry in entries {
            entry.set_timestamp(commit_ts);
        }
        for key in rows {
            let Some(row) = database.table(key.table).and_then(|t| t.get(key.row)) else {
                continue;
            };
            let mut version = row.write();
            if version.commit_ts == self.txn.txn_id() {
                version.commit_ts = commit_ts;
            }
        }
    }
}

/// Commit `participants` as one unit and return the shared commit timestamp.
///
/// Every participant is either committed or rolled back when this returns.
pub(crate) fn commit_participants(
    clock: &TransactionClock,
    participants: &[&MemTransaction],
) -> StorageResult<Timestamp> {
    for (i, txn) in participants.iter().enumerate() {
        if let Err(e) = txn.state_machine().transition(TransactionState::Committing) {
            for entered in &participants[..i] {
                force_rollback(entered);
            }
            return Err(e.into());
        }
    }

    let commit = clock.lock_commits();
    let outcome = check_then_log(clock, participants);
    let commit_ts = match outcome {
        Ok(commit_ts) => commit_ts,
        Err(e) => {
            drop(commit);
            if e.kind() == ErrorKind::Conflict {
                for txn in participants {
                    txn.database().txn_manager().record_conflict();
                }
                tracing::warn!(error = %e, "commit conflict, rolling back");
            } else {
                tracing::error!(error = %e, "commit failed, rolling back");
            }
            for txn in participants {
                force_rollback(txn);
            }
            return Err(e);
        }
    };

    for txn in participants {
        CommitState::new(txn).stamp(commit_ts);
        txn.set_commit_ts(commit_ts);
        txn.database().txn_manager().record_commit(commit_ts);
        txn.state_machine()
            .transition(TransactionState::Committed)?;
    }
    drop(commit);

    for txn in participants {
        txn.database().txn_manager().finish_transaction(txn)?;
        tracing::debug!(
            database = %txn.database().name(),
            txn_id = %txn.txn_id(),
            %commit_ts,
            "committed transaction"
        );
    }
    Ok(commit_ts)
}

fn check_then_log(
    clock: &TransactionClock,
    participants: &[&MemTransaction],
) -> StorageResult<Timestamp> {
    for txn in participants {
        CommitState::new(txn).prepare()?;
    }

    let commit_ts = clock
        .oracle()
        .next_ts()
        .map_err(TransactionError::Timestamp)?;

    for (i, txn) in participants.iter().enumerate() {
        if let Err(e) = WalWriteState::new(txn).write(commit_ts) {
            for logged in &participants[..i] {
                WalWriteState::new(logged).write_abort();
            }
            return Err(e);
        }
    }
    Ok(commit_ts)
}

fn force_rollback(txn: &MemTransaction) {
    if let Err(e) = abort_transaction(txn) {
        tracing::error!(txn_id = %txn.txn_id(), error = %e, "forced rollback failed");
    }
}
