mod common;

use common::*;
use ember_storage::mvcc::{ConflictPolicy, TxnManagerConfig};
use ember_storage::{Database, DatabaseConfig, ErrorKind, MemTransaction, StorageError, Value};
use ember_transaction::{Transaction, TransactionState};

// ========== VISIBILITY TESTS ==========

#[test]
fn test_uncommitted_write_is_invisible() {
    let (db, people) = create_test_database();

    let reader = db.begin_transaction().unwrap();
    let writer = db.begin_transaction().unwrap();
    db.update_row(&writer, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();

    // The writer sees its own change, the reader does not.
    let own = db.get_row(&writer, people, 1).unwrap().unwrap();
    assert_eq!(own.get(AGE), Some(&Value::from(26)));
    let other = db.get_row(&reader, people, 1).unwrap().unwrap();
    assert_eq!(other.get(AGE), Some(&Value::from(25)));

    writer.commit().unwrap();
    reader.commit().unwrap();
}

#[test]
fn test_snapshot_is_stable_across_commits() {
    let (db, people) = create_test_database();

    let reader = db.begin_transaction().unwrap();
    let writer = db.begin_transaction().unwrap();
    db.update_row(&writer, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    let commit_ts = writer.commit().unwrap();
    assert!(commit_ts > reader.start_ts());

    // Repeatable read: the older snapshot keeps seeing the old version.
    let alice = db.get_row(&reader, people, 1).unwrap().unwrap();
    assert_eq!(alice.get(AGE), Some(&Value::from(25)));
    reader.commit().unwrap();

    // A snapshot taken after the commit sees the new version.
    assert_eq!(age_of(&db, people, 1), Some(Value::from(26)));
}

#[test]
fn test_insert_and_delete_visibility() {
    let (db, people) = create_test_database();

    let reader = db.begin_transaction().unwrap();
    let writer = db.begin_transaction().unwrap();
    let carol = db
        .insert_row(&writer, people, vec![Value::from("Carol"), Value::from(41)])
        .unwrap();
    db.delete_row(&writer, people, 2).unwrap();
    assert_eq!(carol, 3);

    assert!(db.get_row(&writer, people, 2).unwrap().is_none());
    assert!(db.get_row(&reader, people, carol).unwrap().is_none());
    writer.commit().unwrap();

    let names = |txn: &MemTransaction| {
        db.scan(txn, people)
            .unwrap()
            .into_iter()
            .map(|(_, row)| row.get(NAME).cloned().unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&reader), vec![Value::from("Alice"), Value::from("Bob")]);
    let fresh = db.begin_transaction().unwrap();
    assert_eq!(names(&fresh), vec![Value::from("Alice"), Value::from("Carol")]);
    reader.commit().unwrap();
    fresh.commit().unwrap();
}

#[test]
fn test_deleted_row_cannot_be_written() {
    let (db, people) = create_test_database();

    let txn = db.begin_transaction().unwrap();
    db.delete_row(&txn, people, 1).unwrap();
    assert!(matches!(
        db.update_row(&txn, people, 1, &[AGE], &[Value::from(1)]),
        Err(StorageError::RowNotFound(_))
    ));
    assert!(matches!(
        db.delete_row(&txn, people, 1),
        Err(StorageError::RowNotFound(_))
    ));
    assert!(matches!(
        db.delete_row(&txn, people, 99),
        Err(StorageError::RowNotFound(_))
    ));
    txn.abort().unwrap();
}

// ========== WRITE-WRITE CONFLICT TESTS ==========

#[test]
fn test_disjoint_writers_both_commit() {
    let (db, people) = create_test_database();

    let txn1 = db.begin_transaction().unwrap();
    let txn2 = db.begin_transaction().unwrap();
    db.update_row(&txn1, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    db.update_row(&txn2, people, 2, &[AGE], &[Value::from(31)])
        .unwrap();

    let ts1 = txn1.commit().unwrap();
    let ts2 = txn2.commit().unwrap();
    assert!(ts2 > ts1);

    assert_eq!(age_of(&db, people, 1), Some(Value::from(26)));
    assert_eq!(age_of(&db, people, 2), Some(Value::from(31)));
}

#[test]
fn test_first_committer_wins() {
    let (db, people) = create_test_database();

    let txn1 = db.begin_transaction().unwrap();
    let txn2 = db.begin_transaction().unwrap();
    db.update_row(&txn1, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    // txn1 holds the row, so txn2's write is deferred instead of blocking.
    db.update_row(&txn2, people, 1, &[AGE], &[Value::from(27)])
        .unwrap();
    let own = db.get_row(&txn2, people, 1).unwrap().unwrap();
    assert_eq!(own.get(AGE), Some(&Value::from(27)));

    txn1.commit().unwrap();
    let err = txn2.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err.is_retryable());
    assert_eq!(txn2.state(), TransactionState::Aborted);

    assert_eq!(age_of(&db, people, 1), Some(Value::from(26)));
    assert_eq!(db.txn_manager().stats().conflicts, 1);
}

#[test]
fn test_write_after_concurrent_commit_conflicts() {
    let (db, people) = create_test_database();

    let txn1 = db.begin_transaction().unwrap();
    let txn2 = db.begin_transaction().unwrap();
    db.update_row(&txn2, people, 1, &[AGE], &[Value::from(27)])
        .unwrap();
    txn2.commit().unwrap();

    // The newest version was committed after txn1's snapshot.
    db.delete_row(&txn1, people, 1).unwrap();
    assert!(db.get_row(&txn1, people, 1).unwrap().is_none());
    assert_eq!(txn1.commit().unwrap_err().kind(), ErrorKind::Conflict);

    assert_eq!(age_of(&db, people, 1), Some(Value::from(27)));
}

#[test]
fn test_deferred_write_installs_when_holder_aborts() {
    let (db, people) = create_test_database();

    let txn1 = db.begin_transaction().unwrap();
    let txn2 = db.begin_transaction().unwrap();
    db.update_row(&txn1, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    db.update_row(&txn2, people, 1, &[AGE], &[Value::from(27)])
        .unwrap();

    txn1.abort().unwrap();
    txn2.commit().unwrap();
    assert_eq!(age_of(&db, people, 1), Some(Value::from(27)));
}

#[test]
fn test_cell_level_policy_merges_disjoint_columns() {
    let db = Database::open(DatabaseConfig {
        txn: TxnManagerConfig {
            conflict_policy: ConflictPolicy::CellLevel,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap();
    let people = create_people(&db);

    let txn1 = db.begin_transaction().unwrap();
    let txn2 = db.begin_transaction().unwrap();
    db.update_row(&txn1, people, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    db.update_row(&txn2, people, 1, &[NAME], &[Value::from("Alicia")])
        .unwrap();
    txn1.commit().unwrap();
    txn2.commit().unwrap();

    let check = db.begin_transaction().unwrap();
    let alice = db.get_row(&check, people, 1).unwrap().unwrap();
    assert_eq!(alice.values(), &[Value::from("Alicia"), Value::from(26)]);
    check.commit().unwrap();

    // Writing the same column still conflicts.
    let txn3 = db.begin_transaction().unwrap();
    let txn4 = db.begin_transaction().unwrap();
    db.update_row(&txn3, people, 2, &[AGE], &[Value::from(31)])
        .unwrap();
    db.update_row(&txn4, people, 2, &[NAME, AGE], &[
        Value::from("Robert"),
        Value::from(32),
    ])
    .unwrap();
    txn3.commit().unwrap();
    assert_eq!(txn4.commit().unwrap_err().kind(), ErrorKind::Conflict);
}

// ========== LIFECYCLE TESTS ==========

#[test]
fn test_finished_transaction_rejects_operations() {
    let (db, people) = create_test_database();

    let txn = db.begin_transaction().unwrap();
    txn.commit().unwrap();
    assert_eq!(txn.state(), TransactionState::Committed);
    assert_eq!(
        db.get_row(&txn, people, 1).unwrap_err().kind(),
        ErrorKind::InvalidState
    );
    assert_eq!(txn.commit().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(txn.abort().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_transaction_is_bound_to_its_database() {
    let (db, people) = create_test_database();
    let other = create_empty_database();

    let txn = other.begin_transaction().unwrap();
    assert!(matches!(
        db.get_row(&txn, people, 1),
        Err(StorageError::InvalidArgument(_))
    ));
    assert!(db.txn_manager().commit(&txn).is_err());
    txn.abort().unwrap();
}

#[test]
fn test_read_only_commit_does_not_log() {
    let sink = FlakySink::new();
    let db = sink.open_database();
    create_people(&db);
    let logged = sink.len();

    let txn = db.begin_transaction().unwrap();
    db.list_tables(&txn).unwrap();
    txn.commit().unwrap();
    assert_eq!(sink.len(), logged);
}
