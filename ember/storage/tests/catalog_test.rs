mod common;

use common::*;
use ember_storage::error::CatalogError;
use ember_storage::{ErrorKind, StorageError, Value};
use ember_transaction::Transaction;

#[test]
fn test_create_table_is_transactional() {
    let db = create_empty_database();

    let txn1 = db.begin_transaction().unwrap();
    let reader = db.begin_transaction().unwrap();
    let table = db.create_table(&txn1, "t", &["v"]).unwrap();
    db.insert_row(&txn1, table, vec![Value::from(1)]).unwrap();
    assert_eq!(db.lookup_table(&txn1, "t").unwrap().id, table);
    assert!(matches!(
        db.lookup_table(&reader, "t"),
        Err(StorageError::TableNotFound(_))
    ));

    // A concurrent create of the same name conflicts right away.
    let txn2 = db.begin_transaction().unwrap();
    assert_eq!(
        db.create_table(&txn2, "t", &["w"]).unwrap_err().kind(),
        ErrorKind::Conflict
    );
    txn2.abort().unwrap();

    txn1.commit().unwrap();
    assert!(db.lookup_table(&reader, "t").is_err());
    reader.commit().unwrap();

    let txn3 = db.begin_transaction().unwrap();
    assert_eq!(db.list_tables(&txn3).unwrap(), vec!["t"]);
    assert!(matches!(
        db.create_table(&txn3, "t", &["w"]),
        Err(StorageError::Catalog(CatalogError::AlreadyExists(_)))
    ));
    assert_eq!(db.scan(&txn3, table).unwrap().len(), 1);
    txn3.commit().unwrap();
}

#[test]
fn test_aborted_create_leaves_nothing() {
    let db = create_empty_database();

    let txn = db.begin_transaction().unwrap();
    let table = db.create_table(&txn, "t", &["v"]).unwrap();
    db.insert_row(&txn, table, vec![Value::from(1)]).unwrap();
    txn.abort().unwrap();
    assert!(db.table(table).is_none());
    assert_eq!(db.catalog().chain_len("t"), 0);

    let txn = db.begin_transaction().unwrap();
    let again = db.create_table(&txn, "t", &["v"]).unwrap();
    assert_ne!(again, table);
    txn.commit().unwrap();
}

#[test]
fn test_drop_table_respects_snapshots() {
    let (db, people) = create_test_database();
    let index_txn = db.begin_transaction().unwrap();
    db.create_index(&index_txn, "people_name", "people", "name")
        .unwrap();
    index_txn.commit().unwrap();

    let reader = db.begin_transaction().unwrap();
    let dropper = db.begin_transaction().unwrap();
    db.drop_table(&dropper, "people").unwrap();
    assert!(db.lookup_table(&dropper, "people").is_err());
    assert!(db.lookup_index(&dropper, "people_name").is_err());
    dropper.commit().unwrap();

    // The older snapshot still reads the table and its index.
    assert_eq!(db.lookup_table(&reader, "people").unwrap().id, people);
    assert_eq!(db.scan(&reader, people).unwrap().len(), 2);
    let alice = db
        .index_lookup(&reader, "people_name", &Value::from("Alice"))
        .unwrap();
    assert_eq!(alice.len(), 1);

    let fresh = db.begin_transaction().unwrap();
    assert!(matches!(
        db.lookup_table(&fresh, "people"),
        Err(StorageError::TableNotFound(_))
    ));
    assert!(db.list_tables(&fresh).unwrap().is_empty());
    fresh.commit().unwrap();
    reader.commit().unwrap();

    // Once no snapshot can see it, the table and its chain are gone.
    db.txn_manager().run_cleanup().unwrap();
    assert!(db.table(people).is_none());
    assert_eq!(db.catalog().chain_len("people"), 0);
    assert_eq!(db.catalog().chain_len("people_name"), 0);
}

#[test]
fn test_aborted_drop_restores_entry() {
    let (db, people) = create_test_database();

    let txn = db.begin_transaction().unwrap();
    db.drop_table(&txn, "people").unwrap();
    assert!(matches!(
        db.drop_table(&txn, "people"),
        Err(StorageError::TableNotFound(_))
    ));
    txn.abort().unwrap();

    let txn = db.begin_transaction().unwrap();
    assert_eq!(db.lookup_table(&txn, "people").unwrap().id, people);
    assert_eq!(db.scan(&txn, people).unwrap().len(), 2);
    txn.commit().unwrap();
    assert_eq!(db.catalog().chain_len("people"), 1);
}

#[test]
fn test_lookup_checks_entry_kind() {
    let (db, _) = create_test_database();

    let txn = db.begin_transaction().unwrap();
    db.create_index(&txn, "people_age", "people", "age").unwrap();
    assert!(matches!(
        db.lookup_table(&txn, "people_age"),
        Err(StorageError::Catalog(CatalogError::WrongKind(..)))
    ));
    assert!(matches!(
        db.lookup_index(&txn, "people"),
        Err(StorageError::Catalog(CatalogError::WrongKind(..)))
    ));
    assert!(matches!(
        db.create_index(&txn, "bad", "people", "height"),
        Err(StorageError::InvalidArgument(_))
    ));
    db.drop_index(&txn, "people_age").unwrap();
    assert!(matches!(
        db.lookup_index(&txn, "people_age"),
        Err(StorageError::IndexNotFound(_))
    ));
    txn.commit().unwrap();
}

#[test]
fn test_index_created_over_existing_rows() {
    let (db, people) = create_test_database();

    let writer = db.begin_transaction().unwrap();
    db.update_row(&writer, people, 2, &[AGE], &[Value::from(25)])
        .unwrap();

    let txn = db.begin_transaction().unwrap();
    db.create_index(&txn, "people_age", "people", "age").unwrap();
    writer.commit().unwrap();

    // Only versions the creator sees qualify, though uncommitted ones were indexed too.
    let hits = db
        .index_lookup(&txn, "people_age", &Value::from(25))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, 1);
    txn.commit().unwrap();

    let txn = db.begin_transaction().unwrap();
    let hits = db
        .index_lookup(&txn, "people_age", &Value::from(25))
        .unwrap();
    assert_eq!(hits.len(), 2);
    txn.commit().unwrap();
}
