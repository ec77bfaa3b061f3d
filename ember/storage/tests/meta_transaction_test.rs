mod common;

use std::sync::Arc;

use common::*;
use ember_storage::mvcc::TransactionContext;
use ember_storage::{
    DatabaseConfig, DatabaseInstance, ErrorKind, StorageError, StorageResult, TableId, Value,
};
use ember_transaction::{Transaction, TransactionState};

/// An instance with databases `a` and `b`, each holding `people`.
fn create_instance() -> (Arc<DatabaseInstance>, TableId, TableId) {
    let instance = Arc::new(DatabaseInstance::new());
    let a = instance.attach("a", DatabaseConfig::default()).unwrap();
    let b = instance.attach("b", DatabaseConfig::default()).unwrap();
    let table_a = create_people(&a);
    let table_b = create_people(&b);
    (instance, table_a, table_b)
}

fn names_in(ctx: &mut TransactionContext, database: &str, table: TableId) -> Vec<Value> {
    ctx.execute(|ctx| {
        let (db, txn) = ctx.transaction(database)?;
        Ok(db
            .scan(&txn, table)?
            .into_iter()
            .filter_map(|(_, row)| row.get(NAME).cloned())
            .collect())
    })
    .unwrap()
}

// ========== META-TRANSACTION TESTS ==========

#[test]
fn test_meta_transaction_commits_atomically() {
    let (instance, table_a, table_b) = create_instance();
    let a = instance.get("a").unwrap();
    let b = instance.get("b").unwrap();

    let meta = instance.begin().unwrap();
    let txn_a = meta.get_transaction(&a).unwrap();
    let txn_b = meta.get_transaction(&b).unwrap();
    assert!(Arc::ptr_eq(&txn_a, &meta.get_transaction(&a).unwrap()));
    assert_eq!(txn_a.txn_id(), meta.txn_id());
    assert_eq!(txn_b.start_ts(), meta.start_ts());

    a.insert_row(&txn_a, table_a, vec![Value::from("Carol"), Value::from(41)])
        .unwrap();
    b.delete_row(&txn_b, table_b, 1).unwrap();

    // Concurrent readers see neither change.
    let reader = instance.begin().unwrap();
    let reader_a = reader.get_transaction(&a).unwrap();
    assert_eq!(a.scan(&reader_a, table_a).unwrap().len(), 2);

    let commit_ts = meta.commit().unwrap();
    assert_eq!(meta.state(), TransactionState::Committed);
    assert_eq!(txn_a.commit_ts(), Some(commit_ts));
    assert_eq!(txn_b.commit_ts(), Some(commit_ts));

    // The reader began before the commit and still sees neither change.
    let reader_b = reader.get_transaction(&b).unwrap();
    assert_eq!(b.scan(&reader_b, table_b).unwrap().len(), 2);
    reader.commit().unwrap();

    let mut ctx = TransactionContext::new(instance.clone());
    assert_eq!(names_in(&mut ctx, "a", table_a).len(), 3);
    assert_eq!(names_in(&mut ctx, "b", table_b), vec![Value::from("Bob")]);
}

#[test]
fn test_meta_transaction_rolls_back_on_drop() {
    let (instance, table_a, table_b) = create_instance();
    let a = instance.get("a").unwrap();
    let b = instance.get("b").unwrap();

    let txn_a = {
        let meta = instance.begin().unwrap();
        let txn_a = meta.get_transaction(&a).unwrap();
        let txn_b = meta.get_transaction(&b).unwrap();
        a.insert_row(&txn_a, table_a, vec![Value::from("Carol"), Value::from(41)])
            .unwrap();
        b.insert_row(&txn_b, table_b, vec![Value::from("Carol"), Value::from(41)])
            .unwrap();
        txn_a
    };
    assert_eq!(txn_a.state(), TransactionState::Aborted);

    let mut ctx = TransactionContext::new(instance.clone());
    assert_eq!(names_in(&mut ctx, "a", table_a).len(), 2);
    assert_eq!(names_in(&mut ctx, "b", table_b).len(), 2);
    assert_eq!(a.txn_manager().active_count(), 0);
}

#[test]
fn test_conflict_in_one_database_aborts_all() {
    let (instance, table_a, table_b) = create_instance();
    let a = instance.get("a").unwrap();
    let b = instance.get("b").unwrap();

    let loser = instance.begin().unwrap();
    let winner = instance.begin().unwrap();
    let winner_a = winner.get_transaction(&a).unwrap();
    a.update_row(&winner_a, table_a, 1, &[AGE], &[Value::from(26)])
        .unwrap();

    let loser_a = loser.get_transaction(&a).unwrap();
    let loser_b = loser.get_transaction(&b).unwrap();
    a.update_row(&loser_a, table_a, 1, &[AGE], &[Value::from(27)])
        .unwrap();
    b.insert_row(&loser_b, table_b, vec![Value::from("Carol"), Value::from(41)])
        .unwrap();

    winner.commit().unwrap();
    let err = loser.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(loser.state(), TransactionState::Aborted);
    assert_eq!(loser_b.state(), TransactionState::Aborted);

    assert_eq!(age_of(&a, table_a, 1), Some(Value::from(26)));
    let mut ctx = TransactionContext::new(instance.clone());
    assert_eq!(names_in(&mut ctx, "b", table_b).len(), 2);
}

#[test]
fn test_participant_cannot_finish_on_its_own() {
    let (instance, table_a, table_b) = create_instance();
    let a = instance.get("a").unwrap();
    let b = instance.get("b").unwrap();

    let meta = instance.begin().unwrap();
    let txn_a = meta.get_transaction(&a).unwrap();
    let txn_b = meta.get_transaction(&b).unwrap();
    assert!(txn_a.is_meta_owned());
    a.update_row(&txn_a, table_a, 1, &[AGE], &[Value::from(99)])
        .unwrap();
    b.update_row(&txn_b, table_b, 1, &[AGE], &[Value::from(99)])
        .unwrap();

    assert_eq!(txn_a.commit().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(txn_b.abort().unwrap_err().kind(), ErrorKind::InvalidState);
    assert_eq!(txn_a.state(), TransactionState::Active);
    assert_eq!(txn_b.state(), TransactionState::Active);

    let commit_ts = meta.commit().unwrap();
    assert_eq!(txn_a.commit_ts(), Some(commit_ts));
    assert_eq!(txn_b.commit_ts(), Some(commit_ts));
    assert_eq!(age_of(&a, table_a, 1), Some(Value::from(99)));
    assert_eq!(age_of(&b, table_b, 1), Some(Value::from(99)));
}

#[test]
fn test_pinned_start_holds_back_every_watermark() {
    let (instance, table_a, _) = create_instance();
    let a = instance.get("a").unwrap();
    let b = instance.get("b").unwrap();

    let meta = instance.begin().unwrap();

    let txn = a.begin_transaction().unwrap();
    a.update_row(&txn, table_a, 1, &[AGE], &[Value::from(26)])
        .unwrap();
    txn.commit().unwrap();

    // The meta-transaction has not touched either database yet.
    assert!(a.txn_manager().lowest_active_start() <= meta.start_ts());
    assert!(b.txn_manager().lowest_active_start() <= meta.start_ts());
    a.txn_manager().run_cleanup().unwrap();
    assert_eq!(a.txn_manager().pending_cleanup(), 1);

    let txn_a = meta.get_transaction(&a).unwrap();
    let alice = a.get_row(&txn_a, table_a, 1).unwrap().unwrap();
    assert_eq!(alice.get(AGE), Some(&Value::from(25)));
    meta.commit().unwrap();

    assert!(a.txn_manager().lowest_active_start() > meta.start_ts());
}

#[test]
fn test_empty_meta_transaction_commits() {
    let instance = DatabaseInstance::new();
    let meta = instance.begin().unwrap();
    assert_eq!(meta.commit().unwrap(), meta.start_ts());
    assert!(meta.participants().is_empty());
    assert_eq!(meta.commit().unwrap_err().kind(), ErrorKind::InvalidState);
}

#[test]
fn test_foreign_database_is_rejected() {
    let (instance, _, _) = create_instance();
    let stranger = create_empty_database();
    let meta = instance.begin().unwrap();
    assert!(matches!(
        meta.get_transaction(&stranger),
        Err(StorageError::InvalidArgument(_))
    ));
    meta.abort().unwrap();
    assert_eq!(
        meta.get_transaction(&instance.get("a").unwrap())
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidState
    );
}

#[test]
fn test_attach_and_detach() {
    let instance = DatabaseInstance::new();
    instance.attach("a", DatabaseConfig::default()).unwrap();
    assert!(instance.attach("a", DatabaseConfig::default()).is_err());
    instance.attach("b", DatabaseConfig::default()).unwrap();
    assert_eq!(instance.database_names(), vec!["a", "b"]);
    assert_ne!(instance.database_id("a"), instance.database_id("b"));

    instance.detach("a").unwrap();
    assert!(instance.get("a").is_none());
    assert!(matches!(
        instance.detach("a"),
        Err(StorageError::DatabaseNotFound(_))
    ));
}

// ========== CONTEXT TESTS ==========

#[test]
fn test_execute_auto_commits_and_rolls_back() {
    let (instance, table_a, _) = create_instance();
    let mut ctx = TransactionContext::new(instance.clone());

    ctx.execute(|ctx| {
        let (db, txn) = ctx.transaction("a")?;
        db.insert_row(&txn, table_a, vec![Value::from("Carol"), Value::from(41)])?;
        Ok(())
    })
    .unwrap();
    assert!(!ctx.is_active());

    let result: StorageResult<()> = ctx.execute(|ctx| {
        let (db, txn) = ctx.transaction("a")?;
        db.insert_row(&txn, table_a, vec![Value::from("Dave"), Value::from(50)])?;
        Err(StorageError::InvalidArgument("stop".into()))
    });
    assert!(result.is_err());
    assert!(!ctx.is_active());

    assert_eq!(names_in(&mut ctx, "a", table_a), vec![
        Value::from("Alice"),
        Value::from("Bob"),
        Value::from("Carol"),
    ]);
}

#[test]
fn test_execute_joins_open_transaction() {
    let (instance, table_a, _) = create_instance();
    let mut ctx = TransactionContext::new(instance.clone());

    ctx.begin_transaction().unwrap();
    assert!(ctx.begin_transaction().is_err());
    ctx.execute(|ctx| {
        let (db, txn) = ctx.transaction("a")?;
        db.delete_row(&txn, table_a, 2)
    })
    .unwrap();
    // Still open: the statement ran inside the explicit transaction.
    assert!(ctx.is_active());
    ctx.rollback().unwrap();
    assert!(ctx.rollback().is_err());

    assert_eq!(names_in(&mut ctx, "a", table_a).len(), 2);
}

#[test]
fn test_savepoints() {
    let (instance, table_a, table_b) = create_instance();
    let mut ctx = TransactionContext::new(instance.clone());

    ctx.begin_transaction().unwrap();
    let (a, txn_a) = ctx.transaction("a").unwrap();
    a.insert_row(&txn_a, table_a, vec![Value::from("Carol"), Value::from(41)])
        .unwrap();
    ctx.savepoint("sp1").unwrap();

    a.update_row(&txn_a, table_a, 1, &[NAME], &[Value::from("Alicia")])
        .unwrap();
    a.insert_row(&txn_a, table_a, vec![Value::from("Dave"), Value::from(50)])
        .unwrap();
    // Database b is first touched after the savepoint.
    let (b, txn_b) = ctx.transaction("b").unwrap();
    b.delete_row(&txn_b, table_b, 1).unwrap();
    ctx.savepoint("sp2").unwrap();
    a.delete_row(&txn_a, table_a, 2).unwrap();

    ctx.rollback_to_savepoint("sp1").unwrap();
    assert!(ctx.rollback_to_savepoint("sp2").is_err());
    let names: Vec<_> = a
        .scan(&txn_a, table_a)
        .unwrap()
        .into_iter()
        .filter_map(|(_, row)| row.get(NAME).cloned())
        .collect();
    assert_eq!(names, vec![
        Value::from("Alice"),
        Value::from("Bob"),
        Value::from("Carol"),
    ]);
    assert_eq!(b.scan(&txn_b, table_b).unwrap().len(), 2);

    // The savepoint survives its rollback and work continues after it.
    a.insert_row(&txn_a, table_a, vec![Value::from("Erin"), Value::from(33)])
        .unwrap();
    ctx.rollback_to_savepoint("sp1").unwrap();
    ctx.release_savepoint("sp1").unwrap();
    assert!(ctx.rollback_to_savepoint("sp1").is_err());
    ctx.commit().unwrap();

    assert_eq!(names_in(&mut ctx, "a", table_a), vec![
        Value::from("Alice"),
        Value::from("Bob"),
        Value::from("Carol"),
    ]);
    assert_eq!(names_in(&mut ctx, "b", table_b).len(), 2);
}

#[test]
fn test_context_drop_rolls_back() {
    let (instance, table_a, _) = create_instance();
    {
        let mut ctx = TransactionContext::new(instance.clone());
        ctx.begin_transaction().unwrap();
        let (a, txn) = ctx.transaction("a").unwrap();
        a.insert_row(&txn, table_a, vec![Value::from("Carol"), Value::from(41)])
            .unwrap();
    }
    let mut ctx = TransactionContext::new(instance.clone());
    assert_eq!(names_in(&mut ctx, "a", table_a).len(), 2);
}
