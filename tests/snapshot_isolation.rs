//! # Snapshot Isolation
//!
//! A reader pinned before a commit keeps its version through any number
//! of later commits; new readers see the latest state immediately.

use strata::{DataType, Database, Record, TableDef, Value};

fn open_db(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(name)).unwrap();
    (dir, db)
}

fn accounts_table() -> TableDef {
    TableDef::new("accounts")
        .with_column("id", DataType::Int64)
        .with_column("balance", DataType::Int64)
}

fn account(id: i64, balance: i64) -> Record {
    Record::new()
        .with_int64("id", id)
        .with_int64("balance", balance)
}

#[test]
fn pinned_reader_survives_a_delete() {
    let (_dir, db) = open_db("pin.db");

    let mut tx = db.begin_write();
    tx.table_create(accounts_table()).unwrap();
    tx.insert("accounts", &account(1, 100)).unwrap();
    tx.commit().unwrap();

    let pinned = db.begin_read();
    let pinned_version = pinned.version();

    let mut tx = db.begin_write();
    assert!(tx
        .delete("accounts", &Record::new().with_int64("id", 1))
        .unwrap());
    tx.commit().unwrap();

    // the pinned reader still resolves the deleted row
    let mut rec = Record::new().with_int64("id", 1);
    assert!(pinned.get("accounts", &mut rec).unwrap());
    assert_eq!(rec.get("balance").unwrap(), &Value::Int64(100));

    // a fresh reader observes the delete
    let fresh = db.begin_read();
    assert!(fresh.version() > pinned_version);
    let mut rec = Record::new().with_int64("id", 1);
    assert!(!fresh.get("accounts", &mut rec).unwrap());
}

#[test]
fn pinned_reader_survives_many_later_commits() {
    let (_dir, db) = open_db("many.db");

    let mut tx = db.begin_write();
    tx.table_create(accounts_table()).unwrap();
    for id in 0..50i64 {
        tx.insert("accounts", &account(id, id)).unwrap();
    }
    tx.commit().unwrap();

    let pinned = db.begin_read();

    for round in 1..=10i64 {
        let mut tx = db.begin_write();
        for id in 0..50i64 {
            tx.upsert("accounts", &account(id, id + round * 1000)).unwrap();
        }
        tx.commit().unwrap();
    }

    // every row still reads at its pinned value
    for id in 0..50i64 {
        let mut rec = Record::new().with_int64("id", id);
        assert!(pinned.get("accounts", &mut rec).unwrap());
        assert_eq!(rec.get("balance").unwrap(), &Value::Int64(id));
    }

    let fresh = db.begin_read();
    let mut rec = Record::new().with_int64("id", 7);
    assert!(fresh.get("accounts", &mut rec).unwrap());
    assert_eq!(rec.get("balance").unwrap(), &Value::Int64(10_007));
}

#[test]
fn scans_are_snapshot_consistent() {
    let (_dir, db) = open_db("scanpin.db");

    let mut tx = db.begin_write();
    tx.table_create(accounts_table()).unwrap();
    for id in 0..20i64 {
        tx.insert("accounts", &account(id, 1)).unwrap();
    }
    tx.commit().unwrap();

    let pinned = db.begin_read();

    let mut tx = db.begin_write();
    for id in 20..40i64 {
        tx.insert("accounts", &account(id, 2)).unwrap();
    }
    for id in 0..10i64 {
        tx.delete("accounts", &Record::new().with_int64("id", id))
            .unwrap();
    }
    tx.commit().unwrap();

    let old_rows = pinned.scan("accounts").unwrap();
    assert_eq!(old_rows.len(), 20);
    assert!(old_rows
        .iter()
        .all(|r| r.get("balance").unwrap() == &Value::Int64(1)));

    let new_rows = db.begin_read().scan("accounts").unwrap();
    assert_eq!(new_rows.len(), 30);
}

#[test]
fn write_transaction_reads_its_own_writes_not_others() {
    let (_dir, db) = open_db("ownwrites.db");

    let mut tx = db.begin_write();
    tx.table_create(accounts_table()).unwrap();
    tx.insert("accounts", &account(1, 10)).unwrap();
    tx.commit().unwrap();

    let reader = db.begin_read();

    let mut tx = db.begin_write();
    tx.upsert("accounts", &account(1, 20)).unwrap();

    // the writer sees its staged value; the reader does not
    let mut rec = Record::new().with_int64("id", 1);
    assert!(tx.get("accounts", &mut rec).unwrap());
    assert_eq!(rec.get("balance").unwrap(), &Value::Int64(20));

    let mut rec = Record::new().with_int64("id", 1);
    assert!(reader.get("accounts", &mut rec).unwrap());
    assert_eq!(rec.get("balance").unwrap(), &Value::Int64(10));

    tx.commit().unwrap();

    // still pinned after the commit
    let mut rec = Record::new().with_int64("id", 1);
    assert!(reader.get("accounts", &mut rec).unwrap());
    assert_eq!(rec.get("balance").unwrap(), &Value::Int64(10));
}
