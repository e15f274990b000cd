//! # Secondary Index Maintenance
//!
//! Indexes are written alongside every insert, rewritten on update, and
//! dropped on delete. Queries by indexed columns must agree with the
//! primary rows at all times.

use strata::{DataType, Database, Record, TableDef, Value};

fn open_db(name: &str) -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join(name)).unwrap();
    (dir, db)
}

fn products_table() -> TableDef {
    TableDef::new("products")
        .with_column("id", DataType::Int64)
        .with_column("cat", DataType::Bytes)
        .with_column("price", DataType::Int64)
        .with_index(&["cat"])
        .with_index(&["cat", "price"])
}

fn product(id: i64, cat: &str, price: i64) -> Record {
    Record::new()
        .with_int64("id", id)
        .with_str("cat", cat)
        .with_int64("price", price)
}

const CATS: [&str; 5] = ["alpha", "bravo", "charlie", "delta", "echo"];

fn seeded(name: &str) -> (tempfile::TempDir, Database) {
    let (dir, db) = open_db(name);
    let mut tx = db.begin_write();
    tx.table_create(products_table()).unwrap();
    for id in 0..100i64 {
        let cat = CATS[(id % 5) as usize];
        tx.insert("products", &product(id, cat, id * 10)).unwrap();
    }
    tx.commit().unwrap();
    (dir, db)
}

#[test]
fn range_by_category_returns_rows_in_pk_order() {
    let (_dir, db) = seeded("bycat.db");

    let reader = db.begin_read();
    let result = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "charlie"),
            &Record::new().with_str("cat", "charlie"),
        )
        .unwrap();

    assert_eq!(result.rows.len(), 20);
    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get("id").unwrap().as_int64().unwrap())
        .collect();
    let expected: Vec<i64> = (0..100).filter(|id| id % 5 == 2).collect();
    assert_eq!(ids, expected);

    // every materialized row carries the full column set
    for row in &result.rows {
        assert_eq!(row.get("cat").unwrap().as_bytes().unwrap(), b"charlie");
        let id = row.get("id").unwrap().as_int64().unwrap();
        assert_eq!(row.get("price").unwrap(), &Value::Int64(id * 10));
    }
}

#[test]
fn get_by_indexed_column_finds_the_first_match() {
    let (_dir, db) = seeded("getidx.db");

    let reader = db.begin_read();
    let mut rec = Record::new().with_str("cat", "bravo");
    assert!(reader.get("products", &mut rec).unwrap());
    // the first bravo row in pk order
    assert_eq!(rec.get("id").unwrap(), &Value::Int64(1));
    assert_eq!(rec.get("price").unwrap(), &Value::Int64(10));
}

#[test]
fn compound_index_narrows_by_price() {
    let (_dir, db) = seeded("compound.db");

    let reader = db.begin_read();
    let result = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "alpha").with_int64("price", 200),
            &Record::new().with_str("cat", "alpha").with_int64("price", 500),
        )
        .unwrap();

    let prices: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get("price").unwrap().as_int64().unwrap())
        .collect();
    assert_eq!(prices, vec![200, 250, 300, 350, 400, 450, 500]);
}

#[test]
fn delete_drops_entries_from_every_index() {
    let (_dir, db) = seeded("delidx.db");

    let mut tx = db.begin_write();
    assert!(tx
        .delete("products", &Record::new().with_int64("id", 12))
        .unwrap());
    tx.commit().unwrap();

    let reader = db.begin_read();

    // primary row gone
    let mut rec = Record::new().with_int64("id", 12);
    assert!(!reader.get("products", &mut rec).unwrap());

    // gone from the single-column index
    let by_cat = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "charlie"),
            &Record::new().with_str("cat", "charlie"),
        )
        .unwrap();
    assert_eq!(by_cat.rows.len(), 19);
    assert!(by_cat
        .rows
        .iter()
        .all(|r| r.get("id").unwrap().as_int64().unwrap() != 12));

    // gone from the compound index
    let by_price = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "charlie").with_int64("price", 120),
            &Record::new().with_str("cat", "charlie").with_int64("price", 120),
        )
        .unwrap();
    assert!(by_price.rows.is_empty());
}

#[test]
fn update_moves_index_entries_to_the_new_image() {
    let (_dir, db) = seeded("updidx.db");

    let mut tx = db.begin_write();
    tx.update("products", &product(7, "zulu", 777)).unwrap();
    tx.commit().unwrap();

    let reader = db.begin_read();

    // found under the new category
    let new_cat = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "zulu"),
            &Record::new().with_str("cat", "zulu"),
        )
        .unwrap();
    assert_eq!(new_cat.rows.len(), 1);
    assert_eq!(new_cat.rows[0].get("id").unwrap(), &Value::Int64(7));

    // no longer under the old one (id 7 was charlie)
    let old_cat = reader
        .get_range(
            "products",
            &Record::new().with_str("cat", "charlie"),
            &Record::new().with_str("cat", "charlie"),
        )
        .unwrap();
    assert!(old_cat
        .rows
        .iter()
        .all(|r| r.get("id").unwrap().as_int64().unwrap() != 7));
}

#[test]
fn index_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reopen.db");

    {
        let db = Database::open(&path).unwrap();
        let mut tx = db.begin_write();
        tx.table_create(products_table()).unwrap();
        tx.insert("products", &product(1, "kilo", 5)).unwrap();
        tx.commit().unwrap();
    }

    let db = Database::open(&path).unwrap();
    let reader = db.begin_read();
    let mut rec = Record::new().with_str("cat", "kilo");
    assert!(reader.get("products", &mut rec).unwrap());
    assert_eq!(rec.get("id").unwrap(), &Value::Int64(1));
}
