//! # Table Operations
//!
//! Row CRUD over the KV transaction surface, including secondary-index
//! maintenance. Every mutation validates the record strictly against the
//! schema before anything is encoded.
//!
//! Index entries are `index_prefix || encode(indexCols || pk)` with an
//! empty value; the indexed columns plus the embedded primary key make
//! each entry unique, so updating a row deletes the entries derived from
//! the old row image and inserts the new ones.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::info;

use super::scan::Scanner;
use super::Database;
use crate::btree::{Cmp, NodeSource, TreeIter};
use crate::config::{MAX_RANGE_ROWS, META_TABLE_PREFIX, SCHEMA_TABLE_PREFIX, TABLE_PREFIX_MIN};
use crate::error::DbError;
use crate::kv::{KvWriteTxn, WriteMode, WriteRequest};
use crate::records::{
    decode_row, decode_values, encode_key, encode_row, DataType, Record, Value,
};
use crate::schema::{meta_table_def, ordered_values, schema_table_def, validate_table_def, TableDef};

/// A range-scan result. The row cap is surfaced alongside the partial
/// result rather than instead of it.
#[derive(Debug)]
pub struct RangeResult {
    pub rows: Vec<Record>,
    /// True when the scan stopped at the row cap with entries remaining.
    pub reached_limit: bool,
}

impl RangeResult {
    /// Converts the cap signal into the matching error kind, carrying the
    /// partial rows with it.
    pub fn into_rows(self) -> Result<Vec<Record>> {
        if self.reached_limit {
            Err(DbError::RangeLimit(self.rows).into())
        } else {
            Ok(self.rows)
        }
    }
}

pub(crate) fn build_record(tdef: &TableDef, pk: Vec<Value>, rest: Vec<Value>) -> Record {
    let mut rec = Record::new();
    for (col, val) in tdef.cols.iter().zip(pk.into_iter().chain(rest)) {
        rec.push(col.clone(), val);
    }
    rec
}

/// Point lookup by a column prefix of the primary key or of an index.
/// Replaces `rec` with the full row on a hit.
pub(crate) fn table_get<S: NodeSource>(
    db: &Database,
    store: &S,
    root: u64,
    tdef: &Arc<TableDef>,
    rec: &mut Record,
) -> Result<bool> {
    let sc = Scanner::new(db, store, root, tdef.clone(), Cmp::Ge, Cmp::Le, rec, rec)?;
    if !sc.valid() {
        return Ok(false);
    }
    *rec = sc.deref()?;
    Ok(true)
}

/// Closed-interval range scan with the row cap applied.
pub(crate) fn table_range<S: NodeSource>(
    db: &Database,
    store: &S,
    root: u64,
    tdef: &Arc<TableDef>,
    start: &Record,
    end: &Record,
) -> Result<RangeResult> {
    ensure!(
        start.cols() == end.cols(),
        "range bounds must name the same columns"
    );

    let mut sc = Scanner::new(db, store, root, tdef.clone(), Cmp::Ge, Cmp::Le, start, end)?;
    let mut rows = Vec::new();
    while sc.valid() {
        if rows.len() >= MAX_RANGE_ROWS {
            return Ok(RangeResult {
                rows,
                reached_limit: true,
            });
        }
        rows.push(sc.deref()?);
        sc.next()?;
    }
    Ok(RangeResult {
        rows,
        reached_limit: false,
    })
}

/// Walks the table's whole primary keyspace in order.
pub(crate) fn table_scan_all<S: NodeSource>(
    store: &S,
    root: u64,
    tdef: &Arc<TableDef>,
) -> Result<Vec<Record>> {
    let prefix = encode_key(tdef.prefix, &[]);
    let mut iter = TreeIter::seek(store, root, &prefix, Cmp::Ge)?;

    let mut rows = Vec::new();
    let mut prev: Option<Vec<u8>> = None;
    while iter.valid() {
        let (key, val) = iter.deref();
        if !key.starts_with(&prefix) {
            break;
        }
        if prev.as_deref() == Some(key) {
            // key failed to advance; stop rather than loop
            break;
        }
        let pk = decode_values(&key[4..], &tdef.types[..tdef.pkeys])?;
        let rest = decode_row(val, &tdef.types[tdef.pkeys..])?;
        rows.push(build_record(tdef, pk, rest));
        prev = Some(key.to_vec());
        iter.next()?;
    }
    Ok(rows)
}

/// Inserts, updates or upserts one row, maintaining secondary indexes.
pub(crate) fn table_update(
    txn: &mut KvWriteTxn<'_>,
    tdef: &TableDef,
    rec: &Record,
    mode: WriteMode,
) -> Result<bool> {
    let values = ordered_values(tdef, rec, tdef.cols.len())?;
    let key = encode_key(tdef.prefix, &values[..tdef.pkeys]);
    let mut row = Vec::new();
    encode_row(&mut row, &values[tdef.pkeys..]);

    let mut req = WriteRequest::new(key, row, mode);
    let added = txn.update(&mut req)?;
    if tdef.indexes.is_empty() {
        return Ok(added);
    }

    if req.updated && !req.added {
        // the old row image drives the index entries to drop
        let old = req.old.as_deref().expect("update captured the old value");
        let old_rest = decode_row(old, &tdef.types[tdef.pkeys..])?;
        let mut old_values = values.clone();
        old_values.truncate(tdef.pkeys);
        old_values.extend(old_rest);
        index_op(txn, tdef, &old_values, IndexOp::Delete)?;
    }
    if req.updated || req.added {
        index_op(txn, tdef, &values, IndexOp::Add)?;
    }
    Ok(added)
}

/// Deletes one row by primary key, dropping its index entries.
pub(crate) fn table_delete(
    txn: &mut KvWriteTxn<'_>,
    tdef: &TableDef,
    rec: &Record,
) -> Result<bool> {
    let pk = ordered_values(tdef, rec, tdef.pkeys)?;
    let key = encode_key(tdef.prefix, &pk);

    let Some(old) = txn.delete(&key)? else {
        return Ok(false);
    };
    if !tdef.indexes.is_empty() {
        let old_rest = decode_row(&old, &tdef.types[tdef.pkeys..])?;
        let mut values = pk;
        values.extend(old_rest);
        index_op(txn, tdef, &values, IndexOp::Delete)?;
    }
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexOp {
    Add,
    Delete,
}

/// Applies one row image to every secondary index. `values` is the full
/// row in schema order.
fn index_op(
    txn: &mut KvWriteTxn<'_>,
    tdef: &TableDef,
    values: &[Value],
    op: IndexOp,
) -> Result<()> {
    for (i, index) in tdef.indexes.iter().enumerate() {
        let ivals: Vec<Value> = index
            .iter()
            .map(|col| {
                let pos = tdef.col_index(col).expect("validated index column");
                values[pos].clone()
            })
            .collect();
        let key = encode_key(tdef.index_prefixes[i], &ivals);

        match op {
            IndexOp::Add => {
                let mut req = WriteRequest::new(key, Vec::new(), WriteMode::Upsert);
                txn.update(&mut req)?;
            }
            IndexOp::Delete => {
                let removed = txn.delete(&key)?;
                ensure!(
                    removed.is_some(),
                    "dangling index entry for table {} index {}",
                    tdef.name,
                    i
                );
            }
        }
    }
    Ok(())
}

/// Creates a table: validates the definition, assigns prefixes from the
/// `@meta` counter and persists the schema under `@table`.
pub(crate) fn table_create(
    db: &Database,
    txn: &mut KvWriteTxn<'_>,
    mut tdef: TableDef,
) -> Result<()> {
    validate_table_def(&mut tdef)?;
    if tdef.name.starts_with('@') {
        return Err(DbError::Schema("table names starting with '@' are reserved".into()).into());
    }

    let name_key = encode_key(
        SCHEMA_TABLE_PREFIX,
        &[Value::Bytes(tdef.name.as_bytes().to_vec())],
    );
    if txn.get(&name_key)?.is_some() {
        return Err(DbError::AlreadyExists)
            .wrap_err_with(|| format!("table already exists: {}", tdef.name));
    }

    let meta_key = encode_key(META_TABLE_PREFIX, &[Value::Bytes(b"next_prefix".to_vec())]);
    let next = match txn.get(&meta_key)? {
        Some(raw) => {
            let vals = decode_row(&raw, &[DataType::Bytes])?;
            let bytes = vals[0].as_bytes().expect("val column is BYTES");
            ensure!(bytes.len() == 4, "corrupted next_prefix value");
            u32::from_le_bytes(bytes.try_into().expect("length checked above"))
        }
        None => TABLE_PREFIX_MIN,
    };
    ensure!(
        next >= TABLE_PREFIX_MIN,
        "prefix counter {} below the reserved range",
        next
    );

    tdef.prefix = next;
    tdef.index_prefixes.clear();
    for i in 0..tdef.indexes.len() {
        let prefix = tdef
            .prefix
            .checked_add(1 + i as u32)
            .ok_or(DbError::Overflow)?;
        tdef.index_prefixes.push(prefix);
    }
    let consumed = 1 + tdef.indexes.len() as u32;
    let next_prefix = tdef.prefix.checked_add(consumed).ok_or(DbError::Overflow)?;

    let meta_rec = Record::new()
        .with_str("key", "next_prefix")
        .with_bytes("val", next_prefix.to_le_bytes().to_vec());
    table_update(txn, &meta_table_def(), &meta_rec, WriteMode::Upsert)?;

    let json = serde_json::to_vec(&tdef).wrap_err("failed to serialize table definition")?;
    let schema_rec = Record::new()
        .with_str("name", &tdef.name)
        .with_bytes("def", json);
    table_update(txn, &schema_table_def(), &schema_rec, WriteMode::Upsert)?;

    info!(
        table = %tdef.name,
        prefix = tdef.prefix,
        indexes = tdef.indexes.len(),
        "created table"
    );
    db.cache_insert(tdef);
    Ok(())
}
