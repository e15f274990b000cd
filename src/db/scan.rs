//! # Range Scanner
//!
//! Ties a tree iterator to an encoded `[key_start, key_end]` window over
//! the keyspace selected for the query: the primary rows, or one
//! secondary index. Bounds come from column prefixes; missing trailing
//! columns are padded to their maximum on the upper bound so the window
//! covers every completion.
//!
//! Dereferencing a primary-keyspace entry decodes the row in place. An
//! index entry only carries `indexCols || pk`, so the scanner extracts
//! the primary key and materializes the row with a primary lookup.

use std::sync::Arc;

use eyre::{ensure, Result};

use super::ops;
use super::Database;
use crate::btree::{Cmp, NodeSource, TreeIter};
use crate::error::DbError;
use crate::records::{decode_row, decode_values, encode_key_partial, DataType, Record, Value};
use crate::schema::{find_index, IndexChoice, TableDef};

pub(crate) struct Scanner<'a, S: NodeSource> {
    db: &'a Database,
    store: &'a S,
    root: u64,
    tdef: Arc<TableDef>,
    choice: IndexChoice,
    key_start: Vec<u8>,
    key_end: Vec<u8>,
    iter: TreeIter<'a, S>,
    dead: bool,
}

/// Validates the provided columns strictly against the schema and clones
/// their values in the provided order.
fn checked_values(tdef: &TableDef, rec: &Record) -> Result<Vec<Value>> {
    for (col, val) in rec.cols().iter().zip(rec.vals()) {
        let Some(expected) = tdef.col_type(col) else {
            return Err(DbError::Schema(format!(
                "unknown column '{}' for table {}",
                col, tdef.name
            ))
            .into());
        };
        if val.data_type() != expected {
            return Err(DbError::TypeMismatch { column: col.clone() }.into());
        }
    }
    Ok(rec.vals().to_vec())
}

impl<'a, S: NodeSource> Scanner<'a, S> {
    pub(crate) fn new(
        db: &'a Database,
        store: &'a S,
        root: u64,
        tdef: Arc<TableDef>,
        cmp1: Cmp,
        cmp2: Cmp,
        start: &Record,
        end: &Record,
    ) -> Result<Self> {
        ensure!(cmp1.is_forward() != cmp2.is_forward(), "bad range");

        let choice = find_index(&tdef, start.cols())?;
        let (index_cols, prefix) = match choice {
            IndexChoice::Primary => (&tdef.cols[..tdef.pkeys], tdef.prefix),
            IndexChoice::Secondary(i) => (&tdef.indexes[i][..], tdef.index_prefixes[i]),
        };

        let start_vals = checked_values(&tdef, start)?;
        let end_vals = checked_values(&tdef, end)?;
        let missing_after = |n: usize| -> Vec<DataType> {
            index_cols[n..]
                .iter()
                .map(|c| tdef.col_type(c).expect("validated index column"))
                .collect()
        };
        let key_start =
            encode_key_partial(prefix, &start_vals, &missing_after(start_vals.len()), cmp1);
        let key_end = encode_key_partial(prefix, &end_vals, &missing_after(end_vals.len()), cmp2);

        let iter = TreeIter::seek(store, root, &key_start, cmp1)?;
        Ok(Scanner {
            db,
            store,
            root,
            tdef,
            choice,
            key_start,
            key_end,
            iter,
            dead: false,
        })
    }

    pub(crate) fn valid(&self) -> bool {
        if self.dead || !self.iter.valid() {
            return false;
        }
        let (key, _) = self.iter.deref();
        key >= self.key_start.as_slice() && key <= self.key_end.as_slice()
    }

    pub(crate) fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let current = self.iter.deref().0.to_vec();
        self.iter.next()?;
        if self.iter.valid() && self.iter.deref().0 == current.as_slice() {
            // key failed to advance; invalidate instead of looping
            self.dead = true;
        }
        Ok(())
    }

    /// Materializes the full row under the cursor.
    pub(crate) fn deref(&self) -> Result<Record> {
        debug_assert!(self.valid());
        let (key, val) = self.iter.deref();

        match self.choice {
            IndexChoice::Primary => {
                let pk = decode_values(&key[4..], &self.tdef.types[..self.tdef.pkeys])?;
                let rest = decode_row(val, &self.tdef.types[self.tdef.pkeys..])?;
                Ok(ops::build_record(&self.tdef, pk, rest))
            }
            IndexChoice::Secondary(i) => {
                let index = &self.tdef.indexes[i];
                let types: Vec<DataType> = index
                    .iter()
                    .map(|c| self.tdef.col_type(c).expect("validated index column"))
                    .collect();
                let ivals = decode_values(&key[4..], &types)?;

                let mut rec = Record::new();
                for pk_col in &self.tdef.cols[..self.tdef.pkeys] {
                    let pos = index
                        .iter()
                        .position(|c| c == pk_col)
                        .expect("index embeds the primary key");
                    rec.push(pk_col.clone(), ivals[pos].clone());
                }
                let found = ops::table_get(self.db, self.store, self.root, &self.tdef, &mut rec)?;
                ensure!(found, "index entry without a matching row");
                Ok(rec)
            }
        }
    }
}
