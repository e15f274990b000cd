//! # Table Schemas and the Catalog
//!
//! A table definition names its columns, their types, the single primary
//! key column and any secondary indexes, plus the key-space prefixes
//! assigned at creation time. Definitions are serialized as JSON into the
//! `@table` catalog table; the `next_prefix` counter lives in `@meta`.
//!
//! Both catalog tables are built in: they always exist, their prefixes
//! (1 and 2) are reserved, and they are themselves plain tables of two
//! `BYTES` columns keyed by the first.
//!
//! ## Validation
//!
//! Creation rejects: an empty name, no columns, a column/type count
//! mismatch, empty or duplicate column names, a primary-key column count
//! other than one, and indexes naming unknown columns. Indexes are
//! completed with the primary-key columns they do not already contain; a
//! completed index must still be shorter than the full column list.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::config::{META_TABLE_PREFIX, SCHEMA_TABLE_PREFIX};
use crate::error::DbError;
use crate::records::{DataType, Record, Value};

/// A table definition, as persisted in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// Column types, by position.
    pub types: Vec<DataType>,
    /// Column names, by position.
    pub cols: Vec<String>,
    /// The first `pkeys` columns form the primary key. Always 1.
    pub pkeys: usize,
    /// Secondary indexes, each a list of column names. Completed with the
    /// primary-key columns during validation.
    pub indexes: Vec<Vec<String>>,
    /// Key-space prefix of the primary rows.
    #[serde(default)]
    pub prefix: u32,
    /// Key-space prefix per secondary index.
    #[serde(default)]
    pub index_prefixes: Vec<u32>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        TableDef {
            name: name.into(),
            types: Vec::new(),
            cols: Vec::new(),
            pkeys: 1,
            indexes: Vec::new(),
            prefix: 0,
            index_prefixes: Vec::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, dtype: DataType) -> Self {
        self.cols.push(name.into());
        self.types.push(dtype);
        self
    }

    pub fn with_index(mut self, cols: &[&str]) -> Self {
        self.indexes.push(cols.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn col_index(&self, col: &str) -> Option<usize> {
        self.cols.iter().position(|c| c == col)
    }

    pub fn col_type(&self, col: &str) -> Option<DataType> {
        self.col_index(col).map(|i| self.types[i])
    }
}

/// The `@meta` catalog table: engine counters, keyed by name.
pub fn meta_table_def() -> TableDef {
    TableDef {
        name: "@meta".to_string(),
        types: vec![DataType::Bytes, DataType::Bytes],
        cols: vec!["key".to_string(), "val".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: META_TABLE_PREFIX,
        index_prefixes: Vec::new(),
    }
}

/// The `@table` catalog table: serialized definitions, keyed by name.
pub fn schema_table_def() -> TableDef {
    TableDef {
        name: "@table".to_string(),
        types: vec![DataType::Bytes, DataType::Bytes],
        cols: vec!["name".to_string(), "def".to_string()],
        pkeys: 1,
        indexes: Vec::new(),
        prefix: SCHEMA_TABLE_PREFIX,
        index_prefixes: Vec::new(),
    }
}

fn schema_err(msg: impl Into<String>) -> eyre::Report {
    DbError::Schema(msg.into()).into()
}

/// Validates a definition and completes its indexes with the missing
/// primary-key columns. Prefix assignment happens separately, against the
/// `@meta` counter.
pub fn validate_table_def(tdef: &mut TableDef) -> Result<()> {
    if tdef.name.is_empty() {
        return Err(schema_err("table name cannot be empty"));
    }
    if tdef.cols.is_empty() {
        return Err(schema_err("table must have at least one column"));
    }
    if tdef.cols.len() != tdef.types.len() {
        return Err(schema_err("column and type counts do not match"));
    }

    let mut seen = hashbrown::HashSet::new();
    for col in &tdef.cols {
        if col.is_empty() {
            return Err(schema_err("column name cannot be empty"));
        }
        if !seen.insert(col.as_str()) {
            return Err(schema_err(format!("duplicate column name: {}", col)));
        }
    }

    if tdef.pkeys != 1 {
        return Err(schema_err("exactly one primary key column is required"));
    }

    for index in &mut tdef.indexes {
        for col in index.iter() {
            if !tdef.cols.contains(col) {
                return Err(schema_err(format!("invalid index column: {}", col)));
            }
        }
        // complete the index with the primary-key columns it lacks, so
        // every index entry maps back to exactly one row
        for pk_col in &tdef.cols[..tdef.pkeys] {
            if !index.contains(pk_col) {
                index.push(pk_col.clone());
            }
        }
        if index.len() >= tdef.cols.len() {
            return Err(schema_err("index must be shorter than the column list"));
        }
    }
    Ok(())
}

/// Which keyspace serves a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChoice {
    Primary,
    Secondary(usize),
}

fn is_prefix(long: &[String], short: &[String]) -> bool {
    long.len() >= short.len() && long.iter().zip(short).all(|(a, b)| a == b)
}

/// Selects the keyspace whose column list starts with exactly the given
/// columns: the primary key when it matches, else the shortest matching
/// secondary index.
pub fn find_index(tdef: &TableDef, cols: &[String]) -> Result<IndexChoice> {
    if is_prefix(&tdef.cols[..tdef.pkeys], cols) {
        return Ok(IndexChoice::Primary);
    }

    let mut winner: Option<usize> = None;
    for (i, index) in tdef.indexes.iter().enumerate() {
        if !is_prefix(index, cols) {
            continue;
        }
        if winner.is_none_or(|w| index.len() < tdef.indexes[w].len()) {
            winner = Some(i);
        }
    }
    winner
        .map(IndexChoice::Secondary)
        .ok_or_else(|| eyre::Report::from(DbError::NoIndex))
}

/// Reorders the first `n` schema columns out of `rec`, validating every
/// provided column strictly against its schema type.
pub fn ordered_values(tdef: &TableDef, rec: &Record, n: usize) -> Result<Vec<Value>> {
    for (col, val) in rec.cols().iter().zip(rec.vals()) {
        let Some(expected) = tdef.col_type(col) else {
            return Err(schema_err(format!(
                "unknown column '{}' for table {}",
                col, tdef.name
            )));
        };
        if val.data_type() != expected {
            return Err(DbError::TypeMismatch { column: col.clone() })
                .wrap_err_with(|| format!("expected {}", expected.name()));
        }
    }

    let mut out = Vec::with_capacity(n);
    for col in &tdef.cols[..n] {
        let Some(val) = rec.get(col) else {
            return Err(schema_err(format!("missing column: {}", col)));
        };
        out.push(val.clone());
    }
    Ok(out)
}
