//! # Relational Layer
//!
//! `Database` wraps the transactional KV store with a table catalog,
//! typed records, secondary indexes and range scans. All access happens
//! through transactions:
//!
//! ```no_run
//! use strata::{Database, DataType, Record, TableDef};
//!
//! # fn demo() -> eyre::Result<()> {
//! let db = Database::open("app.db")?;
//!
//! let mut tx = db.begin_write();
//! tx.table_create(
//!     TableDef::new("users")
//!         .with_column("id", DataType::Int64)
//!         .with_column("name", DataType::Bytes),
//! )?;
//! tx.insert("users", &Record::new().with_int64("id", 1).with_str("name", "A"))?;
//! tx.commit()?;
//!
//! let reader = db.begin_read();
//! let mut rec = Record::new().with_int64("id", 1);
//! assert!(reader.get("users", &mut rec)?);
//! # Ok(())
//! # }
//! ```
//!
//! A `ReadTx` is a pinned snapshot: it keeps observing the version it
//! started from no matter how many commits land after it. A `WriteTx`
//! holds the single writer slot until `commit` or drop.
//!
//! Schema lookups go through a read-through cache shared by the whole
//! `Database`. Definitions are immutable once created, so cached entries
//! never go stale; entries cached from an uncommitted `table_create` are
//! flushed if that transaction aborts.

mod ops;
mod scan;

pub use ops::RangeResult;

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::btree::{tree_get, NodeSource};
use crate::config::SCHEMA_TABLE_PREFIX;
use crate::error::DbError;
use crate::kv::{KvReadTxn, KvStore, KvWriteTxn, WriteMode};
use crate::records::{decode_row, encode_key, DataType, Record, Value};
use crate::schema::{meta_table_def, schema_table_def, TableDef};

/// An embedded, single-file relational database.
pub struct Database {
    kv: KvStore,
    schemas: Mutex<HashMap<String, Arc<TableDef>>>,
}

impl Database {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Database {
            kv: KvStore::open(path)?,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    /// Closes the database. Equivalent to dropping it; any still-running
    /// transaction keeps the underlying store alive through its borrow.
    pub fn close(self) {}

    /// The underlying key-value store.
    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Begins a snapshot read transaction.
    pub fn begin_read(&self) -> ReadTx<'_> {
        ReadTx {
            db: self,
            txn: self.kv.begin_read(),
        }
    }

    /// Begins the write transaction, blocking while another is active.
    pub fn begin_write(&self) -> WriteTx<'_> {
        WriteTx {
            db: self,
            txn: Some(self.kv.begin_write()),
            committed: false,
            created_tables: false,
        }
    }

    /// Read-through schema lookup against the given tree view.
    pub(crate) fn table_def<S: NodeSource>(
        &self,
        store: &S,
        root: u64,
        name: &str,
    ) -> Result<Option<Arc<TableDef>>> {
        if name == "@meta" {
            return Ok(Some(Arc::new(meta_table_def())));
        }
        if name == "@table" {
            return Ok(Some(Arc::new(schema_table_def())));
        }
        if let Some(tdef) = self.schemas.lock().get(name) {
            return Ok(Some(tdef.clone()));
        }

        let key = encode_key(
            SCHEMA_TABLE_PREFIX,
            &[Value::Bytes(name.as_bytes().to_vec())],
        );
        let Some(raw) = tree_get(store, root, &key)? else {
            return Ok(None);
        };
        let vals = decode_row(&raw, &[DataType::Bytes])?;
        let def_bytes = vals[0].as_bytes().expect("def column is BYTES");
        let tdef: TableDef = serde_json::from_slice(def_bytes)
            .wrap_err_with(|| format!("corrupted definition for table '{}'", name))?;

        let tdef = Arc::new(tdef);
        self.schemas.lock().insert(name.to_string(), tdef.clone());
        Ok(Some(tdef))
    }

    fn table_def_required<S: NodeSource>(
        &self,
        store: &S,
        root: u64,
        name: &str,
    ) -> Result<Arc<TableDef>> {
        self.table_def(store, root, name)?
            .ok_or_else(|| eyre::Report::from(DbError::NotFound))
            .wrap_err_with(|| format!("table not found: {}", name))
    }

    pub(crate) fn cache_insert(&self, tdef: TableDef) {
        self.schemas
            .lock()
            .insert(tdef.name.clone(), Arc::new(tdef));
    }

    fn cache_clear(&self) {
        self.schemas.lock().clear();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.kv.path())
            .finish_non_exhaustive()
    }
}

/// A pinned snapshot of one committed version.
pub struct ReadTx<'a> {
    db: &'a Database,
    txn: KvReadTxn<'a>,
}

impl ReadTx<'_> {
    /// Looks a row up by a column prefix of the primary key or of any
    /// index. On a hit, `rec` is replaced with the full row.
    pub fn get(&self, table: &str, rec: &mut Record) -> Result<bool> {
        let tdef = self
            .db
            .table_def_required(self.txn.source(), self.txn.root(), table)?;
        ops::table_get(self.db, self.txn.source(), self.txn.root(), &tdef, rec)
    }

    /// Rows in the closed range `[start, end]` over the selected index,
    /// capped at 500 rows.
    pub fn get_range(&self, table: &str, start: &Record, end: &Record) -> Result<RangeResult> {
        let tdef = self
            .db
            .table_def_required(self.txn.source(), self.txn.root(), table)?;
        ops::table_range(self.db, self.txn.source(), self.txn.root(), &tdef, start, end)
    }

    /// Every row of the table, in primary-key order.
    pub fn scan(&self, table: &str) -> Result<Vec<Record>> {
        let tdef = self
            .db
            .table_def_required(self.txn.source(), self.txn.root(), table)?;
        ops::table_scan_all(self.txn.source(), self.txn.root(), &tdef)
    }

    /// The committed version this snapshot observes.
    pub fn version(&self) -> u64 {
        self.txn.version()
    }
}

/// The exclusive write transaction. Dropping without `commit` aborts.
pub struct WriteTx<'a> {
    db: &'a Database,
    txn: Option<KvWriteTxn<'a>>,
    committed: bool,
    created_tables: bool,
}

impl WriteTx<'_> {
    fn txn(&self) -> &KvWriteTxn<'_> {
        self.txn.as_ref().expect("transaction still open")
    }

    /// Creates a table, assigning its key-space prefixes from the catalog
    /// counter. Fails with `AlreadyExists` for duplicate names.
    pub fn table_create(&mut self, tdef: TableDef) -> Result<()> {
        let txn = self.txn.as_mut().expect("transaction still open");
        ops::table_create(self.db, txn, tdef)?;
        self.created_tables = true;
        Ok(())
    }

    /// Inserts a full row; fails with `AlreadyExists` when the primary
    /// key is taken.
    pub fn insert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write(table, rec, WriteMode::InsertOnly)
    }

    /// Replaces an existing row; fails with `NotFound` otherwise.
    pub fn update(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write(table, rec, WriteMode::UpdateOnly)
    }

    /// Inserts or replaces. Returns whether a new row was added.
    pub fn upsert(&mut self, table: &str, rec: &Record) -> Result<bool> {
        self.write(table, rec, WriteMode::Upsert)
    }

    fn write(&mut self, table: &str, rec: &Record, mode: WriteMode) -> Result<bool> {
        let tdef = {
            let txn = self.txn();
            self.db.table_def_required(txn.source(), txn.root(), table)?
        };
        let txn = self.txn.as_mut().expect("transaction still open");
        ops::table_update(txn, &tdef, rec, mode)
    }

    /// Deletes by primary key. Returns whether a row existed.
    pub fn delete(&mut self, table: &str, rec: &Record) -> Result<bool> {
        let tdef = {
            let txn = self.txn();
            self.db.table_def_required(txn.source(), txn.root(), table)?
        };
        let txn = self.txn.as_mut().expect("transaction still open");
        ops::table_delete(txn, &tdef, rec)
    }

    /// Reads through this transaction's own uncommitted view.
    pub fn get(&self, table: &str, rec: &mut Record) -> Result<bool> {
        let txn = self.txn();
        let tdef = self.db.table_def_required(txn.source(), txn.root(), table)?;
        ops::table_get(self.db, txn.source(), txn.root(), &tdef, rec)
    }

    /// Range scan through this transaction's own uncommitted view.
    pub fn get_range(&self, table: &str, start: &Record, end: &Record) -> Result<RangeResult> {
        let txn = self.txn();
        let tdef = self.db.table_def_required(txn.source(), txn.root(), table)?;
        ops::table_range(self.db, txn.source(), txn.root(), &tdef, start, end)
    }

    /// Full scan through this transaction's own uncommitted view.
    pub fn scan(&self, table: &str) -> Result<Vec<Record>> {
        let txn = self.txn();
        let tdef = self.db.table_def_required(txn.source(), txn.root(), table)?;
        ops::table_scan_all(txn.source(), txn.root(), &tdef)
    }

    /// Publishes the transaction durably.
    pub fn commit(mut self) -> Result<()> {
        let txn = self.txn.take().expect("transaction still open");
        txn.commit()?;
        self.committed = true;
        Ok(())
    }

    /// Discards the transaction.
    pub fn abort(mut self) {
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        // definitions cached from an uncommitted create must not outlive
        // the transaction
        if !self.committed && self.created_tables {
            self.db.cache_clear();
        }
    }
}
