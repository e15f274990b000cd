//! # Strata - Single-File Embedded Relational Storage
//!
//! Strata persists user-defined tables in one file of fixed 4 KiB pages,
//! organized as a copy-on-write B+tree over an ordered byte keyspace,
//! with transactional reads and writes under multi-version snapshot
//! isolation: one writer at a time, any number of concurrent readers.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------+
//! |      Public API (Database, Read/WriteTx)   |
//! +--------------------------------------------+
//! |  Table ops, secondary indexes, scanners    |
//! +---------------------+----------------------+
//! |  Schema catalog     |  Record codec        |
//! +---------------------+----------------------+
//! |  KV transactions (MVCC, free list)         |
//! +--------------------------------------------+
//! |  Copy-on-write B+tree                      |
//! +--------------------------------------------+
//! |  Master page | mmap chunk list | one file  |
//! +--------------------------------------------+
//! ```
//!
//! ## Durability
//!
//! There is no write-ahead log. A commit writes its pages through the
//! mapping, fsyncs, then atomically switches the 64-byte master page with
//! a positional write and fsyncs again. Whichever master survives a crash
//! names a complete, durable version of the database.
//!
//! ## Concurrency
//!
//! Readers register their snapshot version and keep reading it until they
//! drop, while the writer commits new versions alongside. Freed pages are
//! version-tagged and only reused once the oldest registered reader is
//! strictly past the freeing version.
//!
//! ## Module Overview
//!
//! - [`storage`]: mmap chunk list and the master-page codec
//! - [`btree`]: node codec, copy-on-write tree, ordered iteration
//! - [`kv`]: transactions, the versioned free list, commit protocol
//! - [`records`]: typed values with order-preserving encodings
//! - [`schema`]: table definitions and catalog plumbing
//! - [`db`]: the relational layer tying it all together

pub mod btree;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod records;
pub mod schema;
pub mod storage;

pub use btree::Cmp;
pub use db::{Database, RangeResult, ReadTx, WriteTx};
pub use error::DbError;
pub use kv::{KvStore, WriteMode};
pub use records::{DataType, Record, Value};
pub use schema::TableDef;
