//! # Transactional Key-Value Layer
//!
//! Binds the copy-on-write tree, the versioned free list and the mmap
//! chunk list into begin/commit/abort semantics with two-fsync durability
//! and snapshot-isolated readers.

mod freelist;
mod store;
mod txn;

pub use store::KvStore;
pub use txn::{KvReadTxn, KvWriteTxn, Snapshot, TxPages, WriteMode, WriteRequest};
