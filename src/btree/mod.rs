//! # Copy-on-Write B+Tree
//!
//! Ordered byte-key/byte-value storage over fixed-size pages. Mutations
//! never touch existing pages: every updated node is written to a freshly
//! allocated page and the pages along the old path are handed back for
//! deferred reuse. Readers pinned to an old root keep a consistent view
//! for as long as they hold it.
//!
//! The tree does not talk to storage directly. It runs against the two
//! traits below, which a transaction implements with its dirty-page map,
//! free-list allocation and mmap fallthrough.
//!
//! ## Module Organization
//!
//! - `node`: codec for one node within one page
//! - `tree`: copy-on-write lookup, insert (with 3-way split) and delete
//!   (with quarter-page merge)
//! - `iter`: ordered iteration and comparison-directed seeks

mod iter;
mod node;
mod tree;

pub use iter::{Cmp, TreeIter};
pub use node::{Node, NodeType};
pub use tree::{tree_delete, tree_get, tree_insert};

use eyre::Result;

/// Read-only page access for tree descent and iteration.
pub trait NodeSource {
    /// Dereferences a page number into a node.
    fn node(&self, ptr: u64) -> Result<Node>;
}

/// Page lifecycle hooks for copy-on-write mutation.
pub trait NodeStore: NodeSource {
    /// Writes a node to a newly allocated page and returns its number.
    fn alloc(&mut self, node: Node) -> Result<u64>;

    /// Queues a page for deferred reuse once no snapshot can reach it.
    fn dealloc(&mut self, ptr: u64);
}
