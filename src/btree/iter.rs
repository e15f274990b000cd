//! # Ordered Iteration
//!
//! `TreeIter` materializes a root-to-leaf path (owned node copies plus a
//! position per level), so it stays valid for the lifetime of the snapshot
//! it was created from. `seek_le` lands on the largest key <= the target;
//! `seek` then nudges the cursor by one step to satisfy the requested
//! comparison.
//!
//! Advancing carries to shallower levels when a node is exhausted and
//! rebuilds the descent below the level that moved. An advance past either
//! end invalidates the iterator permanently.

use eyre::{bail, Result};
use smallvec::SmallVec;

use super::node::{Node, NodeType};
use super::NodeSource;

/// Comparison operators for `seek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// First entry >= key.
    Ge,
    /// First entry > key.
    Gt,
    /// Last entry < key.
    Lt,
    /// Last entry <= key.
    Le,
}

impl Cmp {
    /// True when the comparison selects keys above the reference point.
    pub fn is_forward(self) -> bool {
        matches!(self, Cmp::Ge | Cmp::Gt)
    }

    /// True when a partial key should be padded to its maximum, so the
    /// bound covers every completion of the given columns.
    pub fn pads_to_max(self) -> bool {
        matches!(self, Cmp::Gt | Cmp::Le)
    }

    /// Whether `key` satisfies the comparison against `reference`.
    pub fn matches(self, key: &[u8], reference: &[u8]) -> bool {
        match self {
            Cmp::Ge => key >= reference,
            Cmp::Gt => key > reference,
            Cmp::Lt => key < reference,
            Cmp::Le => key <= reference,
        }
    }
}

/// Cursor over the tree, pinned to one root.
pub struct TreeIter<'a, S: NodeSource> {
    store: &'a S,
    path: SmallVec<[Node; 8]>,
    pos: SmallVec<[u16; 8]>,
}

impl<'a, S: NodeSource> TreeIter<'a, S> {
    /// Descends to the largest entry whose key is <= `key`. On an empty
    /// tree the iterator starts out invalid.
    pub fn seek_le(store: &'a S, root: u64, key: &[u8]) -> Result<Self> {
        let mut iter = TreeIter {
            store,
            path: SmallVec::new(),
            pos: SmallVec::new(),
        };

        let mut ptr = root;
        while ptr != 0 {
            let node = store.node(ptr)?;
            let idx = node.lookup_le(key);
            ptr = match node.node_type() {
                Some(NodeType::Internal) => node.ptr(idx),
                Some(NodeType::Leaf) => 0,
                other => bail!("bad node type {:?} during seek", other),
            };
            iter.path.push(node);
            iter.pos.push(idx);
        }
        Ok(iter)
    }

    /// Positions the cursor at the boundary entry selected by `cmp`.
    pub fn seek(store: &'a S, root: u64, key: &[u8], cmp: Cmp) -> Result<Self> {
        let mut iter = Self::seek_le(store, root, key)?;
        if cmp != Cmp::Le && iter.valid() {
            let satisfied = {
                let (current, _) = iter.deref();
                cmp.matches(current, key)
            };
            if !satisfied {
                if cmp.is_forward() {
                    iter.next()?;
                } else {
                    iter.prev()?;
                }
            }
        }
        Ok(iter)
    }

    /// Whether the cursor points at an entry.
    pub fn valid(&self) -> bool {
        match (self.path.last(), self.pos.last()) {
            (Some(leaf), Some(&pos)) => pos < leaf.nkeys(),
            _ => false,
        }
    }

    /// The entry under the cursor. Callers must check `valid` first.
    pub fn deref(&self) -> (&[u8], &[u8]) {
        let leaf = self.path.last().expect("deref on a valid iterator");
        let pos = *self.pos.last().expect("deref on a valid iterator");
        (leaf.key(pos), leaf.val(pos))
    }

    /// Moves to the next entry in key order.
    pub fn next(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let deepest = self.path.len() - 1;
        if !self.advance(deepest)? {
            self.path.clear();
            self.pos.clear();
        }
        Ok(())
    }

    /// Moves to the previous entry in key order.
    pub fn prev(&mut self) -> Result<()> {
        if !self.valid() {
            return Ok(());
        }
        let deepest = self.path.len() - 1;
        if !self.retreat(deepest)? {
            self.path.clear();
            self.pos.clear();
        }
        Ok(())
    }

    fn advance(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] + 1 < self.path[level].nkeys() {
            self.pos[level] += 1;
        } else if level > 0 {
            // this node is exhausted; carry into the parent first
            if !self.advance(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        if level + 1 < self.pos.len() {
            let kid = self.store.node(self.path[level].ptr(self.pos[level]))?;
            self.pos[level + 1] = 0;
            self.path[level + 1] = kid;
        }
        Ok(true)
    }

    fn retreat(&mut self, level: usize) -> Result<bool> {
        if self.pos[level] > 0 {
            self.pos[level] -= 1;
        } else if level > 0 {
            if !self.retreat(level - 1)? {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }

        if level + 1 < self.pos.len() {
            let kid = self.store.node(self.path[level].ptr(self.pos[level]))?;
            self.pos[level + 1] = kid.nkeys() - 1;
            self.path[level + 1] = kid;
        }
        Ok(true)
    }
}
