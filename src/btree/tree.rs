//! # Copy-on-Write Tree Operations
//!
//! Lookup descends with `lookup_le` at every level; the duplicated
//! separator invariant guarantees the returned child always covers the
//! target key. Mutations rebuild the path from the leaf upward: each
//! level's updated node is appended into a scratch buffer that may exceed
//! one page, then split into at most three page-sized nodes before being
//! allocated.
//!
//! Deletion merges an updated child back into a sibling when it shrinks
//! to a quarter page and the combined node still fits. The root collapses
//! when it is an internal node left with a single child.
//!
//! A first insert into an empty tree plants a synthetic minimum entry
//! (empty key, empty value) next to the real one, so every later descent
//! finds a containing node without special cases.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use super::node::{Node, NodeType};
use super::{NodeSource, NodeStore};
use crate::config::{MAX_KEY_SIZE, MAX_VAL_SIZE, NODE_HEADER_SIZE, PAGE_SIZE};

fn check_key(key: &[u8]) -> Result<()> {
    ensure!(
        !key.is_empty() && key.len() <= MAX_KEY_SIZE,
        "key length {} outside (0, {}]",
        key.len(),
        MAX_KEY_SIZE
    );
    Ok(())
}

/// Looks up a key. Returns the value if present.
pub fn tree_get<S: NodeSource>(store: &S, root: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
    check_key(key)?;
    if root == 0 {
        return Ok(None);
    }

    let mut node = store.node(root)?;
    loop {
        let idx = node.lookup_le(key);
        match node.node_type() {
            Some(NodeType::Leaf) => {
                if node.key(idx) == key {
                    return Ok(Some(node.val(idx).to_vec()));
                }
                return Ok(None);
            }
            Some(NodeType::Internal) => {
                node = store.node(node.ptr(idx))?;
            }
            other => bail!("bad node type {:?} during lookup", other),
        }
    }
}

/// Inserts or replaces a key. Returns the new root page number.
pub fn tree_insert<S: NodeStore>(store: &mut S, root: u64, key: &[u8], val: &[u8]) -> Result<u64> {
    check_key(key)?;
    ensure!(
        val.len() <= MAX_VAL_SIZE,
        "value length {} exceeds {}",
        val.len(),
        MAX_VAL_SIZE
    );

    if root == 0 {
        // The synthetic minimum makes the leftmost node cover the whole
        // key space, so lookup_le always lands on a containing child.
        let mut first = Node::new();
        first.set_header(NodeType::Leaf, 2);
        first.append_kv(0, 0, b"", b"");
        first.append_kv(1, 0, key, val);
        return store.alloc(first);
    }

    let node = store.node(root)?;
    store.dealloc(root);
    let updated = insert_into(store, node, key, val)?;

    let mut parts = split3(updated);
    if parts.len() > 1 {
        // root split: grow the tree by one level
        let mut new_root = Node::new();
        new_root.set_header(NodeType::Internal, parts.len() as u16);
        for (i, part) in parts.drain(..).enumerate() {
            let first_key = part.key(0).to_vec();
            let ptr = store.alloc(part)?;
            new_root.append_kv(i as u16, ptr, &first_key, b"");
        }
        store.alloc(new_root)
    } else {
        store.alloc(parts.pop().expect("split3 yields at least one node"))
    }
}

/// Removes a key. Returns the new root page number, or `None` when the key
/// was absent (the tree is left untouched).
pub fn tree_delete<S: NodeStore>(store: &mut S, root: u64, key: &[u8]) -> Result<Option<u64>> {
    check_key(key)?;
    if root == 0 {
        return Ok(None);
    }

    let node = store.node(root)?;
    let Some(updated) = delete_from(store, node, key)? else {
        return Ok(None);
    };
    store.dealloc(root);

    if updated.node_type() == Some(NodeType::Internal) && updated.nkeys() == 1 {
        // the root has a single child; that child becomes the root
        return Ok(Some(updated.ptr(0)));
    }
    Ok(Some(store.alloc(updated)?))
}

fn insert_into<S: NodeStore>(store: &mut S, node: Node, key: &[u8], val: &[u8]) -> Result<Node> {
    let mut updated = Node::new_oversized();
    let idx = node.lookup_le(key);

    match node.node_type() {
        Some(NodeType::Leaf) => {
            if node.key(idx) == key {
                leaf_update(&mut updated, &node, idx, key, val);
            } else {
                leaf_insert(&mut updated, &node, idx + 1, key, val);
            }
        }
        Some(NodeType::Internal) => {
            let kptr = node.ptr(idx);
            let kid = store.node(kptr)?;
            store.dealloc(kptr);
            let kid = insert_into(store, kid, key, val)?;
            let parts = split3(kid);
            replace_kid_n(store, &mut updated, &node, idx, parts)?;
        }
        other => bail!("bad node type {:?} during insert", other),
    }
    Ok(updated)
}

fn delete_from<S: NodeStore>(store: &mut S, node: Node, key: &[u8]) -> Result<Option<Node>> {
    let idx = node.lookup_le(key);

    match node.node_type() {
        Some(NodeType::Leaf) => {
            if node.key(idx) != key {
                return Ok(None);
            }
            let mut updated = Node::new();
            leaf_delete(&mut updated, &node, idx);
            Ok(Some(updated))
        }
        Some(NodeType::Internal) => delete_from_internal(store, node, idx, key),
        other => bail!("bad node type {:?} during delete", other),
    }
}

fn delete_from_internal<S: NodeStore>(
    store: &mut S,
    node: Node,
    idx: u16,
    key: &[u8],
) -> Result<Option<Node>> {
    let kptr = node.ptr(idx);
    let kid = store.node(kptr)?;
    let Some(updated) = delete_from(store, kid, key)? else {
        return Ok(None);
    };
    store.dealloc(kptr);

    let mut new = Node::new();
    match sibling_merge(store, &node, idx, &updated)? {
        Merge::Left(sibling) => {
            let merged = merge_nodes(&sibling, &updated);
            store.dealloc(node.ptr(idx - 1));
            let first_key = merged.key(0).to_vec();
            let ptr = store.alloc(merged)?;
            replace_2kid(&mut new, &node, idx - 1, ptr, &first_key);
        }
        Merge::Right(sibling) => {
            let merged = merge_nodes(&updated, &sibling);
            store.dealloc(node.ptr(idx + 1));
            let first_key = merged.key(0).to_vec();
            let ptr = store.alloc(merged)?;
            replace_2kid(&mut new, &node, idx, ptr, &first_key);
        }
        Merge::None => {
            if updated.nkeys() == 0 {
                // the kid emptied out with no sibling to absorb it; this
                // only happens when the parent has that single child
                debug_assert!(node.nkeys() == 1 && idx == 0);
                new.set_header(NodeType::Internal, 0);
            } else {
                let parts: SmallVec<[Node; 3]> = smallvec::smallvec![updated];
                replace_kid_n(store, &mut new, &node, idx, parts)?;
            }
        }
    }
    Ok(Some(new))
}

enum Merge {
    None,
    Left(Node),
    Right(Node),
}

/// A child that shrank to a quarter page is merged back into a sibling if
/// the combined node still fits in one page.
fn sibling_merge<S: NodeSource>(
    store: &S,
    parent: &Node,
    idx: u16,
    updated: &Node,
) -> Result<Merge> {
    if updated.nbytes() > PAGE_SIZE / 4 {
        return Ok(Merge::None);
    }

    if idx > 0 {
        let sibling = store.node(parent.ptr(idx - 1))?;
        let merged = sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE;
        if merged <= PAGE_SIZE {
            return Ok(Merge::Left(sibling));
        }
    }
    if idx + 1 < parent.nkeys() {
        let sibling = store.node(parent.ptr(idx + 1))?;
        let merged = sibling.nbytes() + updated.nbytes() - NODE_HEADER_SIZE;
        if merged <= PAGE_SIZE {
            return Ok(Merge::Right(sibling));
        }
    }
    Ok(Merge::None)
}

fn merge_nodes(left: &Node, right: &Node) -> Node {
    let mut merged = Node::new();
    merged.set_header(
        left.node_type().expect("merging a typed node"),
        left.nkeys() + right.nkeys(),
    );
    merged.append_range(left, 0, 0, left.nkeys());
    merged.append_range(right, left.nkeys(), 0, right.nkeys());
    merged
}

/// Replaces the child at `idx` with one to three freshly allocated kids,
/// re-deriving the separators from each kid's first key.
fn replace_kid_n<S: NodeStore>(
    store: &mut S,
    new: &mut Node,
    old: &Node,
    idx: u16,
    kids: SmallVec<[Node; 3]>,
) -> Result<()> {
    let inc = kids.len() as u16;
    new.set_header(NodeType::Internal, old.nkeys() + inc - 1);
    new.append_range(old, 0, 0, idx);
    for (i, kid) in kids.into_iter().enumerate() {
        let first_key = kid.key(0).to_vec();
        let ptr = store.alloc(kid)?;
        new.append_kv(idx + i as u16, ptr, &first_key, b"");
    }
    new.append_range(old, idx + inc, idx + 1, old.nkeys() - (idx + 1));
    Ok(())
}

/// Replaces the two children at `idx` and `idx + 1` with one merged kid.
fn replace_2kid(new: &mut Node, old: &Node, idx: u16, ptr: u64, key: &[u8]) {
    new.set_header(NodeType::Internal, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, ptr, key, b"");
    new.append_range(old, idx + 1, idx + 2, old.nkeys() - (idx + 2));
}

fn leaf_insert(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys() + 1);
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx, old.nkeys() - idx);
}

fn leaf_update(new: &mut Node, old: &Node, idx: u16, key: &[u8], val: &[u8]) {
    new.set_header(NodeType::Leaf, old.nkeys());
    new.append_range(old, 0, 0, idx);
    new.append_kv(idx, 0, key, val);
    new.append_range(old, idx + 1, idx + 1, old.nkeys() - idx - 1);
}

fn leaf_delete(new: &mut Node, old: &Node, idx: u16) {
    new.set_header(NodeType::Leaf, old.nkeys() - 1);
    new.append_range(old, 0, 0, idx);
    new.append_range(old, idx, idx + 1, old.nkeys() - (idx + 1));
}

/// Encoded size of the half-open pair range `[from, to)` as its own node.
fn range_size(node: &Node, from: u16, to: u16) -> usize {
    NODE_HEADER_SIZE
        + 10 * (to - from) as usize
        + (node.offset(to) as usize - node.offset(from) as usize)
}

/// Splits an overgrown node in two. The right half is guaranteed to fit a
/// page; the left half may still be oversized and is split again by
/// `split3`.
fn split2(old: &Node) -> (Node, Node) {
    let n = old.nkeys();
    debug_assert!(n >= 2);

    let mut mid = n / 2;
    while mid + 1 < n && range_size(old, mid, n) > PAGE_SIZE {
        mid += 1;
    }

    let ntype = old.node_type().expect("splitting a typed node");
    let mut left = Node::new_oversized();
    left.set_header(ntype, mid);
    left.append_range(old, 0, 0, mid);

    let mut right = Node::new();
    right.set_header(ntype, n - mid);
    right.append_range(old, 0, mid, n - mid);

    (left, right)
}

/// Splits a node into one, two or three page-sized nodes. Nodes may
/// balloon to twice the page size during an edit, which three pages always
/// absorb given the key and value limits.
fn split3(node: Node) -> SmallVec<[Node; 3]> {
    if node.nbytes() <= PAGE_SIZE {
        return smallvec::smallvec![node];
    }
    let (left, right) = split2(&node);
    if left.nbytes() <= PAGE_SIZE {
        return smallvec::smallvec![left, right];
    }
    let (leftleft, middle) = split2(&left);
    debug_assert!(leftleft.nbytes() <= PAGE_SIZE);
    debug_assert!(middle.nbytes() <= PAGE_SIZE);
    smallvec::smallvec![leftleft, middle, right]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    /// In-memory page store for exercising the tree without a file.
    #[derive(Default)]
    struct MemStore {
        pages: HashMap<u64, Box<[u8]>>,
        next: u64,
        freed: Vec<u64>,
    }

    impl MemStore {
        fn new() -> Self {
            MemStore {
                pages: HashMap::new(),
                next: 1,
                freed: Vec::new(),
            }
        }
    }

    impl NodeSource for MemStore {
        fn node(&self, ptr: u64) -> Result<Node> {
            Ok(Node::from_bytes(self.pages.get(&ptr).expect("live page")))
        }
    }

    impl NodeStore for MemStore {
        fn alloc(&mut self, node: Node) -> Result<u64> {
            let ptr = self.next;
            self.next += 1;
            self.pages.insert(ptr, node.into_page());
            Ok(ptr)
        }

        fn dealloc(&mut self, ptr: u64) {
            self.pages.remove(&ptr);
            self.freed.push(ptr);
        }
    }

    fn collect_in_order(store: &MemStore, root: u64) -> Vec<(Vec<u8>, Vec<u8>)> {
        fn walk(store: &MemStore, ptr: u64, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
            let node = store.node(ptr).unwrap();
            match node.node_type().unwrap() {
                NodeType::Leaf => {
                    for i in 0..node.nkeys() {
                        if !node.key(i).is_empty() {
                            out.push((node.key(i).to_vec(), node.val(i).to_vec()));
                        }
                    }
                }
                NodeType::Internal => {
                    for i in 0..node.nkeys() {
                        walk(store, node.ptr(i), out);
                    }
                }
                NodeType::FreeList => panic!("free-list page in the tree"),
            }
        }
        let mut out = Vec::new();
        if root != 0 {
            walk(store, root, &mut out);
        }
        out
    }

    fn check_invariants(store: &MemStore, root: u64) {
        fn walk(store: &MemStore, ptr: u64, expect_first: Option<&[u8]>) {
            let node = store.node(ptr).unwrap();
            assert!(node.nbytes() <= PAGE_SIZE, "node exceeds one page");
            for i in 1..node.nkeys() {
                assert!(node.key(i - 1) < node.key(i), "keys not strictly increasing");
            }
            if let Some(first) = expect_first {
                assert_eq!(node.key(0), first, "first key != parent separator");
            }
            if node.node_type() == Some(NodeType::Internal) {
                for i in 0..node.nkeys() {
                    walk(store, node.ptr(i), Some(node.key(i)));
                }
            }
        }
        if root != 0 {
            walk(store, root, None);
        }
    }

    #[test]
    fn first_insert_plants_synthetic_minimum() {
        let mut store = MemStore::new();
        let root = tree_insert(&mut store, 0, b"hello", b"world").unwrap();

        let node = store.node(root).unwrap();
        assert_eq!(node.nkeys(), 2);
        assert_eq!(node.key(0), b"");
        assert_eq!(node.key(1), b"hello");
    }

    #[test]
    fn get_returns_last_inserted_value() {
        let mut store = MemStore::new();
        let mut root = tree_insert(&mut store, 0, b"k", b"v1").unwrap();
        root = tree_insert(&mut store, root, b"k", b"v2").unwrap();

        assert_eq!(tree_get(&store, root, b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tree_get(&store, root, b"absent").unwrap(), None);
    }

    #[test]
    fn rejects_invalid_key_and_value_sizes() {
        let mut store = MemStore::new();

        assert!(tree_insert(&mut store, 0, b"", b"v").is_err());
        assert!(tree_insert(&mut store, 0, &[0u8; MAX_KEY_SIZE + 1], b"v").is_err());
        assert!(tree_insert(&mut store, 0, b"k", &[0u8; MAX_VAL_SIZE + 1]).is_err());
    }

    #[test]
    fn inserts_split_into_multiple_levels() {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in 0..1000u32 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            root = tree_insert(&mut store, root, key.as_bytes(), val.as_bytes()).unwrap();
        }

        check_invariants(&store, root);
        for i in 0..1000u32 {
            let key = format!("key{:05}", i);
            let expected = format!("val{:05}", i);
            assert_eq!(
                tree_get(&store, root, key.as_bytes()).unwrap(),
                Some(expected.into_bytes()),
                "missing {}",
                key
            );
        }
    }

    #[test]
    fn reverse_insertion_keeps_sorted_order() {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in (0..500u32).rev() {
            let key = format!("key{:05}", i);
            root = tree_insert(&mut store, root, key.as_bytes(), b"x").unwrap();
        }

        let pairs = collect_in_order(&store, root);
        let mut sorted = pairs.clone();
        sorted.sort();
        assert_eq!(pairs, sorted);
        assert_eq!(pairs.len(), 500);
    }

    #[test]
    fn large_values_split_without_loss() {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in 0..50u32 {
            let key = format!("big{:03}", i);
            let val = vec![i as u8; MAX_VAL_SIZE];
            root = tree_insert(&mut store, root, key.as_bytes(), &val).unwrap();
        }

        check_invariants(&store, root);
        for i in 0..50u32 {
            let key = format!("big{:03}", i);
            let got = tree_get(&store, root, key.as_bytes()).unwrap().unwrap();
            assert_eq!(got.len(), MAX_VAL_SIZE);
            assert!(got.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn delete_absent_key_leaves_tree_untouched() {
        let mut store = MemStore::new();
        let root = tree_insert(&mut store, 0, b"k", b"v").unwrap();

        assert_eq!(tree_delete(&mut store, root, b"nope").unwrap(), None);
        assert_eq!(tree_get(&store, root, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn interleaved_deletes_match_surviving_set() {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in 0..600u32 {
            let key = format!("key{:05}", i);
            root = tree_insert(&mut store, root, key.as_bytes(), b"v").unwrap();
        }
        for i in (0..600u32).step_by(2) {
            let key = format!("key{:05}", i);
            root = tree_delete(&mut store, root, key.as_bytes())
                .unwrap()
                .expect("key present");
        }

        check_invariants(&store, root);
        let pairs = collect_in_order(&store, root);
        let expected: Vec<Vec<u8>> = (0..600u32)
            .filter(|i| i % 2 == 1)
            .map(|i| format!("key{:05}", i).into_bytes())
            .collect();
        let got: Vec<Vec<u8>> = pairs.into_iter().map(|(k, _)| k).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn root_collapses_after_mass_deletion() {
        let mut store = MemStore::new();
        let mut root = 0;
        for i in 0..800u32 {
            let key = format!("key{:05}", i);
            root = tree_insert(&mut store, root, key.as_bytes(), b"v").unwrap();
        }
        for i in 0..799u32 {
            let key = format!("key{:05}", i);
            root = tree_delete(&mut store, root, key.as_bytes())
                .unwrap()
                .expect("key present");
        }

        check_invariants(&store, root);
        let node = store.node(root).unwrap();
        assert_eq!(node.node_type(), Some(NodeType::Leaf));
        assert_eq!(
            tree_get(&store, root, b"key00799").unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn copy_on_write_frees_replaced_pages() {
        let mut store = MemStore::new();
        let root1 = tree_insert(&mut store, 0, b"a", b"1").unwrap();
        let root2 = tree_insert(&mut store, root1, b"b", b"2").unwrap();

        assert_ne!(root1, root2);
        assert!(store.freed.contains(&root1));
    }
}
