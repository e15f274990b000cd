//! # Transactions
//!
//! One writer, many readers. A read transaction is a registered snapshot:
//! the root, version and chunk list captured under the metadata mutex. A
//! write transaction owns the writer lock and stages every page it touches
//! in an in-memory dirty map; nothing reaches the file before commit.
//!
//! ## Commit Protocol
//!
//! 1. If the root never moved, there is nothing to publish; release.
//! 2. Rewrite the free list (newly freed pages join it, consumed items
//!    leave it), extend the file and mapping as needed, and copy every
//!    dirty page into place.
//! 3. `fsync`. The data must be durable before the master page names it.
//! 4. Publish root, version, free-list head and page count under the
//!    metadata mutex. New readers see the commit from here on.
//! 5. Write the master page positionally and `fsync` again.
//!
//! A failure before step 4 leaves no published state: the dirty map is
//! dropped and the file still carries the previous master, so recovery
//! sees the old version. A failure after step 4 leaves the in-process
//! state ahead of the durable master; the next successful commit
//! reconverges them.

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::MutexGuard;
use tracing::debug;

use super::freelist::{version_before, FreeCache, FreeNode, TxFreeList};
use super::store::KvStore;
use crate::btree::{tree_delete, tree_get, tree_insert, Cmp, Node, NodeSource, NodeStore, TreeIter};
use crate::config::FREE_LIST_CAP;
use crate::error::DbError;
use crate::storage::{mapped_page, write_mapped_page, Chunk};

/// Existence policy for [`KvWriteTxn::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Insert or replace.
    Upsert,
    /// Fail with `NotFound` when the key is absent.
    UpdateOnly,
    /// Fail with `AlreadyExists` when the key is present.
    InsertOnly,
}

/// A mode-aware write with its outcome.
#[derive(Debug)]
pub struct WriteRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub mode: WriteMode,
    /// A new key was added.
    pub added: bool,
    /// The key was written (added or replaced).
    pub updated: bool,
    /// The previous value, when one existed.
    pub old: Option<Vec<u8>>,
}

impl WriteRequest {
    pub fn new(key: Vec<u8>, value: Vec<u8>, mode: WriteMode) -> Self {
        WriteRequest {
            key,
            value,
            mode,
            added: false,
            updated: false,
            old: None,
        }
    }
}

/// A reader's captured view of one committed version.
pub struct Snapshot {
    pub(crate) chunks: Vec<Arc<Chunk>>,
    pub(crate) root: u64,
    pub(crate) version: u64,
}

impl NodeSource for Snapshot {
    fn node(&self, ptr: u64) -> Result<Node> {
        Ok(Node::from_bytes(mapped_page(&self.chunks, ptr)?))
    }
}

/// Snapshot read transaction. Deregisters itself on drop.
pub struct KvReadTxn<'a> {
    kv: &'a KvStore,
    snap: Snapshot,
}

impl<'a> KvReadTxn<'a> {
    pub(crate) fn new(kv: &'a KvStore, snap: Snapshot) -> Self {
        KvReadTxn { kv, snap }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree_get(&self.snap, self.snap.root, key)
    }

    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, Snapshot>> {
        TreeIter::seek(&self.snap, self.snap.root, key, cmp)
    }

    pub fn version(&self) -> u64 {
        self.snap.version
    }

    pub(crate) fn source(&self) -> &Snapshot {
        &self.snap
    }

    pub(crate) fn root(&self) -> u64 {
        self.snap.root
    }
}

impl Drop for KvReadTxn<'_> {
    fn drop(&mut self) {
        self.kv.end_read(self.snap.version);
    }
}

/// The writer's page layer: dirty map over the mapped snapshot, plus the
/// transaction's free-list state.
pub struct TxPages {
    pub(crate) chunks: Vec<Arc<Chunk>>,
    /// Durable page count at begin; appends start here.
    pub(crate) flushed: u64,
    /// Pages appended by this transaction.
    pub(crate) nappend: u64,
    /// Staged pages: `Some` is a pending write, `None` a pending free.
    pub(crate) updates: HashMap<u64, Option<Box<[u8]>>>,
    pub(crate) free: TxFreeList,
}

impl TxPages {
    fn page_bytes(&self, ptr: u64) -> Result<&[u8]> {
        match self.updates.get(&ptr) {
            Some(Some(data)) => Ok(data),
            Some(None) => bail!("read of page {} freed by this transaction", ptr),
            None => mapped_page(&self.chunks, ptr),
        }
    }

    fn page_reserve(&mut self) -> u64 {
        let ptr = self.flushed + self.nappend;
        self.nappend += 1;
        ptr
    }

    fn free_load(&mut self) -> Result<()> {
        if self.free.cache.is_some() {
            return Ok(());
        }
        let mut nodes = Vec::new();
        let mut total = 0u64;
        let mut cur = self.free.head;
        while cur != 0 {
            let node = FreeNode::from_bytes(self.page_bytes(cur)?)?;
            if cur == self.free.head {
                total = node.total();
            }
            nodes.push(cur);
            cur = node.next();
        }
        self.free.cache = Some(FreeCache {
            nodes,
            node_idx: 0,
            offset: 0,
            total,
            popped: false,
        });
        Ok(())
    }

    /// Pops a reusable page number, or 0 when none is version-safe. Items
    /// are consumed front-first; the front holds the oldest versions, so
    /// an unsafe front means nothing behind it is safe either.
    fn free_pop(&mut self) -> Result<u64> {
        if self.free.cache.is_none() {
            if self.free.head == 0 {
                return Ok(0);
            }
            self.free_load()?;
        }
        loop {
            let cache = self.free.cache.as_ref().expect("cache loaded above");
            if cache.total == 0 || cache.node_idx >= cache.nodes.len() {
                return Ok(0);
            }
            let node_page = cache.nodes[cache.node_idx];
            let offset = cache.offset;
            let node = FreeNode::from_bytes(self.page_bytes(node_page)?)?;
            if offset >= node.size() {
                let cache = self.free.cache.as_mut().expect("cache loaded above");
                cache.node_idx += 1;
                cache.offset = 0;
                continue;
            }
            let (ptr, ver) = node.item(offset);
            if !version_before(ver, self.free.min_reader) {
                return Ok(0);
            }
            let cache = self.free.cache.as_mut().expect("cache loaded above");
            cache.offset += 1;
            cache.total -= 1;
            cache.popped = true;
            return Ok(ptr);
        }
    }

    /// Rewrites the free list for commit: surviving items plus the pages
    /// freed by this transaction, with the old chain nodes re-freed as
    /// items of this commit. Pages for the new chain come from
    /// version-safe items first, else from fresh appends.
    fn free_rebuild(&mut self, freed_now: Vec<u64>) -> Result<()> {
        let popped = self.free.cache.as_ref().is_some_and(|c| c.popped);
        if freed_now.is_empty() && !popped {
            return Ok(());
        }
        if self.free.cache.is_none() && self.free.head != 0 {
            self.free_load()?;
        }

        let mut items: VecDeque<(u64, u64)> = VecDeque::new();
        let mut old_nodes: Vec<u64> = Vec::new();
        if let Some(cache) = self.free.cache.take() {
            for (i, &npage) in cache.nodes.iter().enumerate() {
                if i < cache.node_idx {
                    continue;
                }
                let node = FreeNode::from_bytes(self.page_bytes(npage)?)?;
                let start = if i == cache.node_idx { cache.offset } else { 0 };
                for j in start..node.size() {
                    items.push_back(node.item(j));
                }
            }
            old_nodes = cache.nodes;
        }

        let ver = self.free.version;
        for ptr in freed_now {
            items.push_back((ptr, ver));
        }
        for &ptr in &old_nodes {
            items.push_back((ptr, ver));
        }

        let mut chain: Vec<u64> = Vec::new();
        loop {
            let need = items.len().div_ceil(FREE_LIST_CAP);
            if chain.len() >= need {
                break;
            }
            let reusable = items
                .front()
                .is_some_and(|&(_, v)| version_before(v, self.free.min_reader));
            let page = if reusable {
                items.pop_front().expect("front checked above").0
            } else {
                self.page_reserve()
            };
            chain.push(page);
        }

        let total = items.len() as u64;
        let mut remaining = items.into_iter();
        for (i, &page) in chain.iter().enumerate() {
            let next = chain.get(i + 1).copied().unwrap_or(0);
            let mut node = FreeNode::new(next);
            for _ in 0..FREE_LIST_CAP {
                match remaining.next() {
                    Some((ptr, ver)) => node.push_item(ptr, ver),
                    None => break,
                }
            }
            if i == 0 {
                node.set_total(total);
            }
            self.updates.insert(page, Some(node.into_page()));
        }
        self.free.head = chain.first().copied().unwrap_or(0);
        Ok(())
    }

    /// Items currently held by the free list.
    pub(crate) fn free_total(&mut self) -> Result<u64> {
        if self.free.head == 0 && self.free.cache.is_none() {
            return Ok(0);
        }
        self.free_load()?;
        Ok(self.free.cache.as_ref().expect("cache loaded above").total)
    }
}

impl NodeSource for TxPages {
    fn node(&self, ptr: u64) -> Result<Node> {
        Ok(Node::from_bytes(self.page_bytes(ptr)?))
    }
}

impl NodeStore for TxPages {
    fn alloc(&mut self, node: Node) -> Result<u64> {
        let data = node.into_page();
        let ptr = self.free_pop()?;
        let ptr = if ptr != 0 { ptr } else { self.page_reserve() };
        self.updates.insert(ptr, Some(data));
        Ok(ptr)
    }

    fn dealloc(&mut self, ptr: u64) {
        self.updates.insert(ptr, None);
    }
}

/// Exclusive write transaction. Dropping it without `commit` aborts.
pub struct KvWriteTxn<'a> {
    kv: &'a KvStore,
    _guard: MutexGuard<'a, ()>,
    pages: TxPages,
    root: u64,
    begin_root: u64,
    version: u64,
}

impl<'a> KvWriteTxn<'a> {
    pub(crate) fn new(
        kv: &'a KvStore,
        guard: MutexGuard<'a, ()>,
        pages: TxPages,
        root: u64,
        version: u64,
    ) -> Self {
        KvWriteTxn {
            kv,
            _guard: guard,
            pages,
            root,
            begin_root: root,
            version,
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        tree_get(&self.pages, self.root, key)
    }

    pub fn seek(&self, key: &[u8], cmp: Cmp) -> Result<TreeIter<'_, TxPages>> {
        TreeIter::seek(&self.pages, self.root, key, cmp)
    }

    /// Inserts or replaces a key.
    pub fn set(&mut self, key: &[u8], val: &[u8]) -> Result<()> {
        self.root = tree_insert(&mut self.pages, self.root, key, val)?;
        Ok(())
    }

    /// Mode-aware write. Fills the request's outcome fields and returns
    /// whether a new key was added.
    pub fn update(&mut self, req: &mut WriteRequest) -> Result<bool> {
        let old = tree_get(&self.pages, self.root, &req.key)?;
        match req.mode {
            WriteMode::UpdateOnly => {
                if old.is_none() {
                    return Err(DbError::NotFound.into());
                }
                self.set(&req.key, &req.value)?;
                req.updated = true;
                req.old = old;
                Ok(false)
            }
            WriteMode::Upsert => {
                self.set(&req.key, &req.value)?;
                req.updated = true;
                req.added = old.is_none();
                req.old = old;
                Ok(req.added)
            }
            WriteMode::InsertOnly => {
                if old.is_some() {
                    return Err(DbError::AlreadyExists.into());
                }
                self.set(&req.key, &req.value)?;
                req.added = true;
                req.updated = true;
                Ok(true)
            }
        }
    }

    /// Removes a key, returning its previous value when it existed.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let old = tree_get(&self.pages, self.root, key)?;
        if old.is_none() {
            return Ok(None);
        }
        match tree_delete(&mut self.pages, self.root, key)? {
            Some(new_root) => {
                self.root = new_root;
                Ok(old)
            }
            None => Ok(None),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn source(&self) -> &TxPages {
        &self.pages
    }

    pub(crate) fn root(&self) -> u64 {
        self.root
    }

    /// Items currently held by the free list.
    pub fn free_total(&mut self) -> Result<u64> {
        self.pages.free_total()
    }

    /// Publishes the transaction. See the module doc for the protocol.
    pub fn commit(mut self) -> Result<()> {
        if self.root == self.begin_root {
            // no effective modification; nothing to publish
            return Ok(());
        }

        self.write_pages()?;
        self.kv.sync()?;

        let (pages_used, free_head, version) = {
            let mut meta = self.kv.meta.lock();
            meta.flushed += self.pages.nappend;
            meta.root = self.root;
            meta.free_head = self.pages.free.head;
            meta.version = meta.version.wrapping_add(1);
            (meta.flushed, meta.free_head, meta.version)
        };

        self.kv.write_master(self.root, pages_used, free_head, version)?;
        self.kv.sync()?;

        debug!(version, pages = pages_used, "committed");
        Ok(())
    }

    /// Discards every staged change and releases the writer lock.
    pub fn abort(self) {}

    fn write_pages(&mut self) -> Result<()> {
        let freed: Vec<u64> = self
            .pages
            .updates
            .iter()
            .filter_map(|(&ptr, page)| page.is_none().then_some(ptr))
            .collect();
        self.pages.free_rebuild(freed)?;

        let npages = self.pages.flushed + self.pages.nappend;
        self.kv.extend_file(npages)?;
        self.pages.chunks = self.kv.extend_mmap(npages)?;

        for (&ptr, page) in &self.pages.updates {
            if let Some(data) = page {
                write_mapped_page(&self.pages.chunks, ptr, data)?;
            }
        }
        Ok(())
    }
}
