//! # Versioned Free List
//!
//! Pages discarded by copy-on-write updates cannot be reused immediately:
//! a reader pinned to an older version may still walk them. The free list
//! records each page together with the version that freed it, and only
//! hands a page back out once every registered reader is strictly past
//! that version.
//!
//! ## Node Layout
//!
//! The list is itself a chain of pages:
//!
//! ```text
//! | type | size | total | next |  (ptr, version) pairs |
//! |  2B  |  2B  |  8B   |  8B  |       size * 16B      |
//! ```
//!
//! `total` is the number of items across the whole chain and is only
//! meaningful on the head node. Items are consumed from the head and new
//! items carry the freeing writer's version.
//!
//! ## Commit-Time Rewrite
//!
//! A transaction never edits list nodes in place. At commit the surviving
//! items and the newly freed pages are written into a fresh chain, and the
//! old chain's node pages are re-added as freed items of this commit, so
//! list nodes themselves are recycled through the list. Pages for the new
//! chain are drawn from version-safe items first (the same gate as `pop`),
//! else appended; pages freed by the in-flight commit are never
//! overwritten, since the last durable master still references them.
//!
//! ## Version Arithmetic
//!
//! Comparisons treat the difference as a signed 64-bit value, so ordering
//! stays correct even across counter wrap.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::NodeType;
use crate::config::{FREE_LIST_CAP, FREE_LIST_HEADER, PAGE_SIZE};

/// True when `a` is strictly before `b` in wrap-safe version order.
pub(crate) fn version_before(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct FreeNodeHeader {
    ntype: U16,
    size: U16,
    total: U64,
    next: U64,
}

const _: () = assert!(std::mem::size_of::<FreeNodeHeader>() == FREE_LIST_HEADER);

/// One free-list node held as an owned page buffer.
#[derive(Debug, Clone)]
pub(crate) struct FreeNode {
    data: Box<[u8]>,
}

impl FreeNode {
    pub(crate) fn new(next: u64) -> Self {
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let header = FreeNodeHeader {
            ntype: U16::new(NodeType::FreeList as u16),
            size: U16::new(0),
            total: U64::new(0),
            next: U64::new(next),
        };
        data[..FREE_LIST_HEADER].copy_from_slice(header.as_bytes());
        FreeNode { data }
    }

    pub(crate) fn from_bytes(page: &[u8]) -> Result<Self> {
        ensure!(page.len() == PAGE_SIZE, "free-list node must be one page");
        let header = FreeNodeHeader::ref_from_bytes(&page[..FREE_LIST_HEADER])
            .map_err(|e| eyre::eyre!("failed to read free-list header: {:?}", e))?;
        ensure!(
            header.ntype.get() == NodeType::FreeList as u16,
            "page is not a free-list node (type {})",
            header.ntype.get()
        );
        ensure!(
            header.size.get() as usize <= FREE_LIST_CAP,
            "free-list node size {} exceeds capacity",
            header.size.get()
        );
        Ok(FreeNode {
            data: page.to_vec().into_boxed_slice(),
        })
    }

    fn header(&self) -> &FreeNodeHeader {
        FreeNodeHeader::ref_from_bytes(&self.data[..FREE_LIST_HEADER]).expect("validated header")
    }

    fn header_mut(&mut self) -> &mut FreeNodeHeader {
        FreeNodeHeader::mut_from_bytes(&mut self.data[..FREE_LIST_HEADER])
            .expect("validated header")
    }

    pub(crate) fn size(&self) -> usize {
        self.header().size.get() as usize
    }

    pub(crate) fn total(&self) -> u64 {
        self.header().total.get()
    }

    pub(crate) fn set_total(&mut self, total: u64) {
        self.header_mut().total = U64::new(total);
    }

    pub(crate) fn next(&self) -> u64 {
        self.header().next.get()
    }

    pub(crate) fn item(&self, idx: usize) -> (u64, u64) {
        debug_assert!(idx < self.size());
        let pos = FREE_LIST_HEADER + idx * 16;
        let ptr = u64::from_le_bytes(self.data[pos..pos + 8].try_into().unwrap());
        let ver = u64::from_le_bytes(self.data[pos + 8..pos + 16].try_into().unwrap());
        (ptr, ver)
    }

    pub(crate) fn push_item(&mut self, ptr: u64, ver: u64) {
        let idx = self.size();
        debug_assert!(idx < FREE_LIST_CAP);
        let pos = FREE_LIST_HEADER + idx * 16;
        self.data[pos..pos + 8].copy_from_slice(&ptr.to_le_bytes());
        self.data[pos + 8..pos + 16].copy_from_slice(&ver.to_le_bytes());
        self.header_mut().size = U16::new(idx as u16 + 1);
    }

    pub(crate) fn into_page(self) -> Box<[u8]> {
        self.data
    }
}

/// Per-transaction free-list state. The chain itself lives in pages; this
/// struct carries the head pointer, the version gates and the lazily
/// loaded consumption cursor.
#[derive(Debug)]
pub(crate) struct TxFreeList {
    /// Head node page, 0 when the list is empty.
    pub head: u64,
    /// The writer's begin version; newly freed pages are tagged with it.
    pub version: u64,
    /// Minimum registered reader version at begin (the writer's own
    /// version when no reader is registered).
    pub min_reader: u64,
    pub cache: Option<FreeCache>,
}

/// Lazily loaded view of the chain: every node page plus how far `pop`
/// has consumed into it.
#[derive(Debug)]
pub(crate) struct FreeCache {
    /// Chain pages, head first.
    pub nodes: Vec<u64>,
    /// Node currently being consumed.
    pub node_idx: usize,
    /// Items consumed within that node.
    pub offset: usize,
    /// Items remaining across the chain.
    pub total: u64,
    /// Whether any item was consumed since loading.
    pub popped: bool,
}

impl TxFreeList {
    pub(crate) fn new(head: u64, version: u64, min_reader: u64) -> Self {
        TxFreeList {
            head,
            version,
            min_reader,
            cache: None,
        }
    }
}
