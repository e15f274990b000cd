//! # Key-Value Store
//!
//! `KvStore` owns the backing file and the shared state every transaction
//! snapshots from:
//!
//! - the **writer lock**, held for the full extent of a write transaction;
//! - the **metadata mutex**, a short critical section protecting the
//!   current root, version, free-list head, flushed page count, the mmap
//!   chunk list and the reader registry.
//!
//! Readers never block the writer and the writer never blocks readers;
//! both only take the metadata mutex for a few loads and stores. The
//! reader registry maps snapshot versions to reader counts; its smallest
//! key is the minimum live version, which gates free-page reuse.
//!
//! ## Open Protocol
//!
//! The file must be a whole number of pages. An empty file is a fresh
//! database: page 0 is reserved and the master page is first written by
//! the first commit. Otherwise the 64-byte master prefix is validated
//! (signature, page counts) before anything else is touched.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::freelist::TxFreeList;
use super::txn::{KvReadTxn, KvWriteTxn, Snapshot, TxPages};
use crate::config::{MASTER_PAGE_SIZE, MMAP_MIN_SIZE, PAGE_SIZE};
use crate::storage::{Chunk, MasterPage};

/// Shared state guarded by the metadata mutex.
pub(crate) struct Meta {
    /// Append-only mmap chunk list. Existing chunks never move, so a
    /// snapshot of this vector stays dereferenceable for its lifetime.
    pub chunks: Vec<Arc<Chunk>>,
    /// Pages covered by the chunk list (can exceed the file).
    pub mapped_pages: u64,
    /// Pages the file currently spans (can exceed `flushed`).
    pub file_pages: u64,
    /// Durable database size in pages, including page 0.
    pub flushed: u64,
    /// Current tree root page (0 = empty tree).
    pub root: u64,
    /// Commit counter.
    pub version: u64,
    /// Head of the free-list chain (0 = empty).
    pub free_head: u64,
    /// Registered reader snapshots: version -> count.
    pub readers: BTreeMap<u64, usize>,
}

/// The transactional key-value store over one file.
pub struct KvStore {
    path: PathBuf,
    file: File,
    pub(crate) meta: Mutex<Meta>,
    writer: Mutex<()>,
}

impl KvStore {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "file size {} is not a multiple of the page size",
            file_size
        );
        let file_pages = file_size / PAGE_SIZE as u64;

        let mut mmap_size = MMAP_MIN_SIZE as u64;
        while mmap_size < file_size {
            mmap_size *= 2;
        }
        let chunk = Chunk::map(&file, 0, mmap_size as usize)
            .wrap_err_with(|| format!("failed to map '{}'", path.display()))?;
        let mapped_pages = mmap_size / PAGE_SIZE as u64;

        let (flushed, root, free_head, version) = if file_pages == 0 {
            // fresh database; page 0 is reserved for the master page and
            // gets written by the first commit
            (1, 0, 0, 0)
        } else {
            let master = MasterPage::decode(&chunk.page(0)[..MASTER_PAGE_SIZE], file_pages)?;
            (
                master.pages_used(),
                master.root(),
                master.free_head(),
                master.version(),
            )
        };

        debug!(
            path = %path.display(),
            pages = flushed,
            version,
            "opened database"
        );

        Ok(KvStore {
            path,
            file,
            meta: Mutex::new(Meta {
                chunks: vec![Arc::new(chunk)],
                mapped_pages,
                file_pages,
                flushed,
                root,
                version,
                free_head,
                readers: BTreeMap::new(),
            }),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a snapshot reader pinned to the current version.
    pub fn begin_read(&self) -> KvReadTxn<'_> {
        let mut meta = self.meta.lock();
        let snap = Snapshot {
            chunks: meta.chunks.clone(),
            root: meta.root,
            version: meta.version,
        };
        *meta.readers.entry(snap.version).or_insert(0) += 1;
        KvReadTxn::new(self, snap)
    }

    pub(crate) fn end_read(&self, version: u64) {
        let mut meta = self.meta.lock();
        match meta.readers.get_mut(&version) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                meta.readers.remove(&version);
            }
            None => debug_assert!(false, "reader version {} not registered", version),
        }
    }

    /// Acquires the writer lock and snapshots the state to mutate.
    pub fn begin_write(&self) -> KvWriteTxn<'_> {
        let guard: MutexGuard<'_, ()> = self.writer.lock();
        let meta = self.meta.lock();
        let min_reader = meta
            .readers
            .keys()
            .next()
            .copied()
            .unwrap_or(meta.version);
        let pages = TxPages {
            chunks: meta.chunks.clone(),
            flushed: meta.flushed,
            nappend: 0,
            updates: hashbrown::HashMap::new(),
            free: TxFreeList::new(meta.free_head, meta.version, min_reader),
        };
        let root = meta.root;
        let version = meta.version;
        drop(meta);
        KvWriteTxn::new(self, guard, pages, root, version)
    }

    /// Grows the file to cover `npages`, with 1/8 increments to amortize
    /// the syscalls. Tries `posix_fallocate` first and falls back to
    /// `set_len`.
    pub(crate) fn extend_file(&self, npages: u64) -> Result<()> {
        let current = self.meta.lock().file_pages;
        if current >= npages {
            return Ok(());
        }

        let mut target = current;
        while target < npages {
            target += (target / 8).max(1);
        }
        let target_bytes = target * PAGE_SIZE as u64;

        let ret = unsafe {
            libc::posix_fallocate(self.file.as_raw_fd(), 0, target_bytes as libc::off_t)
        };
        if ret != 0 {
            warn!(errno = ret, "posix_fallocate failed, falling back to truncate");
            self.file
                .set_len(target_bytes)
                .wrap_err_with(|| format!("failed to extend file to {} bytes", target_bytes))?;
        }

        debug!(pages = target, "extended file");
        self.meta.lock().file_pages = target;
        Ok(())
    }

    /// Ensures at least `npages` are mapped, appending doubling chunks.
    /// Returns the current chunk list.
    pub(crate) fn extend_mmap(&self, npages: u64) -> Result<Vec<Arc<Chunk>>> {
        let mut meta = self.meta.lock();
        while meta.mapped_pages < npages {
            let offset = meta.mapped_pages * PAGE_SIZE as u64;
            let len = meta.mapped_pages as usize * PAGE_SIZE;
            let chunk = Chunk::map(&self.file, offset, len)
                .wrap_err("failed to extend the memory mapping")?;
            meta.chunks.push(Arc::new(chunk));
            meta.mapped_pages *= 2;
            debug!(mapped_pages = meta.mapped_pages, "extended mmap");
        }
        Ok(meta.chunks.clone())
    }

    /// Positional write of the master page, bypassing the mapping.
    pub(crate) fn write_master(
        &self,
        root: u64,
        pages_used: u64,
        free_head: u64,
        version: u64,
    ) -> Result<()> {
        let master = MasterPage::new(root, pages_used, free_head, version);
        self.file
            .write_all_at(&master.encode(), 0)
            .wrap_err("failed to write the master page")
    }

    /// Durability barrier.
    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all().wrap_err("fsync failed")
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
