//! # Memory-Mapped Chunk List
//!
//! The backing file is mapped as a list of non-contiguous chunks. The
//! first chunk covers at least 64 MiB; every extension appends one chunk
//! that doubles the mapped total, so the list stays logarithmic in file
//! size and, crucially, the addresses of already-mapped pages never move.
//!
//! That address stability is what makes snapshot readers cheap: a reader
//! captures the chunk list (a handful of `Arc`s) under the metadata mutex
//! and can dereference pages for as long as it holds them, regardless of
//! how much the writer grows the file afterwards.
//!
//! ## Safety Model
//!
//! Chunks hand out raw page slices from a shared mapping, so the usual
//! exclusive-borrow discipline does not apply. Safety rests on the
//! engine's page lifecycle instead:
//!
//! - readers only dereference pages that were flushed before their
//!   snapshot was taken, and such pages are never modified in place;
//! - the single writer only writes to pages that no registered snapshot
//!   can reach: fresh appends, or free-list items whose free version
//!   precedes every registered reader.
//!
//! Mapping beyond the end of the file is allowed (the tail is simply
//! inaccessible until the file grows), mirroring how the initial 64 MiB
//! mapping covers a brand-new database.

use std::fs::File;

use eyre::{Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

use crate::config::PAGE_SIZE;

/// One mapped region of the backing file.
#[derive(Debug)]
pub(crate) struct Chunk {
    raw: MmapRaw,
    pages: u64,
}

impl Chunk {
    /// Maps `len` bytes of `file` starting at `offset`. `len` must be a
    /// multiple of the page size.
    pub(crate) fn map(file: &File, offset: u64, len: usize) -> Result<Self> {
        debug_assert!(len > 0 && len % PAGE_SIZE == 0);
        debug_assert!(offset % PAGE_SIZE as u64 == 0);

        let raw = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .wrap_err_with(|| format!("mmap of {} bytes at offset {}", len, offset))?;

        Ok(Chunk {
            raw,
            pages: (len / PAGE_SIZE) as u64,
        })
    }

    /// Number of pages this chunk spans.
    pub(crate) fn pages(&self) -> u64 {
        self.pages
    }

    /// Read-only view of page `idx` within this chunk.
    ///
    /// The returned slice lives as long as the borrow of `self`; callers
    /// keep the owning `Arc` alive for the duration of their snapshot.
    pub(crate) fn page(&self, idx: u64) -> &[u8] {
        debug_assert!(idx < self.pages);
        let offset = idx as usize * PAGE_SIZE;
        // SAFETY: the mapping covers `pages * PAGE_SIZE` bytes and `idx`
        // is bounds-checked above. Readers only reach pages that were
        // flushed before their snapshot and are never modified in place,
        // so no data race is possible (see the module-level safety model).
        unsafe { std::slice::from_raw_parts(self.raw.as_ptr().add(offset), PAGE_SIZE) }
    }

    /// Copies `data` over page `idx` within this chunk.
    ///
    /// Only the committing writer calls this, and only for pages that no
    /// registered snapshot can reach.
    pub(crate) fn write_page(&self, idx: u64, data: &[u8]) {
        debug_assert!(idx < self.pages);
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let offset = idx as usize * PAGE_SIZE;
        // SAFETY: bounds are checked above and the target page is
        // unreachable from every registered snapshot (fresh append or a
        // version-safe free-list page), so no reader can observe the
        // partially written bytes. The single writer lock serializes all
        // writers.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.raw.as_mut_ptr().add(offset),
                PAGE_SIZE,
            );
        }
    }
}

/// Locates page `ptr` inside a chunk list by accumulating chunk sizes and
/// returns a read-only view of it.
pub(crate) fn mapped_page<'a>(
    chunks: &'a [std::sync::Arc<Chunk>],
    ptr: u64,
) -> Result<&'a [u8]> {
    let mut start = 0u64;
    for chunk in chunks {
        let end = start + chunk.pages();
        if ptr < end {
            return Ok(chunk.page(ptr - start));
        }
        start = end;
    }
    eyre::bail!("page {} beyond the mapped range ({} pages)", ptr, start)
}

/// Locates page `ptr` and overwrites it with `data`.
pub(crate) fn write_mapped_page(
    chunks: &[std::sync::Arc<Chunk>],
    ptr: u64,
    data: &[u8],
) -> Result<()> {
    let mut start = 0u64;
    for chunk in chunks {
        let end = start + chunk.pages();
        if ptr < end {
            chunk.write_page(ptr - start, data);
            return Ok(());
        }
        start = end;
    }
    eyre::bail!("page {} beyond the mapped range ({} pages)", ptr, start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_file(pages: usize) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.db");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len((pages * PAGE_SIZE) as u64).unwrap();
        (dir, file)
    }

    #[test]
    fn write_then_read_round_trips_through_the_mapping() {
        let (_dir, file) = temp_file(4);
        let chunk = Chunk::map(&file, 0, 4 * PAGE_SIZE).unwrap();

        let page = vec![0xA5u8; PAGE_SIZE];
        chunk.write_page(2, &page);

        assert_eq!(chunk.page(2), page.as_slice());
        assert!(chunk.page(1).iter().all(|&b| b == 0));
    }

    #[test]
    fn mapped_page_walks_the_chunk_list() {
        let (_dir, file) = temp_file(8);
        let chunks = vec![
            Arc::new(Chunk::map(&file, 0, 2 * PAGE_SIZE).unwrap()),
            Arc::new(Chunk::map(&file, 2 * PAGE_SIZE as u64, 6 * PAGE_SIZE).unwrap()),
        ];

        let page = vec![0x3Cu8; PAGE_SIZE];
        write_mapped_page(&chunks, 5, &page).unwrap();

        // page 5 lives at index 3 of the second chunk
        assert_eq!(chunks[1].page(3), page.as_slice());
        assert_eq!(mapped_page(&chunks, 5).unwrap(), page.as_slice());
    }

    #[test]
    fn out_of_range_pages_are_rejected() {
        let (_dir, file) = temp_file(2);
        let chunks = vec![Arc::new(Chunk::map(&file, 0, 2 * PAGE_SIZE).unwrap())];

        assert!(mapped_page(&chunks, 2).is_err());
    }

    #[test]
    fn mapping_may_extend_past_the_file_end() {
        let (_dir, file) = temp_file(1);
        // map four pages over a one-page file; only page 0 is accessed
        let chunk = Chunk::map(&file, 0, 4 * PAGE_SIZE).unwrap();
        assert_eq!(chunk.pages(), 4);
        assert!(chunk.page(0).iter().all(|&b| b == 0));
    }
}
