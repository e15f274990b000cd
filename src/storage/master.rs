//! # Master Page
//!
//! Page 0 starts with a 64-byte prefix that names the current version of
//! the whole database:
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------
//! 0       8     sig         Fixed engine signature
//! 8       8     root        Page number of the tree root (0 = empty)
//! 16      8     pages_used  Total pages in use, including page 0
//! 24      8     free_head   Head of the free-list chain (0 = empty)
//! 32      8     version     Commit counter
//! 40      24    reserved    Zero padding
//! ```
//!
//! The prefix is written with a positional write, never through the
//! mapping, so the update rides on single-sector atomicity. A commit
//! fsyncs the data pages first, then writes this prefix and fsyncs again;
//! whichever prefix survives a crash names a fully durable version.

use eyre::Result;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DB_SIG, MASTER_PAGE_SIZE};
use crate::error::DbError;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MasterPage {
    sig: [u8; 8],
    root: U64,
    pages_used: U64,
    free_head: U64,
    version: U64,
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<MasterPage>() == MASTER_PAGE_SIZE);

impl MasterPage {
    pub fn new(root: u64, pages_used: u64, free_head: u64, version: u64) -> Self {
        MasterPage {
            sig: DB_SIG,
            root: U64::new(root),
            pages_used: U64::new(pages_used),
            free_head: U64::new(free_head),
            version: U64::new(version),
            reserved: [0u8; 24],
        }
    }

    /// Parses and validates the prefix against the actual file size.
    pub fn decode(bytes: &[u8], file_pages: u64) -> Result<Self> {
        eyre::ensure!(
            bytes.len() >= MASTER_PAGE_SIZE,
            "buffer too small for the master page: {} < {}",
            bytes.len(),
            MASTER_PAGE_SIZE
        );
        let master = MasterPage::read_from_bytes(&bytes[..MASTER_PAGE_SIZE])
            .map_err(|e| eyre::eyre!("failed to read master page: {:?}", e))?;

        if master.sig != DB_SIG {
            return Err(DbError::BadSignature.into());
        }

        let used = master.pages_used.get();
        let bad = used < 1 || used > file_pages || master.root.get() >= used;
        if bad {
            return Err(DbError::BadMasterPage.into());
        }
        Ok(master)
    }

    pub fn encode(&self) -> [u8; MASTER_PAGE_SIZE] {
        let mut buf = [0u8; MASTER_PAGE_SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn pages_used(&self) -> u64 {
        self.pages_used.get()
    }

    pub fn free_head(&self) -> u64 {
        self.free_head.get()
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let master = MasterPage::new(7, 42, 3, 9);
        let bytes = master.encode();

        let decoded = MasterPage::decode(&bytes, 42).unwrap();
        assert_eq!(decoded.root(), 7);
        assert_eq!(decoded.pages_used(), 42);
        assert_eq!(decoded.free_head(), 3);
        assert_eq!(decoded.version(), 9);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut bytes = MasterPage::new(1, 2, 0, 0).encode();
        bytes[0] ^= 0xFF;

        let err = MasterPage::decode(&bytes, 2).unwrap_err();
        assert!(matches!(DbError::of(&err), Some(DbError::BadSignature)));
    }

    #[test]
    fn inconsistent_fields_are_rejected() {
        // root beyond pages_used
        let bytes = MasterPage::new(5, 3, 0, 0).encode();
        let err = MasterPage::decode(&bytes, 10).unwrap_err();
        assert!(matches!(DbError::of(&err), Some(DbError::BadMasterPage)));

        // pages_used beyond the file
        let bytes = MasterPage::new(1, 100, 0, 0).encode();
        let err = MasterPage::decode(&bytes, 10).unwrap_err();
        assert!(matches!(DbError::of(&err), Some(DbError::BadMasterPage)));

        // zero pages_used
        let bytes = MasterPage::new(0, 0, 0, 0).encode();
        let err = MasterPage::decode(&bytes, 10).unwrap_err();
        assert!(matches!(DbError::of(&err), Some(DbError::BadMasterPage)));
    }
}
