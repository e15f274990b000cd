//! # Storage Layer
//!
//! Byte-level access to the single backing file: the append-only mmap
//! chunk list and the master-page codec. Everything above this layer
//! addresses the file purely in page numbers.

mod chunks;
mod master;

pub(crate) use chunks::{mapped_page, write_mapped_page, Chunk};
pub use master::MasterPage;
