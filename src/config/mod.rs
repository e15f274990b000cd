//! Configuration constants shared across the storage, tree and table layers.

mod constants;

pub use constants::{
    DB_SIG, FREE_LIST_CAP, FREE_LIST_HEADER, MASTER_PAGE_SIZE, MAX_KEY_SIZE, MAX_RANGE_ROWS,
    MAX_VAL_SIZE, META_TABLE_PREFIX, MMAP_MIN_SIZE, NODE_HEADER_SIZE, PAGE_SIZE,
    SCHEMA_TABLE_PREFIX, TABLE_PREFIX_MIN,
};
