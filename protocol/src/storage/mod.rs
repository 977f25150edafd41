//! # Storage Engine
//!
//! The on-disk data structures underneath every Keel database. Nothing in
//! here knows what a block or a transaction is. It deals in files, byte
//! offsets, fixed-size records and variable-size slabs.
//!
//! ## Architecture
//!
//! ```text
//! memory_map.rs      — growable memory-mapped file (logical vs physical size)
//! record_manager.rs  — linear allocator of fixed-size records (u32 index)
//! slab_manager.rs    — linear allocator of variable-size slabs (u64 offset)
//! bucket_header.rs   — fixed array of bucket heads at the start of a file
//! hash_table.rs      — chained hash table over either allocator
//! multimap.rs        — one-to-many index: hash table + linked rows
//! ```
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────┐ 0
//! │ bucket header            │ [bucket_count:4][head × bucket_count]
//! ├──────────────────────────┤
//! │ allocator counter        │ record count (4) or slab payload size (8)
//! ├──────────────────────────┤
//! │ arena                    │ records or slabs, appended, never reclaimed
//! └──────────────────────────┘ logical size
//! ```
//!
//! ## Crash Ordering
//!
//! Every insert follows the same three steps: allocate and write the entry,
//! persist the allocator counter, then link the entry into its bucket. A
//! crash before the link leaves unreachable bytes behind; it never leaves a
//! reachable entry with a half-written payload.

pub mod bucket_header;
pub mod hash_table;
pub mod memory_map;
pub mod multimap;
pub mod record_manager;
pub mod slab_manager;

use std::path::PathBuf;

pub use bucket_header::{BucketHeader, Link};
pub use hash_table::{Entry, HashTable, RecordHashTable, SlabHashTable, TableStats};
pub use memory_map::{MappedFile, Memory};
pub use multimap::{RecordMultimap, Row, RowIter};
pub use record_manager::RecordManager;
pub use slab_manager::SlabManager;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors raised by the storage primitives.
///
/// Everything in here is treated as fatal by the layers above: a table that
/// failed to grow or whose counters disagree with its file size is not
/// something the node can repair while running.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store is closed: {0}")]
    Closed(PathBuf),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("record index space exhausted")]
    IndexExhausted,

    #[error("access out of bounds: offset {offset} + {len} > {size}")]
    OutOfBounds { offset: u64, len: usize, size: usize },
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
