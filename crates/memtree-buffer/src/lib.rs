//! Paged virtual store for memtree.
//!
//! This crate provides the sparse memory region staging trees live in:
//! - Byte-addressable reads and writes with all-or-nothing semantics
//! - Zero-filled pages materialized on first touch
//! - A small mapped-page cache with LRU eviction
//! - Swap-out of cold pages to an anonymous temporary file

mod frame;
mod replacer;
mod store;
mod swap;

pub use frame::{PageData, PageFrame, SharedPage};
pub use replacer::{LruReplacer, Replacer};
pub use store::{PageHandle, StoreStat, VirtualStore};
pub use swap::SwapFile;
