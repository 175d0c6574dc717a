//! Page geometry for the staging store.
//!
//! The store is addressed in bytes, cached in system pages, and handed out to
//! trees in blocks. A block is exactly one page, so block numbers and page
//! numbers are the same value; 512-byte sector addresses ("daddr") exist only
//! because real on-disk block headers record them.

use serde::{Deserialize, Serialize};

/// System page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Size of one tree block in bytes.
pub const BLOCK_SIZE: usize = PAGE_SIZE;

/// log2 of the 512-byte basic block used for sector addresses.
pub const BBSHIFT: u32 = 9;

/// Shift between block numbers and sector addresses.
const DADDR_SHIFT: u32 = PAGE_SHIFT - BBSHIFT;

/// Page number within a store (byte offset >> PAGE_SHIFT).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    /// Returns the page containing the given byte offset.
    #[inline]
    pub fn containing(offset: u64) -> Self {
        Self(offset >> PAGE_SHIFT)
    }

    /// Returns the byte offset of the first byte of this page.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Returns the page after this one.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "page:{}", self.0)
    }
}

/// Rounds a byte offset down to its page boundary.
#[inline]
pub fn page_align_down(offset: u64) -> u64 {
    offset & !(PAGE_SIZE as u64 - 1)
}

/// Rounds a byte offset up to the next page boundary.
#[inline]
pub fn page_align_up(offset: u64) -> u64 {
    page_align_down(offset.saturating_add(PAGE_SIZE as u64 - 1))
}

/// Offset of a byte within its page.
#[inline]
pub fn offset_in_page(offset: u64) -> usize {
    (offset & (PAGE_SIZE as u64 - 1)) as usize
}

/// Block number to byte offset.
#[inline]
pub fn block_to_bytes(block: u64) -> u64 {
    block << PAGE_SHIFT
}

/// Byte offset to block number, rounding up.
#[inline]
pub fn bytes_to_block_roundup(pos: u64) -> u64 {
    (pos + (BLOCK_SIZE as u64 - 1)) >> PAGE_SHIFT
}

/// Byte offset to block number, truncating.
#[inline]
pub fn bytes_to_block(pos: u64) -> u64 {
    pos >> PAGE_SHIFT
}

/// Block number to 512-byte sector address.
#[inline]
pub fn block_to_daddr(block: u64) -> u64 {
    block << DADDR_SHIFT
}

/// Sector address to block number, rounding up.
#[inline]
pub fn daddr_to_block_roundup(daddr: u64) -> u64 {
    (daddr + (block_to_daddr(1) - 1)) >> DADDR_SHIFT
}

/// Sector address to block number, truncating.
#[inline]
pub fn daddr_to_block(daddr: u64) -> u64 {
    daddr >> DADDR_SHIFT
}

/// Number of 512-byte sectors in one block.
#[inline]
pub fn block_sectors() -> u64 {
    block_to_daddr(1)
}
