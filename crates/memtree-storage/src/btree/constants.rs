//! On-store layout constants for in-memory B+trees.

/// Magic of the header block ("CATM").
pub const HEAD_MAGIC: u32 = 0x4341_544D;

/// Block number of the header block.
pub const HEAD_BLOCK: u64 = 0;

/// Block number of the leaf written when a tree is created. Nothing may
/// point below it.
pub const INIT_LEAF_BLOCK: u64 = 1;

/// Length of a short-pointer block header (v5 format, with CRC field).
pub const SHORT_HEADER_LEN: usize = 56;

/// Length of a long-pointer block header (v5 format, with CRC field).
pub const LONG_HEADER_LEN: usize = 72;

/// Null short sibling pointer.
pub const NULL_SHORT_PTR: u32 = u32::MAX;

/// Null long sibling pointer.
pub const NULL_LONG_PTR: u64 = u64::MAX;
