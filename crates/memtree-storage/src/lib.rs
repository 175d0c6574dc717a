//! Staging storage backend for memtree.
//!
//! This crate provides:
//! - Free-space interval set for recycling store blocks
//! - In-memory B+tree instances kept in a paged virtual store
//! - Cursor hooks for the generic tree algorithms (root access, allocation)
//! - Transaction buffer collector with verify-then-write commit

mod btree;
mod freespace;

pub use btree::{
    calc_size, rcbag_calc_size, space_to_height, AllocGroup, BlockBuf, BlockData, BlockHeader,
    BlockLayout, BtreeCursor, BtreeOps, BtreePtr, CursorLevel, LogEntry, MemBtree, MemHead,
    RcbagKey, RcbagOps, RcbagRec, Transaction, TreeState, HEAD_BLOCK, HEAD_MAGIC,
    INIT_LEAF_BLOCK, RCBAG_MAGIC,
};
pub use freespace::FreeSpaceSet;
