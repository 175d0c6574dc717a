//! Paged in-memory B+trees.
//!
//! Trees live in a virtual store addressed in blocks: block 0 holds the
//! header, everything else is a tree block. Changes are staged in a
//! `Transaction` and written back atomically on commit.

mod constants;
mod cursor;
mod index;
mod ops;
mod page;
mod rcbag;
mod trans;
mod types;

#[cfg(test)]
mod testing;

pub use constants::{HEAD_BLOCK, HEAD_MAGIC, INIT_LEAF_BLOCK};
pub use cursor::{AllocGroup, BtreeCursor, CursorLevel};
pub use index::{MemBtree, TreeState};
pub use ops::{calc_size, space_to_height, BtreeOps};
pub use page::{BlockBuf, BlockData, BlockLayout};
pub use rcbag::{rcbag_calc_size, RcbagKey, RcbagOps, RcbagRec, RCBAG_MAGIC};
pub use trans::{LogEntry, Transaction};
pub use types::{BlockHeader, BtreePtr, MemHead};
