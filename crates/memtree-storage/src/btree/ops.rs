//! Tree-type interface supplied to the storage backend.

use memtree_common::PointerWidth;
use std::cmp::Ordering;

/// Behavior of one kind of in-memory tree.
///
/// One instance is built per tree type and shared by every tree and cursor
/// of that type. All methods are pure projections or comparisons over
/// encoded records and keys.
pub trait BtreeOps: Send + Sync + std::fmt::Debug {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    /// Magic stamped into every block of this type.
    fn magic(&self) -> u32;

    /// Encoded size of one leaf record.
    fn rec_len(&self) -> usize;

    /// Encoded size of one node key.
    fn key_len(&self) -> usize;

    /// Maximum possible tree height. Blocks at or above it are corrupt.
    fn max_levels(&self) -> u32;

    /// Pointer width this type requires, if any.
    fn pointer_width(&self) -> Option<PointerWidth> {
        None
    }

    /// Projects the key of a record.
    fn key_from_record(&self, rec: &[u8], key: &mut [u8]);

    /// Encodes the cursor's working record into `rec`.
    fn record_from_cursor(&self, cursor_rec: &[u8], rec: &mut [u8]) {
        rec.copy_from_slice(&cursor_rec[..rec.len()]);
    }

    /// Orders `key` relative to the cursor's working record.
    fn compare_key(&self, cursor_rec: &[u8], key: &[u8]) -> Ordering;

    /// Orders two keys.
    fn diff_two_keys(&self, k1: &[u8], k2: &[u8]) -> Ordering;

    /// Returns true if `k1` sorts strictly before `k2`.
    fn keys_in_order(&self, k1: &[u8], k2: &[u8]) -> bool {
        self.diff_two_keys(k1, k2) == Ordering::Less
    }

    /// Returns true if `r1` sorts strictly before `r2`.
    fn records_in_order(&self, r1: &[u8], r2: &[u8]) -> bool;
}

/// Height of the tallest tree that fits in `blocks` blocks when every block
/// holds only `minrecs` entries.
pub fn space_to_height(minrecs: [usize; 2], blocks: u64) -> u32 {
    if blocks < 1 {
        return 0;
    }
    let per_node = minrecs[1].max(1) as u64;
    let mut node_blocks = per_node;
    let mut blocks_left = blocks - 1;
    let mut height = 1;
    while node_blocks < blocks_left {
        blocks_left -= node_blocks;
        node_blocks = node_blocks.saturating_mul(per_node);
        height += 1;
    }
    height
}

/// Number of blocks, root included, a tree of `records` needs when every
/// block holds only `minrecs` entries.
pub fn calc_size(minrecs: [usize; 2], records: u64) -> u64 {
    let mut level_blocks = records;
    let mut blocks = 0u64;
    let mut level = 0usize;
    loop {
        let limit = minrecs[(level > 0) as usize].max(1) as u64;
        level_blocks = level_blocks.div_ceil(limit);
        blocks += level_blocks;
        if level_blocks <= 1 {
            break;
        }
        level += 1;
    }
    blocks.max(1)
}
