//! Refcount bag tree type.
//!
//! Tracks how many times each block extent is referenced while refcount
//! records are rebuilt. Records are keyed by `(start_block, block_count)`.

use super::constants::LONG_HEADER_LEN;
use super::ops::{calc_size, space_to_height, BtreeOps};
use super::types::{get_be_u64, put_be_u64};
use memtree_common::{PointerWidth, BLOCK_SIZE};
use std::cmp::Ordering;

/// Magic of refcount bag blocks ("trcb").
pub const RCBAG_MAGIC: u32 = 0x7472_6362;

/// One leaf record.
///
/// Layout (24 bytes, big-endian):
/// - start_block: 8 bytes
/// - block_count: 8 bytes
/// - refcount: 8 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcbagRec {
    pub start_block: u64,
    pub block_count: u64,
    pub refcount: u64,
}

impl RcbagRec {
    /// Size of the record in bytes.
    pub const SIZE: usize = 24;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_be_u64(&mut buf, 0, self.start_block);
        put_be_u64(&mut buf, 8, self.block_count);
        put_be_u64(&mut buf, 16, self.refcount);
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            start_block: get_be_u64(buf, 0),
            block_count: get_be_u64(buf, 8),
            refcount: get_be_u64(buf, 16),
        }
    }

    /// Returns the key of this record.
    pub fn key(&self) -> RcbagKey {
        RcbagKey {
            start_block: self.start_block,
            block_count: self.block_count,
        }
    }
}

/// One node key.
///
/// Layout (16 bytes, big-endian):
/// - start_block: 8 bytes
/// - block_count: 8 bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct RcbagKey {
    pub start_block: u64,
    pub block_count: u64,
}

impl RcbagKey {
    /// Size of the key in bytes.
    pub const SIZE: usize = 16;

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_be_u64(&mut buf, 0, self.start_block);
        put_be_u64(&mut buf, 8, self.block_count);
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            start_block: get_be_u64(buf, 0),
            block_count: get_be_u64(buf, 8),
        }
    }
}

/// Minimum occupancy of refcount bag blocks, leaf and node.
fn rcbag_minrecs() -> [usize; 2] {
    let blocklen = BLOCK_SIZE - LONG_HEADER_LEN;
    [
        blocklen / RcbagRec::SIZE / 2,
        blocklen / (RcbagKey::SIZE + PointerWidth::Long.ptr_len()) / 2,
    ]
}

/// Number of blocks a refcount bag of `records` may need.
pub fn rcbag_calc_size(records: u64) -> u64 {
    calc_size(rcbag_minrecs(), records)
}

/// Operations of the refcount bag tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcbagOps;

impl BtreeOps for RcbagOps {
    fn name(&self) -> &'static str {
        "rcbag"
    }

    fn magic(&self) -> u32 {
        RCBAG_MAGIC
    }

    fn rec_len(&self) -> usize {
        RcbagRec::SIZE
    }

    fn key_len(&self) -> usize {
        RcbagKey::SIZE
    }

    fn max_levels(&self) -> u32 {
        space_to_height(rcbag_minrecs(), u64::MAX)
    }

    fn pointer_width(&self) -> Option<PointerWidth> {
        Some(PointerWidth::Long)
    }

    fn key_from_record(&self, rec: &[u8], key: &mut [u8]) {
        key[..RcbagKey::SIZE].copy_from_slice(&RcbagRec::from_bytes(rec).key().to_bytes());
    }

    fn compare_key(&self, cursor_rec: &[u8], key: &[u8]) -> Ordering {
        RcbagKey::from_bytes(key).cmp(&RcbagRec::from_bytes(cursor_rec).key())
    }

    fn diff_two_keys(&self, k1: &[u8], k2: &[u8]) -> Ordering {
        RcbagKey::from_bytes(k1).cmp(&RcbagKey::from_bytes(k2))
    }

    fn records_in_order(&self, r1: &[u8], r2: &[u8]) -> bool {
        RcbagRec::from_bytes(r1).key() < RcbagRec::from_bytes(r2).key()
    }
}
