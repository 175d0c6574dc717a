//! Tree type used by unit tests that need short pointers.

use super::ops::BtreeOps;
use std::cmp::Ordering;

/// Leaf records are two u64s keyed by the first.
#[derive(Debug)]
pub(crate) struct PairOps;

impl BtreeOps for PairOps {
    fn name(&self) -> &'static str {
        "pair"
    }

    fn magic(&self) -> u32 {
        0x5041_4952
    }

    fn rec_len(&self) -> usize {
        16
    }

    fn key_len(&self) -> usize {
        8
    }

    fn max_levels(&self) -> u32 {
        5
    }

    fn key_from_record(&self, rec: &[u8], key: &mut [u8]) {
        key.copy_from_slice(&rec[..8]);
    }

    fn compare_key(&self, cursor_rec: &[u8], key: &[u8]) -> Ordering {
        key.cmp(&cursor_rec[..8])
    }

    fn diff_two_keys(&self, k1: &[u8], k2: &[u8]) -> Ordering {
        k1.cmp(k2)
    }

    fn records_in_order(&self, r1: &[u8], r2: &[u8]) -> bool {
        r1[..8] < r2[..8]
    }
}
