//! Tree block buffers and their byte layout.
//!
//! Block layout:
//! ```text
//! +--------------------------+ 0
//! | Block header (56 or 72)  |
//! +--------------------------+ header_len
//! | Leaf: records            |  rec_len * numrecs
//! | Node: keys               |  key_len * maxrecs(node)
//! |       pointers           |  ptr_len * maxrecs(node)
//! +--------------------------+ BLOCK_SIZE
//! ```
//! Node pointers start after room for the maximum number of keys, as in the
//! on-disk format, so keys can grow without moving pointers.

use super::types::{get_be_u16, put_be_u16, BlockHeader, BtreePtr, MemHead};
use memtree_common::page::{block_to_bytes, block_to_daddr};
use memtree_common::{MetaUuid, PointerWidth, BLOCK_SIZE};

/// Contents of one tree block.
pub type BlockData = Box<[u8; BLOCK_SIZE]>;

/// Record and key/pointer geometry of one tree instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    width: PointerWidth,
    rec_len: usize,
    key_len: usize,
    /// Indexed by `level > 0`.
    maxrecs: [usize; 2],
    minrecs: [usize; 2],
}

impl BlockLayout {
    /// Derives the per-level record limits for a block size.
    pub fn new(width: PointerWidth, rec_len: usize, key_len: usize) -> Self {
        let usable = BLOCK_SIZE - BlockHeader::len(width);
        let leaf = usable / rec_len;
        let node = usable / (key_len + width.ptr_len());
        Self {
            width,
            rec_len,
            key_len,
            maxrecs: [leaf, node],
            minrecs: [leaf / 2, node / 2],
        }
    }

    #[inline]
    pub fn width(&self) -> PointerWidth {
        self.width
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        BlockHeader::len(self.width)
    }

    #[inline]
    pub fn rec_len(&self) -> usize {
        self.rec_len
    }

    #[inline]
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Maximum records (leaf) or key/pointer pairs (node) at `level`.
    #[inline]
    pub fn max_records(&self, level: u16) -> usize {
        self.maxrecs[(level > 0) as usize]
    }

    /// Minimum occupancy at `level` for a non-root block.
    #[inline]
    pub fn min_records(&self, level: u16) -> usize {
        self.minrecs[(level > 0) as usize]
    }

    /// Byte offset of leaf record `index`.
    pub fn record_offset(&self, index: usize) -> usize {
        self.header_len() + index * self.rec_len
    }

    /// Byte offset of node key `index`.
    pub fn key_offset(&self, index: usize) -> usize {
        self.header_len() + index * self.key_len
    }

    /// Byte offset of node pointer `index`.
    pub fn ptr_offset(&self, index: usize) -> usize {
        self.header_len() + self.maxrecs[1] * self.key_len + index * self.width.ptr_len()
    }
}

/// One block of a tree, detached from the store.
#[derive(Clone)]
pub struct BlockBuf {
    block: u64,
    data: BlockData,
}

impl BlockBuf {
    /// Creates a zero-filled buffer for `block`.
    pub fn zeroed(block: u64) -> Self {
        Self {
            block,
            data: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    /// Returns the block number.
    #[inline]
    pub fn block(&self) -> u64 {
        self.block
    }

    /// Returns the sector address of the block.
    #[inline]
    pub fn daddr(&self) -> u64 {
        block_to_daddr(self.block)
    }

    /// Returns the store offset of the block.
    #[inline]
    pub fn offset(&self) -> u64 {
        block_to_bytes(self.block)
    }

    /// Returns the raw block contents.
    #[inline]
    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    /// Returns the raw block contents for modification.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }

    /// Formats the buffer as an empty tree block.
    pub fn init_node(
        &mut self,
        width: PointerWidth,
        magic: u32,
        level: u16,
        owner: u64,
        uuid: MetaUuid,
    ) {
        self.data.fill(0);
        let header = BlockHeader::new(width, magic, level, owner, uuid, self.daddr());
        header.write_to(&mut self.data[..]);
    }

    /// Decodes the block header.
    pub fn header(&self, width: PointerWidth) -> BlockHeader {
        BlockHeader::read_from(&self.data[..], width)
    }

    /// Encodes the block header.
    pub fn set_header(&mut self, header: &BlockHeader) {
        header.write_to(&mut self.data[..]);
    }

    /// Returns the tree level (0 = leaf).
    #[inline]
    pub fn level(&self) -> u16 {
        get_be_u16(&self.data[..], 4)
    }

    /// Returns the number of records or keys.
    #[inline]
    pub fn numrecs(&self) -> u16 {
        get_be_u16(&self.data[..], 6)
    }

    /// Sets the number of records or keys.
    #[inline]
    pub fn set_numrecs(&mut self, numrecs: u16) {
        put_be_u16(&mut self.data[..], 6, numrecs);
    }

    /// Returns leaf record `index`, or None past the block's capacity.
    pub fn record(&self, layout: &BlockLayout, index: usize) -> Option<&[u8]> {
        if index >= layout.max_records(0) {
            return None;
        }
        let off = layout.record_offset(index);
        Some(&self.data[off..off + layout.rec_len()])
    }

    /// Returns leaf record `index` for modification.
    pub fn record_mut(&mut self, layout: &BlockLayout, index: usize) -> Option<&mut [u8]> {
        if index >= layout.max_records(0) {
            return None;
        }
        let off = layout.record_offset(index);
        Some(&mut self.data[off..off + layout.rec_len()])
    }

    /// Returns node key `index`, or None past the block's capacity.
    pub fn key(&self, layout: &BlockLayout, index: usize) -> Option<&[u8]> {
        if index >= layout.max_records(1) {
            return None;
        }
        let off = layout.key_offset(index);
        Some(&self.data[off..off + layout.key_len()])
    }

    /// Returns node key `index` for modification.
    pub fn key_mut(&mut self, layout: &BlockLayout, index: usize) -> Option<&mut [u8]> {
        if index >= layout.max_records(1) {
            return None;
        }
        let off = layout.key_offset(index);
        Some(&mut self.data[off..off + layout.key_len()])
    }

    /// Returns node pointer `index`.
    pub fn ptr(&self, layout: &BlockLayout, index: usize) -> Option<BtreePtr> {
        if index >= layout.max_records(1) {
            return None;
        }
        let off = layout.ptr_offset(index);
        Some(BtreePtr::decode(layout.width(), &self.data[off..]))
    }

    /// Sets node pointer `index`. Returns false past the block's capacity.
    pub fn set_ptr(&mut self, layout: &BlockLayout, index: usize, ptr: BtreePtr) -> bool {
        if index >= layout.max_records(1) {
            return false;
        }
        let off = layout.ptr_offset(index);
        ptr.encode(&mut self.data[off..]);
        true
    }

    /// Decodes the buffer as the tree header block.
    pub fn head(&self) -> MemHead {
        MemHead::from_bytes(&self.data[..])
    }

    /// Encodes the tree header block.
    pub fn set_head(&mut self, head: &MemHead) {
        self.data[..MemHead::SIZE].copy_from_slice(&head.to_bytes());
    }
}

impl std::fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuf")
            .field("block", &self.block)
            .field("level", &self.level())
            .field("numrecs", &self.numrecs())
            .finish()
    }
}
