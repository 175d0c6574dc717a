//! In-memory B+tree instances backed by a virtual store.
//!
//! Store layout:
//! ```text
//! block 0    header block (root pointer, level count, owner, uuid)
//! block 1    leaf written at creation (the first root)
//! block 2..  allocated on demand; freed blocks are recycled first
//! ```

use super::constants::{HEAD_BLOCK, HEAD_MAGIC, INIT_LEAF_BLOCK};
use super::ops::BtreeOps;
use super::page::{BlockBuf, BlockLayout};
use super::types::{BlockHeader, BtreePtr, MemHead};
use crate::freespace::FreeSpaceSet;
use memtree_buffer::VirtualStore;
use memtree_common::page::{block_to_bytes, block_to_daddr, bytes_to_block};
use memtree_common::{
    BtreeConfig, CorruptionSite, MemtreeError, PointerWidth, Result, BLOCK_SIZE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Lifecycle of a tree instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeState {
    /// Header and empty root leaf written.
    Created,
    /// A transaction has registered changes.
    Populated,
    /// Changes were written back to the store.
    Committed,
    /// Changes were discarded.
    Cancelled,
    /// Store contents released.
    Destroyed,
}

impl TreeState {
    /// Returns true while the tree may still be modified.
    pub fn is_building(self) -> bool {
        matches!(self, TreeState::Created | TreeState::Populated)
    }
}

impl std::fmt::Display for TreeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TreeState::Created => "created",
            TreeState::Populated => "populated",
            TreeState::Committed => "committed",
            TreeState::Cancelled => "cancelled",
            TreeState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Block allocator state.
#[derive(Debug)]
struct AllocState {
    /// Blocks below `highest` that may be reused.
    freespace: FreeSpaceSet,
    /// One past the highest block ever handed out.
    highest: u64,
}

/// One staging tree bound to one virtual store.
pub struct MemBtree {
    store: Arc<VirtualStore>,
    ops: Arc<dyn BtreeOps>,
    config: BtreeConfig,
    layout: BlockLayout,
    alloc: Mutex<AllocState>,
    state: Mutex<TreeState>,
}

impl MemBtree {
    /// Creates a tree: writes an empty root leaf and the header block.
    pub fn create(
        store: Arc<VirtualStore>,
        config: BtreeConfig,
        ops: Arc<dyn BtreeOps>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if let Some(width) = ops.pointer_width() {
            if width != config.pointer_width {
                return Err(MemtreeError::InvalidParameter {
                    name: "pointer_width".to_string(),
                    value: config.pointer_width.to_string(),
                });
            }
        }

        let usable = BLOCK_SIZE - BlockHeader::len(config.pointer_width);
        let ptr_len = config.pointer_width.ptr_len();
        if ops.rec_len() == 0 || ops.rec_len() > usable {
            return Err(MemtreeError::InvalidParameter {
                name: "rec_len".to_string(),
                value: ops.rec_len().to_string(),
            });
        }
        if ops.key_len() == 0 || ops.key_len() + ptr_len > usable {
            return Err(MemtreeError::InvalidParameter {
                name: "key_len".to_string(),
                value: ops.key_len().to_string(),
            });
        }

        let layout = BlockLayout::new(config.pointer_width, ops.rec_len(), ops.key_len());
        let tree = Self {
            store,
            ops,
            config,
            layout,
            alloc: Mutex::new(AllocState {
                freespace: FreeSpaceSet::new(),
                highest: INIT_LEAF_BLOCK + 1,
            }),
            state: Mutex::new(TreeState::Created),
        };

        let mut leaf = BlockBuf::zeroed(INIT_LEAF_BLOCK);
        tree.init_block(&mut leaf, 0, 0);
        tree.store.write(leaf.offset(), leaf.data())?;

        let mut head = BlockBuf::zeroed(HEAD_BLOCK);
        head.set_head(&MemHead::new(
            tree.config.owner,
            INIT_LEAF_BLOCK,
            tree.config.meta_uuid,
        ));
        tree.store.write(head.offset(), head.data())?;

        debug!(
            store = tree.store.description(),
            btree = tree.ops.name(),
            owner = tree.config.owner,
            width = %tree.config.pointer_width,
            maxrecs_leaf = tree.layout.max_records(0),
            maxrecs_node = tree.layout.max_records(1),
            "created in-memory btree"
        );
        Ok(Arc::new(tree))
    }

    /// Returns the backing store.
    pub fn store(&self) -> &Arc<VirtualStore> {
        &self.store
    }

    /// Returns the tree-type operations.
    pub fn ops(&self) -> &Arc<dyn BtreeOps> {
        &self.ops
    }

    /// Returns the configuration.
    pub fn config(&self) -> &BtreeConfig {
        &self.config
    }

    /// Returns the owner tag.
    pub fn owner(&self) -> u64 {
        self.config.owner
    }

    /// Returns the pointer width.
    pub fn pointer_width(&self) -> PointerWidth {
        self.config.pointer_width
    }

    /// Returns the block geometry.
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> TreeState {
        *self.state.lock()
    }

    /// Returns one past the highest block handed out so far.
    pub fn highest_block(&self) -> u64 {
        self.alloc.lock().highest
    }

    /// Returns the number of freed blocks waiting for reuse.
    pub fn free_blocks(&self) -> u64 {
        self.alloc.lock().freespace.total_free()
    }

    /// Returns true if `block` is free for reuse.
    pub fn is_block_free(&self, block: u64) -> bool {
        self.alloc.lock().freespace.is_free(block, 1)
    }

    /// Maximum records at `level`.
    pub fn max_records(&self, level: u16) -> usize {
        self.layout.max_records(level)
    }

    /// Minimum records at `level`.
    pub fn min_records(&self, level: u16) -> usize {
        self.layout.min_records(level)
    }

    /// Fails unless the tree may still be modified.
    pub(crate) fn ensure_building(&self) -> Result<()> {
        let state = self.state();
        if !state.is_building() {
            return Err(MemtreeError::InvalidState(format!(
                "{} btree is {}",
                self.ops.name(),
                state
            )));
        }
        Ok(())
    }

    /// Moves to a new lifecycle state.
    pub(crate) fn set_state(&self, next: TreeState) {
        let mut state = self.state.lock();
        trace!(btree = self.ops.name(), from = %*state, to = %next, "btree state change");
        *state = next;
    }

    /// Hands out a block, preferring freed ones.
    ///
    /// Returns None when a short pointer cannot address the block; the taken
    /// block goes back to the allocator first. The block's pages are
    /// materialized before it is returned.
    pub fn allocate_block(&self) -> Result<Option<BtreePtr>> {
        self.ensure_building()?;

        let mut alloc = self.alloc.lock();
        let (block, recycled) = match alloc.freespace.take_first_free(0, u64::MAX) {
            Some(block) => (block, true),
            None => {
                let block = alloc.highest;
                alloc.highest += 1;
                (block, false)
            }
        };

        let undo = |alloc: &mut AllocState| {
            if recycled {
                alloc.freespace.mark_free(block, 1);
            } else {
                alloc.highest -= 1;
            }
        };

        let ptr = match self.config.pointer_width {
            PointerWidth::Short if block >= self.config.short_ptr_limit => None,
            width => BtreePtr::from_block(width, block),
        };
        let Some(ptr) = ptr else {
            undo(&mut alloc);
            debug!(btree = self.ops.name(), block, "short pointer space exhausted");
            return Ok(None);
        };

        if let Err(e) = self.store.preallocate(block_to_bytes(block), BLOCK_SIZE as u64) {
            undo(&mut alloc);
            return Err(e);
        }

        trace!(btree = self.ops.name(), block, recycled, "allocated btree block");
        Ok(Some(ptr))
    }

    /// Returns `count` blocks starting at `block` to the allocator.
    ///
    /// The contents are left in place; the verifier rejects them if they are
    /// ever read back without being reinitialized.
    pub fn free_block(&self, block: u64, count: u64) -> Result<()> {
        self.ensure_building()?;

        let mut alloc = self.alloc.lock();
        let end = block.checked_add(count);
        if count == 0 || block < INIT_LEAF_BLOCK || end.map_or(true, |e| e > alloc.highest) {
            return Err(MemtreeError::InvalidParameter {
                name: "block".to_string(),
                value: format!("{}+{}", block, count),
            });
        }

        alloc.freespace.mark_free(block, count);
        trace!(btree = self.ops.name(), block, count, "freed btree block");
        Ok(())
    }

    /// Converts a pointer to a store offset.
    pub fn ptr_to_offset(&self, ptr: BtreePtr) -> u64 {
        block_to_bytes(ptr.block())
    }

    /// Converts a pointer to a sector address.
    pub fn ptr_to_daddr(&self, ptr: BtreePtr) -> u64 {
        block_to_daddr(ptr.block())
    }

    /// Converts a store offset to a pointer of the configured width.
    pub fn offset_to_ptr(&self, offset: u64) -> Result<BtreePtr> {
        let block = bytes_to_block(offset);
        BtreePtr::from_block(self.config.pointer_width, block)
            .ok_or(MemtreeError::OutOfAddressSpace { block })
    }

    /// Returns the pointer addressing a block buffer.
    pub fn buf_to_ptr(&self, buf: &BlockBuf) -> Result<BtreePtr> {
        self.offset_to_ptr(buf.offset())
    }

    /// Returns true if `block` lies within the allocated range of the store.
    pub fn verify_block_no(&self, block: u64) -> bool {
        block < self.highest_block()
    }

    /// Rejects pointers outside the allocated range or at the header.
    ///
    /// `index` and `level` locate the pointer for the error report.
    pub fn check_ptr(&self, ptr: BtreePtr, index: u32, level: u32) -> Result<()> {
        let block = ptr.block();
        if ptr.width() == self.config.pointer_width
            && self.verify_block_no(block)
            && block >= INIT_LEAF_BLOCK
        {
            return Ok(());
        }

        warn!(
            btree = self.ops.name(),
            ptr = block,
            level,
            index,
            "corrupt in-memory btree pointer"
        );
        Err(MemtreeError::PointerOutOfRange {
            ptr: block,
            level,
            index,
        })
    }

    /// Checks the magic, record count and siblings of a block.
    pub fn verify_block(
        &self,
        buf: &BlockBuf,
        max_recs: usize,
    ) -> std::result::Result<(), CorruptionSite> {
        let header = buf.header(self.config.pointer_width);

        if header.magic != self.ops.magic() {
            return Err(CorruptionSite::BlockMagic);
        }
        if header.numrecs as usize > max_recs {
            return Err(CorruptionSite::RecordCount);
        }

        let sibling_ok = |sib: BtreePtr| {
            sib.is_null() || (sib.block() != buf.block() && self.verify_block_no(sib.block()))
        };
        if !sibling_ok(header.leftsib) {
            return Err(CorruptionSite::LeftSibling);
        }
        if !sibling_ok(header.rightsib) {
            return Err(CorruptionSite::RightSibling);
        }
        Ok(())
    }

    /// Full structural check run whenever a block is read or written back.
    pub fn verify_struct(&self, buf: &BlockBuf) -> std::result::Result<(), CorruptionSite> {
        let header = buf.header(self.config.pointer_width);

        if header.magic != self.ops.magic() {
            return Err(CorruptionSite::BlockMagic);
        }
        if header.uuid != self.config.meta_uuid {
            return Err(CorruptionSite::BlockUuid);
        }
        if header.blkno != buf.daddr() {
            return Err(CorruptionSite::BlockAddress);
        }
        if header.level as u32 >= self.ops.max_levels() {
            return Err(CorruptionSite::BlockLevel);
        }
        self.verify_block(buf, self.layout.max_records(header.level))
    }

    /// Checks that a block belongs to this tree.
    pub fn check_owner(&self, buf: &BlockBuf) -> std::result::Result<(), CorruptionSite> {
        let owner = buf.header(self.config.pointer_width).owner;
        let expected = match self.config.pointer_width {
            PointerWidth::Short => self.config.owner as u32 as u64,
            PointerWidth::Long => self.config.owner,
        };
        if owner != expected {
            return Err(CorruptionSite::BlockOwner);
        }
        Ok(())
    }

    /// Checks the header block's magic, level count and uuid.
    pub fn verify_head(&self, buf: &BlockBuf) -> std::result::Result<(), CorruptionSite> {
        let head = buf.head();
        if head.magic != HEAD_MAGIC {
            return Err(CorruptionSite::HeadMagic);
        }
        if head.nlevels == 0 {
            return Err(CorruptionSite::HeadLevels);
        }
        if head.uuid != self.config.meta_uuid {
            return Err(CorruptionSite::HeadUuid);
        }
        Ok(())
    }

    /// Header check plus ownership, as applied whenever the header is loaded.
    pub(crate) fn verify_head_owned(
        &self,
        buf: &BlockBuf,
    ) -> std::result::Result<(), CorruptionSite> {
        self.verify_head(buf)?;
        if buf.head().owner != self.config.owner {
            return Err(CorruptionSite::HeadOwner);
        }
        Ok(())
    }

    /// Node check plus ownership, as applied whenever a block is loaded.
    pub(crate) fn verify_node_owned(
        &self,
        buf: &BlockBuf,
    ) -> std::result::Result<(), CorruptionSite> {
        self.verify_struct(buf)?;
        self.check_owner(buf)
    }

    /// Formats a buffer as an empty block of this tree.
    pub fn init_block(&self, buf: &mut BlockBuf, level: u16, numrecs: u16) {
        buf.init_node(
            self.config.pointer_width,
            self.ops.magic(),
            level,
            self.config.owner,
            self.config.meta_uuid,
        );
        buf.set_numrecs(numrecs);
    }

    /// Reads the header block straight from the store and verifies it.
    pub fn read_head(&self) -> Result<MemHead> {
        let buf = self.load(HEAD_BLOCK)?;
        self.verify_head_owned(&buf)
            .map_err(|site| self.corruption(HEAD_BLOCK, site))?;
        Ok(buf.head())
    }

    /// Reads a tree block straight from the store and verifies it.
    pub fn read_block(&self, ptr: BtreePtr) -> Result<BlockBuf> {
        self.check_ptr(ptr, 0, 0)?;
        let block = ptr.block();
        let buf = self.load(block)?;
        self.verify_node_owned(&buf)
            .map_err(|site| self.corruption(block, site))?;
        Ok(buf)
    }

    /// Reads a block without verifying it.
    pub(crate) fn load(&self, block: u64) -> Result<BlockBuf> {
        let mut buf = BlockBuf::zeroed(block);
        self.store.read_into(block_to_bytes(block), &mut buf.data_mut()[..])?;
        Ok(buf)
    }

    /// Reports a verifier failure and builds the matching error.
    pub(crate) fn corruption(&self, block: u64, site: CorruptionSite) -> MemtreeError {
        warn!(
            store = self.store.description(),
            btree = self.ops.name(),
            block,
            %site,
            "metadata verifier rejected block"
        );
        MemtreeError::Corruption { block, site }
    }

    /// Releases the store contents. The tree cannot be used afterwards.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut alloc = self.alloc.lock();
            alloc.freespace.clear();
            alloc.highest = 0;
        }
        self.set_state(TreeState::Destroyed);
        self.store.discard_all()?;
        debug!(btree = self.ops.name(), owner = self.config.owner, "destroyed in-memory btree");
        Ok(())
    }
}

impl std::fmt::Debug for MemBtree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBtree")
            .field("ops", &self.ops.name())
            .field("owner", &self.config.owner)
            .field("width", &self.config.pointer_width)
            .field("state", &self.state())
            .field("highest_block", &self.highest_block())
            .finish()
    }
}
