//! Cursors over in-memory B+trees.
//!
//! A cursor carries the path from the root to its current record plus a
//! working record. The generic tree algorithms drive it; this module
//! supplies the storage hooks they need: root access through the header
//! block, block allocation, and record limits.

use super::constants::HEAD_BLOCK;
use super::index::MemBtree;
use super::trans::Transaction;
use super::types::BtreePtr;
use memtree_common::{MemtreeError, PointerWidth, Result};
use std::sync::Arc;
use tracing::trace;

/// Allocation group a per-group tree is built for.
///
/// Cursors share it by reference count; duplicating a cursor takes another
/// reference.
#[derive(Debug, PartialEq, Eq)]
pub struct AllocGroup {
    agno: u32,
}

impl AllocGroup {
    /// Creates a shareable group handle.
    pub fn new(agno: u32) -> Arc<Self> {
        Arc::new(Self { agno })
    }

    /// Returns the group number.
    pub fn agno(&self) -> u32 {
        self.agno
    }
}

/// Position of a cursor at one tree level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorLevel {
    /// Block the cursor sits in, if any.
    pub ptr: Option<BtreePtr>,
    /// Record or key index within the block.
    pub index: usize,
}

/// A position in one in-memory tree.
#[derive(Debug)]
pub struct BtreeCursor {
    tree: Arc<MemBtree>,
    group: Option<Arc<AllocGroup>>,
    nlevels: u32,
    levels: Vec<CursorLevel>,
    rec: Vec<u8>,
}

impl BtreeCursor {
    /// Creates a cursor at the tree's current height.
    ///
    /// Short-pointer trees are per-group and take the group they index.
    pub fn new(
        tree: Arc<MemBtree>,
        tx: &mut Transaction,
        group: Option<Arc<AllocGroup>>,
    ) -> Result<Self> {
        if tree.pointer_width() == PointerWidth::Short && group.is_none() {
            return Err(MemtreeError::InvalidParameter {
                name: "group".to_string(),
                value: "none".to_string(),
            });
        }
        let nlevels = tx.head_buf()?.head().nlevels;
        let levels = vec![
            CursorLevel {
                ptr: None,
                index: 0,
            };
            tree.ops().max_levels() as usize
        ];
        let rec = vec![0u8; tree.layout().rec_len()];
        Ok(Self {
            tree,
            group,
            nlevels,
            levels,
            rec,
        })
    }

    /// Returns the tree the cursor walks.
    pub fn tree(&self) -> &Arc<MemBtree> {
        &self.tree
    }

    /// Returns the group, for per-group trees.
    pub fn group(&self) -> Option<&Arc<AllocGroup>> {
        self.group.as_ref()
    }

    /// Returns the tree height the cursor last saw.
    pub fn nlevels(&self) -> u32 {
        self.nlevels
    }

    /// Returns the cursor position at `level`.
    pub fn level(&self, level: usize) -> Option<&CursorLevel> {
        self.levels.get(level)
    }

    /// Returns the cursor position at `level` for modification.
    pub fn level_mut(&mut self, level: usize) -> Option<&mut CursorLevel> {
        self.levels.get_mut(level)
    }

    /// Returns the working record.
    pub fn record(&self) -> &[u8] {
        &self.rec
    }

    /// Returns the working record for modification.
    pub fn record_mut(&mut self) -> &mut [u8] {
        &mut self.rec
    }

    /// Makes a copy positioned identically. The group reference is shared.
    pub fn dup_cursor(&self) -> Self {
        trace!(btree = self.tree.ops().name(), "dup cursor");
        Self {
            tree: Arc::clone(&self.tree),
            group: self.group.clone(),
            nlevels: self.nlevels,
            levels: self.levels.clone(),
            rec: self.rec.clone(),
        }
    }

    /// Points the header block at a new root and adjusts the height by `inc`.
    ///
    /// The header change is logged dirty in `tx`.
    pub fn set_root(&mut self, tx: &mut Transaction, ptr: BtreePtr, inc: i32) -> Result<()> {
        self.tree.check_ptr(ptr, 0, self.nlevels)?;

        let head_buf = tx.head_buf()?;
        let mut head = head_buf.head();
        let nlevels = head
            .nlevels
            .checked_add_signed(inc)
            .filter(|&n| n >= 1 && n <= self.tree.ops().max_levels())
            .ok_or_else(|| MemtreeError::InvalidParameter {
                name: "inc".to_string(),
                value: format!("{} on {} levels", inc, head.nlevels),
            })?;

        head.root = ptr.block();
        head.nlevels = nlevels;
        head_buf.set_head(&head);
        tx.mark_dirty(HEAD_BLOCK);

        self.nlevels = nlevels;
        trace!(btree = self.tree.ops().name(), root = %ptr, nlevels, "set root");
        Ok(())
    }

    /// Returns the root pointer recorded in the header block.
    pub fn init_ptr_from_root(&self, tx: &mut Transaction) -> Result<BtreePtr> {
        let root = tx.head_buf()?.head().root;
        BtreePtr::from_block(self.tree.pointer_width(), root)
            .ok_or(MemtreeError::OutOfAddressSpace { block: root })
    }

    /// Allocates a block for the tree. None means short pointers cannot
    /// address any more blocks.
    pub fn alloc_block(&self) -> Result<Option<BtreePtr>> {
        self.tree.allocate_block()
    }

    /// Returns the block behind `ptr` to the allocator.
    pub fn free_block(&self, ptr: BtreePtr) -> Result<()> {
        self.tree.free_block(ptr.block(), 1)
    }

    /// Maximum records at `level`.
    pub fn max_records(&self, level: u16) -> usize {
        self.tree.max_records(level)
    }

    /// Minimum records at `level`.
    pub fn min_records(&self, level: u16) -> usize {
        self.tree.min_records(level)
    }

    /// Checks a pointer found at `index` in a block at `level`.
    pub fn check_ptr(&self, ptr: BtreePtr, index: u32, level: u32) -> Result<()> {
        self.tree.check_ptr(ptr, index, level)
    }
}
