//! Transaction buffer collector.
//!
//! A transaction holds detached copies of the blocks a construction step
//! touches. Nothing reaches the store until `commit`, and commit writes
//! either every dirty block or none of them:
//!
//! 1. every dirty block is verified; any failure discards the lot
//! 2. backing pages for every dirty block are materialized
//! 3. every dirty block is written
//!
//! Clean blocks are released without being written.

use super::constants::HEAD_BLOCK;
use super::index::{MemBtree, TreeState};
use super::page::BlockBuf;
use super::types::BtreePtr;
use memtree_common::page::block_to_bytes;
use memtree_common::{MemtreeError, Result, BLOCK_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One registration in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub block: u64,
    pub dirty: bool,
}

/// Blocks collected for one construction step of one tree.
pub struct Transaction {
    tree: Arc<MemBtree>,
    /// Registrations in the order they happened.
    log: Vec<LogEntry>,
    /// Latest contents of every registered block.
    bufs: BTreeMap<u64, BlockBuf>,
}

impl Transaction {
    /// Starts a transaction against a tree that is still being built.
    pub fn new(tree: &Arc<MemBtree>) -> Result<Self> {
        tree.ensure_building()?;
        trace!(btree = tree.ops().name(), "transaction started");
        Ok(Self {
            tree: Arc::clone(tree),
            log: Vec::new(),
            bufs: BTreeMap::new(),
        })
    }

    /// Returns the tree this transaction modifies.
    pub fn tree(&self) -> &Arc<MemBtree> {
        &self.tree
    }

    /// Returns the registrations so far.
    pub fn log(&self) -> &[LogEntry] {
        &self.log
    }

    /// Returns the number of distinct blocks held.
    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    /// Returns true if no block is held.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Returns true if `block` has been registered dirty.
    pub fn is_dirty(&self, block: u64) -> bool {
        self.log.iter().any(|e| e.block == block && e.dirty)
    }

    /// Returns the number of distinct dirty blocks.
    pub fn dirty_count(&self) -> usize {
        self.dirty_blocks().len()
    }

    /// Returns a held block, if any.
    pub fn buf(&self, block: u64) -> Option<&BlockBuf> {
        self.bufs.get(&block)
    }

    /// Returns a held block for modification. Call `mark_dirty` afterwards.
    pub fn buf_mut(&mut self, block: u64) -> Option<&mut BlockBuf> {
        self.bufs.get_mut(&block)
    }

    /// Adds a block to the transaction, replacing any held copy.
    pub fn register(&mut self, buf: BlockBuf, dirty: bool) -> Result<()> {
        self.tree.ensure_building()?;
        let block = buf.block();
        self.bufs.insert(block, buf);
        self.log_entry(block, dirty);
        Ok(())
    }

    /// Marks a held block dirty. Returns false if the block is not held.
    pub fn mark_dirty(&mut self, block: u64) -> bool {
        if !self.bufs.contains_key(&block) {
            return false;
        }
        self.log_entry(block, true);
        true
    }

    /// Returns the tree block at `ptr`, loading and verifying it on first
    /// use. The block is registered clean.
    pub fn read_buf(&mut self, ptr: BtreePtr) -> Result<&mut BlockBuf> {
        let block = ptr.block();
        if !self.bufs.contains_key(&block) {
            self.tree.ensure_building()?;
            let buf = self.tree.read_block(ptr)?;
            self.bufs.insert(block, buf);
            self.log_entry(block, false);
        }
        self.bufs
            .get_mut(&block)
            .ok_or_else(|| MemtreeError::InvalidState(format!("block {} not held", block)))
    }

    /// Returns a zeroed buffer for a freshly allocated block, registered
    /// clean. Format it with `MemBtree::init_block` and mark it dirty.
    pub fn get_buf(&mut self, ptr: BtreePtr) -> Result<&mut BlockBuf> {
        self.tree.check_ptr(ptr, 0, 0)?;
        self.register(BlockBuf::zeroed(ptr.block()), false)?;
        self.bufs
            .get_mut(&ptr.block())
            .ok_or_else(|| MemtreeError::InvalidState(format!("block {} not held", ptr)))
    }

    /// Returns the header block, loading and verifying it on first use.
    pub fn head_buf(&mut self) -> Result<&mut BlockBuf> {
        if !self.bufs.contains_key(&HEAD_BLOCK) {
            self.tree.ensure_building()?;
            let buf = self.tree.load(HEAD_BLOCK)?;
            self.tree
                .verify_head_owned(&buf)
                .map_err(|site| self.tree.corruption(HEAD_BLOCK, site))?;
            self.bufs.insert(HEAD_BLOCK, buf);
            self.log_entry(HEAD_BLOCK, false);
        }
        self.bufs
            .get_mut(&HEAD_BLOCK)
            .ok_or_else(|| MemtreeError::InvalidState("header block not held".to_string()))
    }

    /// Writes every dirty block back to the store, or none of them.
    ///
    /// A verifier failure on any dirty block discards every change and
    /// returns the first failure; the tree keeps its pre-transaction
    /// contents and may be retried or cancelled. The transaction is empty
    /// afterwards either way.
    ///
    /// A tree that is no longer being built (cancelled, committed by another
    /// transaction, or destroyed) rejects the commit with `InvalidState`.
    ///
    /// Backing pages are materialized before the first write, so a store
    /// that runs out of space fails the commit with nothing written. A
    /// write that still fails after that leaves the blocks written before
    /// it in the store; the error is fatal for the construction.
    pub fn commit(&mut self) -> Result<()> {
        let dirty = self.dirty_blocks();
        let bufs = std::mem::take(&mut self.bufs);
        self.log.clear();

        if let Err(err) = self.tree.ensure_building() {
            debug!(
                btree = self.tree.ops().name(),
                dirty = dirty.len(),
                state = %self.tree.state(),
                "transaction commit refused"
            );
            return Err(err);
        }

        let mut failure = None;
        for &block in &dirty {
            let Some(buf) = bufs.get(&block) else {
                continue;
            };
            let verdict = if block == HEAD_BLOCK {
                self.tree.verify_head_owned(buf)
            } else {
                self.tree.verify_node_owned(buf)
            };
            if let Err(site) = verdict {
                let err = self.tree.corruption(block, site);
                failure.get_or_insert(err);
            }
        }
        if let Some(err) = failure {
            debug!(
                btree = self.tree.ops().name(),
                dirty = dirty.len(),
                "transaction commit aborted"
            );
            return Err(err);
        }

        let store = self.tree.store();
        for &block in &dirty {
            store.preallocate(block_to_bytes(block), BLOCK_SIZE as u64)?;
        }
        let mut written = 0;
        for &block in &dirty {
            let Some(buf) = bufs.get(&block) else {
                continue;
            };
            if let Err(err) = store.write(buf.offset(), buf.data()) {
                warn!(
                    btree = self.tree.ops().name(),
                    block,
                    written,
                    remaining = dirty.len() - written,
                    error = %err,
                    "transaction commit interrupted after partial write"
                );
                return Err(err);
            }
            written += 1;
        }

        if self.tree.state().is_building() {
            self.tree.set_state(TreeState::Committed);
        }
        debug!(
            btree = self.tree.ops().name(),
            written,
            released = bufs.len() - written,
            "transaction committed"
        );
        Ok(())
    }

    /// Discards every change. Nothing is written to the store.
    pub fn cancel(&mut self) {
        let held = self.bufs.len();
        self.bufs.clear();
        self.log.clear();
        if self.tree.state().is_building() {
            self.tree.set_state(TreeState::Cancelled);
        }
        debug!(btree = self.tree.ops().name(), released = held, "transaction cancelled");
    }

    fn log_entry(&mut self, block: u64, dirty: bool) {
        if dirty && self.tree.state() == TreeState::Created {
            self.tree.set_state(TreeState::Populated);
        }
        self.log.push(LogEntry { block, dirty });
    }

    fn dirty_blocks(&self) -> BTreeSet<u64> {
        self.log
            .iter()
            .filter(|e| e.dirty)
            .map(|e| e.block)
            .collect()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("btree", &self.tree.ops().name())
            .field("held", &self.bufs.len())
            .field("log_entries", &self.log.len())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.bufs.is_empty() {
            trace!(
                btree = self.tree.ops().name(),
                held = self.bufs.len(),
                "transaction dropped without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::rcbag::{RcbagOps, RcbagRec};
    use memtree_buffer::VirtualStore;
    use memtree_common::{BtreeConfig, CorruptionSite, PointerWidth, StoreConfig};

    fn new_tree() -> Arc<MemBtree> {
        let store = Arc::new(VirtualStore::new(StoreConfig::named("trans test")).unwrap());
        MemBtree::create(
            store,
            BtreeConfig::new(9, PointerWidth::Long),
            Arc::new(RcbagOps),
        )
        .unwrap()
    }

    fn new_leaf(tree: &Arc<MemBtree>, tx: &mut Transaction, start: u64) -> u64 {
        let ptr = tree.allocate_block().unwrap().unwrap();
        let layout = *tree.layout();
        let buf = tx.get_buf(ptr).unwrap();
        tree.init_block(buf, 0, 1);
        let rec = RcbagRec {
            start_block: start,
            block_count: 1,
            refcount: 1,
        };
        buf.record_mut(&layout, 0)
            .unwrap()
            .copy_from_slice(&rec.to_bytes());
        assert!(tx.mark_dirty(ptr.block()));
        ptr.block()
    }

    #[test]
    fn test_new_requires_building_tree() {
        let tree = new_tree();
        assert!(Transaction::new(&tree).is_ok());

        let mut tx = Transaction::new(&tree).unwrap();
        tx.cancel();
        assert!(matches!(
            Transaction::new(&tree),
            Err(MemtreeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_register_moves_tree_to_populated() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();

        tx.read_buf(BtreePtr::Long(1)).unwrap();
        assert_eq!(tree.state(), TreeState::Created);
        assert!(!tx.is_dirty(1));

        assert!(tx.mark_dirty(1));
        assert_eq!(tree.state(), TreeState::Populated);
        assert!(tx.is_dirty(1));
        assert!(!tx.mark_dirty(5));

        assert_eq!(tx.len(), 1);
        assert_eq!(
            tx.log(),
            &[
                LogEntry {
                    block: 1,
                    dirty: false
                },
                LogEntry {
                    block: 1,
                    dirty: true
                }
            ]
        );
    }

    #[test]
    fn test_read_buf_reuses_held_copy() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();

        tx.read_buf(BtreePtr::Long(1)).unwrap().set_numrecs(3);
        assert_eq!(tx.read_buf(BtreePtr::Long(1)).unwrap().numrecs(), 3);
        assert_eq!(tx.log().len(), 1);
    }

    #[test]
    fn test_commit_writes_only_dirty_blocks() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();

        let block = new_leaf(&tree, &mut tx, 100);
        // Modified but never marked dirty: stays out of the store.
        tx.read_buf(BtreePtr::Long(1)).unwrap().set_numrecs(5);

        tx.commit().unwrap();
        assert!(tx.is_empty());
        assert!(tx.log().is_empty());
        assert_eq!(tree.state(), TreeState::Committed);

        let leaf = tree.read_block(BtreePtr::Long(block)).unwrap();
        let rec = RcbagRec::from_bytes(leaf.record(tree.layout(), 0).unwrap());
        assert_eq!(rec.start_block, 100);
        assert_eq!(tree.read_block(BtreePtr::Long(1)).unwrap().numrecs(), 0);
    }

    #[test]
    fn test_commit_rejects_corrupt_block() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();

        let good = new_leaf(&tree, &mut tx, 1);
        let bad = new_leaf(&tree, &mut tx, 2);
        tx.buf_mut(bad).unwrap().set_numrecs(1000);

        let err = tx.commit().unwrap_err();
        assert!(matches!(
            err,
            MemtreeError::Corruption {
                site: CorruptionSite::RecordCount,
                ..
            }
        ));
        assert!(tx.is_empty());
        assert_eq!(tree.state(), TreeState::Populated);
        assert!(tree.read_block(BtreePtr::Long(good)).is_err());
    }

    #[test]
    fn test_commit_header_changes() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();

        let mut head = tx.head_buf().unwrap().head();
        head.nlevels = 0;
        tx.head_buf().unwrap().set_head(&head);
        assert!(tx.mark_dirty(HEAD_BLOCK));

        let err = tx.commit().unwrap_err();
        assert!(matches!(
            err,
            MemtreeError::Corruption {
                block: 0,
                site: CorruptionSite::HeadLevels
            }
        ));
        assert_eq!(tree.read_head().unwrap().nlevels, 1);
    }

    #[test]
    fn test_commit_after_sibling_cancel_is_refused() {
        let tree = new_tree();
        let mut a = Transaction::new(&tree).unwrap();
        let mut b = Transaction::new(&tree).unwrap();

        b.read_buf(BtreePtr::Long(1)).unwrap().set_numrecs(7);
        assert!(b.mark_dirty(1));
        a.cancel();

        let err = b.commit().unwrap_err();
        assert!(matches!(err, MemtreeError::InvalidState(_)));
        assert!(b.is_empty());
        assert!(b.log().is_empty());
        assert_eq!(tree.state(), TreeState::Cancelled);
        assert_eq!(tree.load(1).unwrap().numrecs(), 0);
    }

    #[test]
    fn test_commit_after_destroy_is_refused() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();
        new_leaf(&tree, &mut tx, 1);

        tree.destroy().unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, MemtreeError::InvalidState(_)));
        assert!(tx.is_empty());
        assert_eq!(tree.state(), TreeState::Destroyed);
        assert_eq!(tree.store().size(), 0);
        assert_eq!(tree.store().stat().bytes_used(), 0);
    }

    #[test]
    fn test_cancel_discards_everything() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();
        let before = tree.store().read(0, 4 * BLOCK_SIZE).unwrap();

        new_leaf(&tree, &mut tx, 1);
        new_leaf(&tree, &mut tx, 2);
        tx.cancel();

        assert!(tx.is_empty());
        assert_eq!(tree.state(), TreeState::Cancelled);
        assert_eq!(tree.store().read(0, 4 * BLOCK_SIZE).unwrap(), before);
        assert!(tx.register(BlockBuf::zeroed(2), true).is_err());
    }

    #[test]
    fn test_get_buf_rejects_unallocated_block() {
        let tree = new_tree();
        let mut tx = Transaction::new(&tree).unwrap();
        assert!(tx.get_buf(BtreePtr::Long(7)).is_err());
        assert!(tx.get_buf(BtreePtr::Long(0)).is_err());
        assert!(tx.is_empty());
    }
}
