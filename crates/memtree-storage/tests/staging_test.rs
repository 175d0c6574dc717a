//! Staging tree integration tests.
//!
//! Builds small trees end to end against a real virtual store:
//! - Header and block layout after commit
//! - All-or-nothing commit when a verifier rejects a block
//! - Cancel leaving the store untouched
//! - Trees larger than the resident page budget
//! - Allocator reuse under a random workload

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use memtree_buffer::VirtualStore;
use memtree_common::{
    BtreeConfig, ErrorKind, MemtreeError, PointerWidth, StoreConfig, BLOCK_SIZE,
};
use memtree_storage::{
    AllocGroup, BlockBuf, BlockLayout, BtreeCursor, BtreeOps, BtreePtr, MemBtree, RcbagOps,
    RcbagRec, Transaction, TreeState, HEAD_MAGIC,
};

// =============================================================================
// Test Tree Type
// =============================================================================

const EXTENT_MAGIC: u32 = 0x4558_5431;

/// Per-group extent records: 8-byte start, 8-byte length. Keyed by start.
#[derive(Debug)]
struct ExtentOps;

impl BtreeOps for ExtentOps {
    fn name(&self) -> &'static str {
        "extent"
    }

    fn magic(&self) -> u32 {
        EXTENT_MAGIC
    }

    fn rec_len(&self) -> usize {
        16
    }

    fn key_len(&self) -> usize {
        8
    }

    fn max_levels(&self) -> u32 {
        6
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

fn extent(start: u64, len: u64) -> [u8; 16] {
    let mut rec = [0u8; 16];
    rec[..8].copy_from_slice(&start.to_be_bytes());
    rec[8..].copy_from_slice(&len.to_be_bytes());
    rec
}

fn extent_start(rec: &[u8]) -> u64 {
    u64::from_be_bytes(rec[..8].try_into().unwrap())
}

// =============================================================================
// Helpers
// =============================================================================

fn extent_tree(store_config: StoreConfig, owner: u64) -> Arc<MemBtree> {
    let store = Arc::new(VirtualStore::new(store_config).unwrap());
    MemBtree::create(
        store,
        BtreeConfig::new(owner, PointerWidth::Short),
        Arc::new(ExtentOps),
    )
    .unwrap()
}

/// Allocates a leaf holding one extent record and logs it dirty.
fn add_leaf(tree: &Arc<MemBtree>, tx: &mut Transaction, start: u64) -> BtreePtr {
    let ptr = tree.allocate_block().unwrap().unwrap();
    let layout = *tree.layout();
    let buf = tx.get_buf(ptr).unwrap();
    tree.init_block(buf, 0, 1);
    buf.record_mut(&layout, 0)
        .unwrap()
        .copy_from_slice(&extent(start, 1));
    assert!(tx.mark_dirty(ptr.block()));
    ptr
}

/// Links leaves left to right through their sibling pointers.
fn link_siblings(tree: &Arc<MemBtree>, tx: &mut Transaction, leaves: &[BtreePtr]) {
    let width = tree.pointer_width();
    for (i, ptr) in leaves.iter().enumerate() {
        let buf = tx.buf_mut(ptr.block()).unwrap();
        let mut header = buf.header(width);
        if i > 0 {
            header.leftsib = leaves[i - 1];
        }
        if i + 1 < leaves.len() {
            header.rightsib = leaves[i + 1];
        }
        buf.set_header(&header);
        tx.mark_dirty(ptr.block());
    }
}

/// Allocates a level-1 node pointing at `children`, keyed by their first record.
fn add_node(tree: &Arc<MemBtree>, tx: &mut Transaction, children: &[BtreePtr]) -> BtreePtr {
    let layout: BlockLayout = *tree.layout();
    let keys: Vec<[u8; 8]> = children
        .iter()
        .map(|child| {
            let rec = tx.buf(child.block()).unwrap().record(&layout, 0).unwrap();
            let mut key = [0u8; 8];
            tree.ops().key_from_record(rec, &mut key);
            key
        })
        .collect();

    let ptr = tree.allocate_block().unwrap().unwrap();
    let buf = tx.get_buf(ptr).unwrap();
    tree.init_block(buf, 1, children.len() as u16);
    for (i, (child, key)) in children.iter().zip(&keys).enumerate() {
        buf.key_mut(&layout, i).unwrap().copy_from_slice(key);
        assert!(buf.set_ptr(&layout, i, *child));
    }
    tx.mark_dirty(ptr.block());
    ptr
}

fn snapshot(tree: &MemBtree, blocks: &[BtreePtr]) -> Vec<Vec<u8>> {
    blocks
        .iter()
        .map(|ptr| {
            tree.store()
                .read(tree.ptr_to_offset(*ptr), BLOCK_SIZE)
                .unwrap()
                .to_vec()
        })
        .collect()
}

// =============================================================================
// End to End
// =============================================================================

#[test]
fn test_build_commit_and_reopen() {
    let config: BtreeConfig = serde_json::from_str(
        r#"{
            "owner": 42,
            "pointer_width": "Short",
            "meta_uuid": [1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16],
            "short_ptr_limit": 2147483647
        }"#,
    )
    .unwrap();
    let store = Arc::new(VirtualStore::new(StoreConfig::named("e2e")).unwrap());
    let tree = MemBtree::create(store, config, Arc::new(ExtentOps)).unwrap();

    let mut tx = Transaction::new(&tree).unwrap();
    let group = AllocGroup::new(0);
    let mut cur = BtreeCursor::new(Arc::clone(&tree), &mut tx, Some(group)).unwrap();
    assert_eq!(cur.init_ptr_from_root(&mut tx).unwrap(), BtreePtr::Short(1));

    let leaves: Vec<BtreePtr> = [10u64, 20, 30]
        .iter()
        .map(|&start| add_leaf(&tree, &mut tx, start))
        .collect();
    link_siblings(&tree, &mut tx, &leaves);
    let root = add_node(&tree, &mut tx, &leaves);
    cur.set_root(&mut tx, root, 1).unwrap();
    assert_eq!(tree.state(), TreeState::Populated);

    tx.commit().unwrap();
    assert!(tx.is_empty());
    assert_eq!(tree.state(), TreeState::Committed);

    // Reopen from the header block alone.
    let head = tree.read_head().unwrap();
    assert_eq!(head.magic, HEAD_MAGIC);
    assert_eq!(head.nlevels, 2);
    assert_eq!(head.owner, 42);
    assert_eq!(head.root, root.block());

    let layout = *tree.layout();
    let root_buf = tree.read_block(BtreePtr::Short(head.root as u32)).unwrap();
    assert_eq!(root_buf.level(), 1);
    assert_eq!(root_buf.numrecs(), 3);
    assert_eq!(
        root_buf.header(PointerWidth::Short).owner,
        42,
        "owner stamped into every block"
    );

    let mut starts = Vec::new();
    for i in 0..root_buf.numrecs() as usize {
        let child = root_buf.ptr(&layout, i).unwrap();
        tree.check_ptr(child, i as u32, 1).unwrap();
        let leaf = tree.read_block(child).unwrap();
        starts.push(extent_start(leaf.record(&layout, 0).unwrap()));
    }
    assert_eq!(starts, vec![10, 20, 30]);

    let middle = tree.read_block(leaves[1]).unwrap().header(PointerWidth::Short);
    assert_eq!(middle.leftsib, leaves[0]);
    assert_eq!(middle.rightsib, leaves[2]);

    // A committed tree takes no further construction steps.
    assert!(Transaction::new(&tree).is_err());
    assert!(tree.allocate_block().is_err());
}

#[test]
fn test_leaf_root_reopen() {
    let tree = extent_tree(StoreConfig::named("leaf root"), 42);
    let mut tx = Transaction::new(&tree).unwrap();
    let mut cur =
        BtreeCursor::new(Arc::clone(&tree), &mut tx, Some(AllocGroup::new(2))).unwrap();

    let leaves: Vec<BtreePtr> = [5u64, 6, 7]
        .iter()
        .map(|&start| add_leaf(&tree, &mut tx, start))
        .collect();
    for ptr in &leaves {
        assert!(!tree.is_block_free(ptr.block()));
    }
    cur.set_root(&mut tx, leaves[2], 0).unwrap();
    tx.commit().unwrap();

    let head = tree.read_head().unwrap();
    assert_eq!(head.nlevels, 1);
    assert_eq!(head.owner, 42);

    let root = tree.offset_to_ptr(head.root * BLOCK_SIZE as u64).unwrap();
    let buf = tree.read_block(root).unwrap();
    assert_eq!(tree.verify_struct(&buf), Ok(()));
    assert_eq!(tree.check_owner(&buf), Ok(()));
    assert_eq!(buf.header(PointerWidth::Short).owner, 42);
    assert_eq!(extent_start(buf.record(tree.layout(), 0).unwrap()), 7);
}

#[test]
fn test_long_pointer_rcbag_tree() {
    let store = Arc::new(VirtualStore::new(StoreConfig::named("rcbag")).unwrap());
    let tree = MemBtree::create(
        store,
        BtreeConfig::new(u64::MAX - 1, PointerWidth::Long),
        Arc::new(RcbagOps),
    )
    .unwrap();
    let layout = *tree.layout();

    let mut tx = Transaction::new(&tree).unwrap();
    let root = tx.read_buf(BtreePtr::Long(1)).unwrap();
    let recs: Vec<RcbagRec> = (0..100u64)
        .map(|i| RcbagRec {
            start_block: i * 8,
            block_count: 8,
            refcount: i % 3 + 1,
        })
        .collect();
    for (i, rec) in recs.iter().enumerate() {
        root.record_mut(&layout, i)
            .unwrap()
            .copy_from_slice(&rec.to_bytes());
    }
    root.set_numrecs(recs.len() as u16);
    tx.mark_dirty(1);
    tx.commit().unwrap();

    let leaf = tree.read_block(BtreePtr::Long(1)).unwrap();
    assert_eq!(leaf.header(PointerWidth::Long).owner, u64::MAX - 1);
    for i in 1..leaf.numrecs() as usize {
        let prev = leaf.record(&layout, i - 1).unwrap();
        let next = leaf.record(&layout, i).unwrap();
        assert!(tree.ops().records_in_order(prev, next));
    }
    assert_eq!(
        RcbagRec::from_bytes(leaf.record(&layout, 99).unwrap()),
        recs[99]
    );
}

// =============================================================================
// Commit and Cancel
// =============================================================================

#[test]
fn test_commit_is_all_or_nothing() {
    let tree = extent_tree(StoreConfig::named("atomic"), 7);
    let mut tx = Transaction::new(&tree).unwrap();

    let blocks: Vec<BtreePtr> = (0..3)
        .map(|_| tree.allocate_block().unwrap().unwrap())
        .collect();
    let before = snapshot(&tree, &blocks);

    let layout = *tree.layout();
    for (i, ptr) in blocks.iter().enumerate() {
        let buf = tx.get_buf(*ptr).unwrap();
        tree.init_block(buf, 0, 1);
        buf.record_mut(&layout, 0)
            .unwrap()
            .copy_from_slice(&extent(i as u64, 1));
        tx.mark_dirty(ptr.block());
    }

    // Break the magic of the middle block.
    let buf = tx.buf_mut(blocks[1].block()).unwrap();
    let mut header = buf.header(PointerWidth::Short);
    header.magic = 0xBAD0_BAD0;
    buf.set_header(&header);

    let err = tx.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StructuralCorruption);
    assert!(!err.is_fatal());
    assert!(tx.is_empty());
    assert_eq!(snapshot(&tree, &blocks), before);

    // The tree is still under construction and a clean retry succeeds.
    let mut retry = Transaction::new(&tree).unwrap();
    for ptr in &blocks {
        let buf = retry.get_buf(*ptr).unwrap();
        tree.init_block(buf, 0, 0);
        retry.mark_dirty(ptr.block());
    }
    retry.commit().unwrap();
    for ptr in &blocks {
        assert_eq!(tree.read_block(*ptr).unwrap().numrecs(), 0);
    }
}

#[test]
fn test_cancel_leaves_store_untouched() {
    let tree = extent_tree(StoreConfig::named("cancel"), 7);
    let mut tx = Transaction::new(&tree).unwrap();

    let blocks: Vec<BtreePtr> = (0..5)
        .map(|_| tree.allocate_block().unwrap().unwrap())
        .collect();
    let mut all = blocks.clone();
    all.push(BtreePtr::Short(0));
    all.push(BtreePtr::Short(1));
    let before = snapshot(&tree, &all);

    for (i, ptr) in blocks.iter().enumerate() {
        let buf = tx.get_buf(*ptr).unwrap();
        tree.init_block(buf, 0, 0);
        buf.data_mut()[BLOCK_SIZE - 1] = i as u8;
        tx.mark_dirty(ptr.block());
    }
    let mut cur =
        BtreeCursor::new(Arc::clone(&tree), &mut tx, Some(AllocGroup::new(1))).unwrap();
    cur.set_root(&mut tx, blocks[0], 0).unwrap();
    assert_eq!(tx.dirty_count(), 6);

    tx.cancel();

    assert!(tx.is_empty());
    assert!(tx.log().is_empty());
    assert_eq!(tree.state(), TreeState::Cancelled);
    assert_eq!(snapshot(&tree, &all), before);
    assert_eq!(tree.read_head().unwrap().root, 1);
}

#[test]
fn test_dropped_transaction_writes_nothing() {
    let tree = extent_tree(StoreConfig::named("drop"), 7);
    {
        let mut tx = Transaction::new(&tree).unwrap();
        let leaf = tx.read_buf(BtreePtr::Short(1)).unwrap();
        leaf.set_numrecs(9);
        tx.mark_dirty(1);
    }
    assert_eq!(tree.read_block(BtreePtr::Short(1)).unwrap().numrecs(), 0);
}

// =============================================================================
// Store Pressure
// =============================================================================

#[test]
fn test_tree_larger_than_resident_budget() {
    let store_config = StoreConfig {
        max_resident_pages: 4,
        cache_entries: 2,
        ..StoreConfig::named("pressure")
    };
    let tree = extent_tree(store_config, 3);
    let mut tx = Transaction::new(&tree).unwrap();

    let leaves: Vec<BtreePtr> = (0..40u64)
        .map(|i| add_leaf(&tree, &mut tx, i * 100))
        .collect();
    link_siblings(&tree, &mut tx, &leaves);
    tx.commit().unwrap();

    let stat = tree.store().stat();
    assert!(stat.resident_bytes <= 4 * BLOCK_SIZE as u64);
    assert!(stat.swapped_bytes > 0);

    let layout = *tree.layout();
    for (i, ptr) in leaves.iter().enumerate() {
        let leaf = tree.read_block(*ptr).unwrap();
        assert_eq!(extent_start(leaf.record(&layout, 0).unwrap()), i as u64 * 100);
    }
}

#[test]
fn test_store_capacity_exhaustion_is_io_failure() {
    let store_config = StoreConfig {
        capacity_bytes: Some(4 * BLOCK_SIZE as u64),
        ..StoreConfig::named("tiny")
    };
    let tree = extent_tree(store_config, 3);

    assert!(tree.allocate_block().unwrap().is_some());
    assert!(tree.allocate_block().unwrap().is_some());
    let err = tree.allocate_block().unwrap_err();
    assert!(matches!(err, MemtreeError::StoreFull { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_destroy_releases_store() {
    let tree = extent_tree(StoreConfig::named("destroy"), 3);
    let mut tx = Transaction::new(&tree).unwrap();
    add_leaf(&tree, &mut tx, 1);
    tx.commit().unwrap();

    tree.destroy().unwrap();
    assert_eq!(tree.state(), TreeState::Destroyed);
    assert_eq!(tree.store().size(), 0);
    assert_eq!(tree.store().stat().bytes_used(), 0);
}

// =============================================================================
// Allocator
// =============================================================================

#[test]
fn test_random_alloc_free_workload() {
    let tree = extent_tree(StoreConfig::named("alloc"), 1);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<u64> = Vec::new();
    let mut seen = HashSet::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let block = tree.allocate_block().unwrap().unwrap().block();
            assert!(block >= 2, "header and initial leaf are never handed out");
            assert!(!live.contains(&block), "block {} handed out twice", block);
            assert!(block < tree.highest_block());
            live.push(block);
            seen.insert(block);
        } else {
            let idx = rng.gen_range(0..live.len());
            let block = live.swap_remove(idx);
            tree.free_block(block, 1).unwrap();
        }
    }

    // Every block below the high-water mark is either live or free.
    let free = tree.free_blocks();
    assert_eq!(live.len() as u64 + free + 2, tree.highest_block());

    // Freed blocks come back lowest first before the store grows.
    let highest = tree.highest_block();
    let lowest_free = (2..highest).find(|&b| tree.is_block_free(b));
    if let Some(lowest) = lowest_free {
        assert_eq!(tree.allocate_block().unwrap().unwrap().block(), lowest);
        assert_eq!(tree.highest_block(), highest);
    }
}

#[test]
fn test_corrupt_pointer_is_fatal() {
    let tree = extent_tree(StoreConfig::named("badptr"), 1);
    let mut tx = Transaction::new(&tree).unwrap();

    let err = tx.read_buf(BtreePtr::Short(77)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PointerOutOfRange);
    assert!(err.is_fatal());

    let err = tx.get_buf(BtreePtr::Short(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PointerOutOfRange);

    let buf = BlockBuf::zeroed(1);
    assert_eq!(tree.buf_to_ptr(&buf).unwrap(), BtreePtr::Short(1));
}
