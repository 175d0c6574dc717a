//! Resident page frames.

use memtree_common::page::{PageId, PAGE_SIZE};
use parking_lot::RwLock;
use std::sync::Arc;

/// Contents of one page.
pub type PageData = Box<[u8; PAGE_SIZE]>;

/// Page contents shared between a frame and the handles mapping it.
pub type SharedPage = Arc<RwLock<PageData>>;

/// Allocates a zero-filled page.
#[inline]
pub fn zeroed_page() -> PageData {
    Box::new([0u8; PAGE_SIZE])
}

/// A page of the store that currently lives in memory.
///
/// Frames are only touched with the store lock held, so the bookkeeping
/// fields are plain values. The data itself sits behind its own lock so a
/// mapped page can be read or written after the store lock is dropped.
pub struct PageFrame {
    /// Page this frame holds.
    page_id: PageId,
    /// Page contents.
    data: SharedPage,
    /// Number of outstanding mappings (handles and cache slots).
    pin_count: u32,
}

impl PageFrame {
    /// Creates a frame for a freshly materialized, zero-filled page.
    pub fn new(page_id: PageId) -> Self {
        Self::with_data(page_id, zeroed_page())
    }

    /// Creates a frame around existing contents (e.g. a page read back from swap).
    pub fn with_data(page_id: PageId, data: PageData) -> Self {
        Self {
            page_id,
            data: Arc::new(RwLock::new(data)),
            pin_count: 0,
        }
    }

    /// Returns the page ID.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns a new reference to the page contents.
    #[inline]
    pub fn shared(&self) -> SharedPage {
        Arc::clone(&self.data)
    }

    /// Returns the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    /// Increments the pin count and returns the previous value.
    #[inline]
    pub fn pin(&mut self) -> u32 {
        let prev = self.pin_count;
        self.pin_count += 1;
        prev
    }

    /// Decrements the pin count and returns the new value.
    #[inline]
    pub fn unpin(&mut self) -> u32 {
        self.pin_count = self.pin_count.saturating_sub(1);
        self.pin_count
    }

    /// Returns true if this frame is mapped somewhere.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    /// Copies the page contents out (used when swapping the frame out).
    pub fn snapshot(&self) -> PageData {
        let data = self.data.read();
        let mut copy = zeroed_page();
        copy.copy_from_slice(&data[..]);
        copy
    }
}

impl std::fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFrame")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count)
            .finish()
    }
}
