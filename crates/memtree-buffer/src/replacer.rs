//! Page replacement policies for swap-out.

use memtree_common::page::PageId;
use std::collections::{BTreeMap, HashMap};

/// Trait for page replacement algorithms.
pub trait Replacer {
    /// Records that the given page was accessed.
    fn record_access(&mut self, page_id: PageId);

    /// Marks a page as evictable (not mapped anywhere).
    fn set_evictable(&mut self, page_id: PageId, evictable: bool);

    /// Selects a victim page and stops tracking it.
    ///
    /// Returns None if no pages are evictable.
    fn evict(&mut self) -> Option<PageId>;

    /// Stops tracking a page.
    fn remove(&mut self, page_id: PageId);

    /// Returns the number of evictable pages.
    fn size(&self) -> usize;
}

/// Least-recently-used replacement.
///
/// Every access stamps the page with a monotonically increasing tick. The
/// evictable pages are indexed by tick, so the victim is always the first
/// entry of that index.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Next access tick.
    tick: u64,
    /// Last access tick and evictability of every tracked page.
    entries: HashMap<PageId, LruEntry>,
    /// Evictable pages ordered by last access.
    order: BTreeMap<u64, PageId>,
}

#[derive(Debug, Clone, Copy)]
struct LruEntry {
    tick: u64,
    evictable: bool,
}

impl LruReplacer {
    /// Creates an empty replacer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tracked pages, evictable or not.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, page_id: PageId) {
        let tick = self.next_tick();
        match self.entries.get_mut(&page_id) {
            Some(entry) => {
                if entry.evictable {
                    self.order.remove(&entry.tick);
                    self.order.insert(tick, page_id);
                }
                entry.tick = tick;
            }
            None => {
                self.entries.insert(
                    page_id,
                    LruEntry {
                        tick,
                        evictable: false,
                    },
                );
            }
        }
    }

    fn set_evictable(&mut self, page_id: PageId, evictable: bool) {
        let Some(entry) = self.entries.get_mut(&page_id) else {
            return;
        };
        if entry.evictable == evictable {
            return;
        }

        entry.evictable = evictable;
        if evictable {
            self.order.insert(entry.tick, page_id);
        } else {
            self.order.remove(&entry.tick);
        }
    }

    fn evict(&mut self) -> Option<PageId> {
        let (_, page_id) = self.order.pop_first()?;
        self.entries.remove(&page_id);
        Some(page_id)
    }

    fn remove(&mut self, page_id: PageId) {
        if let Some(entry) = self.entries.remove(&page_id) {
            if entry.evictable {
                self.order.remove(&entry.tick);
            }
        }
    }

    fn size(&self) -> usize {
        self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_replacer_new() {
        let replacer = LruReplacer::new();
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.tracked(), 0);
    }

    #[test]
    fn test_lru_replacer_evict_empty() {
        let mut replacer = LruReplacer::new();
        assert!(replacer.evict().is_none());
    }

    #[test]
    fn test_lru_replacer_untracked_set_evictable_is_ignored() {
        let mut replacer = LruReplacer::new();
        replacer.set_evictable(PageId(9), true);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_replacer_evicts_least_recent() {
        let mut replacer = LruReplacer::new();

        for i in 0..3 {
            replacer.record_access(PageId(i));
            replacer.set_evictable(PageId(i), true);
        }
        assert_eq!(replacer.size(), 3);

        // Touch page 0 again; page 1 is now the oldest.
        replacer.record_access(PageId(0));

        assert_eq!(replacer.evict(), Some(PageId(1)));
        assert_eq!(replacer.evict(), Some(PageId(2)));
        assert_eq!(replacer.evict(), Some(PageId(0)));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_replacer_skips_pinned() {
        let mut replacer = LruReplacer::new();

        replacer.record_access(PageId(0));
        replacer.record_access(PageId(1));
        replacer.set_evictable(PageId(1), true);

        // Page 0 is older but not evictable.
        assert_eq!(replacer.evict(), Some(PageId(1)));
        assert_eq!(replacer.evict(), None);
        assert_eq!(replacer.tracked(), 1);
    }

    #[test]
    fn test_lru_replacer_pin_unpin_cycle() {
        let mut replacer = LruReplacer::new();

        replacer.record_access(PageId(4));
        replacer.set_evictable(PageId(4), true);
        assert_eq!(replacer.size(), 1);

        replacer.set_evictable(PageId(4), false);
        assert_eq!(replacer.size(), 0);

        replacer.set_evictable(PageId(4), true);
        replacer.set_evictable(PageId(4), true);
        assert_eq!(replacer.size(), 1);
    }

    #[test]
    fn test_lru_replacer_remove() {
        let mut replacer = LruReplacer::new();

        replacer.record_access(PageId(0));
        replacer.record_access(PageId(1));
        replacer.set_evictable(PageId(0), true);
        replacer.set_evictable(PageId(1), true);

        replacer.remove(PageId(0));
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(PageId(1)));

        // Removing an unknown page is harmless.
        replacer.remove(PageId(77));
    }
}
