//! Swap file for pages pushed out of memory.

use crate::frame::{zeroed_page, PageData};
use memtree_common::page::{PageId, PAGE_SIZE};
use memtree_common::Result;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::trace;

/// Anonymous temporary file holding swapped-out pages.
///
/// The file is unlinked at creation, so nothing outside this process can
/// reach it and it disappears when dropped. Slots are page sized; freed slots
/// are reused before the file grows.
pub struct SwapFile {
    /// The file handle.
    file: File,
    /// Slot of every swapped page.
    slots: BTreeMap<PageId, u64>,
    /// Slots released by swap-in or discard.
    free_slots: Vec<u64>,
    /// First never-used slot.
    next_slot: u64,
}

impl SwapFile {
    /// Creates an empty swap file.
    pub fn new() -> Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self {
            file,
            slots: BTreeMap::new(),
            free_slots: Vec::new(),
            next_slot: 0,
        })
    }

    /// Returns the number of swapped pages.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing is swapped out.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns true if the page is swapped out.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.slots.contains_key(&page_id)
    }

    /// Returns the first swapped page at or after `page_id`.
    pub fn next_at_or_after(&self, page_id: PageId) -> Option<PageId> {
        self.slots.range(page_id..).next().map(|(&p, _)| p)
    }

    /// Returns swapped pages within `first..=last`.
    pub fn pages_in(&self, first: PageId, last: PageId) -> Vec<PageId> {
        self.slots.range(first..=last).map(|(&p, _)| p).collect()
    }

    /// Writes a page out, replacing any older copy.
    pub fn swap_out(&mut self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let slot = match self.slots.get(&page_id) {
            Some(&slot) => slot,
            None => self.free_slots.pop().unwrap_or_else(|| {
                let slot = self.next_slot;
                self.next_slot += 1;
                slot
            }),
        };

        self.file.seek(SeekFrom::Start(slot * PAGE_SIZE as u64))?;
        self.file.write_all(data)?;
        self.slots.insert(page_id, slot);

        trace!(page = page_id.0, slot, "swapped page out");
        Ok(())
    }

    /// Reads a page back without releasing its slot.
    pub fn read_page(&mut self, page_id: PageId) -> Result<Option<PageData>> {
        let Some(&slot) = self.slots.get(&page_id) else {
            return Ok(None);
        };

        let mut data = zeroed_page();
        self.file.seek(SeekFrom::Start(slot * PAGE_SIZE as u64))?;
        self.file.read_exact(&mut data[..])?;
        Ok(Some(data))
    }

    /// Reads a page back and releases its slot.
    pub fn swap_in(&mut self, page_id: PageId) -> Result<Option<PageData>> {
        let data = self.read_page(page_id)?;
        if data.is_some() {
            self.discard(page_id);
            trace!(page = page_id.0, "swapped page in");
        }
        Ok(data)
    }

    /// Forgets a swapped page. Returns true if it was present.
    pub fn discard(&mut self, page_id: PageId) -> bool {
        match self.slots.remove(&page_id) {
            Some(slot) => {
                self.free_slots.push(slot);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SwapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapFile")
            .field("pages", &self.slots.len())
            .field("free_slots", &self.free_slots.len())
            .field("next_slot", &self.next_slot)
            .finish()
    }
}
