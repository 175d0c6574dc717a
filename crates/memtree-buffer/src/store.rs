//! Paged virtual store.
//!
//! A sparse, byte-addressable memory region divided into pages. Pages are
//! materialized zero-filled on first write, kept resident up to a budget, and
//! pushed out to an anonymous swap file beyond it. Unwritten ranges read back
//! as zeroes without consuming memory.

use crate::frame::{PageData, PageFrame, SharedPage};
use crate::replacer::{LruReplacer, Replacer};
use crate::swap::SwapFile;
use bytes::{Bytes, BytesMut};
use memtree_common::page::{offset_in_page, PageId, PAGE_SIZE};
use memtree_common::{MemtreeError, Result, StoreConfig};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{btree_map::Entry, BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use tracing::{debug, trace, warn};

/// Space usage of a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStat {
    /// Logical size in bytes.
    pub size: u64,
    /// Bytes held by resident pages.
    pub resident_bytes: u64,
    /// Bytes held by swapped-out pages.
    pub swapped_bytes: u64,
}

impl StoreStat {
    /// Returns the bytes of backing storage in use.
    pub fn bytes_used(&self) -> u64 {
        self.resident_bytes + self.swapped_bytes
    }
}

/// One slot of the mapped-page cache.
struct CachedPage {
    page_id: PageId,
    data: SharedPage,
}

/// Mutable state of a store, guarded by the store lock.
struct StoreInner {
    /// Logical size in bytes.
    size: u64,
    /// Resident pages.
    frames: BTreeMap<PageId, PageFrame>,
    /// Swap-out victim selection among unmapped resident pages.
    replacer: LruReplacer,
    /// Created on first swap-out.
    swap: Option<SwapFile>,
    /// Recently mapped pages, most recent first.
    cache: VecDeque<CachedPage>,
    cache_enabled: bool,
}

/// Sparse paged memory region addressed by byte offset.
///
/// All transfers are all-or-nothing at the `read`/`write` level: a request
/// either moves every byte or fails.
pub struct VirtualStore {
    config: StoreConfig,
    inner: Mutex<StoreInner>,
}

impl VirtualStore {
    /// Creates an empty store.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            description = %config.description,
            initial_size = config.initial_size,
            max_resident_pages = config.max_resident_pages,
            "created virtual store"
        );

        let cache_enabled = config.cache_entries > 0;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                size: config.initial_size,
                frames: BTreeMap::new(),
                replacer: LruReplacer::new(),
                swap: None,
                cache: VecDeque::with_capacity(config.cache_entries),
                cache_enabled,
            }),
            config,
        })
    }

    /// Returns the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the name used in log output.
    pub fn description(&self) -> &str {
        &self.config.description
    }

    /// Returns the current logical size.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Returns size and backing usage.
    pub fn stat(&self) -> StoreStat {
        let inner = self.inner.lock();
        let swapped = inner.swap.as_ref().map_or(0, |s| s.len());
        StoreStat {
            size: inner.size,
            resident_bytes: (inner.frames.len() * PAGE_SIZE) as u64,
            swapped_bytes: (swapped * PAGE_SIZE) as u64,
        }
    }

    /// Reads exactly `len` bytes at `offset`.
    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        self.read_into(offset, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Fills `buf` from `offset`. Fails unless every byte was transferred.
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let done = self.pread(offset, buf)?;
        expect_full(offset, buf.len(), done)
    }

    /// Writes all of `data` at `offset`. Fails unless every byte was transferred.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let done = self.pwrite(offset, data)?;
        expect_full(offset, data.len(), done)
    }

    /// Reads up to `buf.len()` bytes, returning how many were transferred.
    ///
    /// Fails only if nothing could be read; a later failure cuts the
    /// transfer short instead.
    pub fn pread(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_request(offset, buf.len() as u64)?;
        trace!(offset, len = buf.len(), "store read");

        let mut inner = self.inner.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let page_id = PageId::containing(pos);
            let start = offset_in_page(pos);
            let count = (PAGE_SIZE - start).min(buf.len() - done);
            let chunk = &mut buf[done..done + count];

            if !inner.is_backed(page_id) {
                chunk.fill(0);
            } else {
                let step = inner.with_page(&self.config, page_id, |data| {
                    chunk.copy_from_slice(&data.read()[start..start + count]);
                });
                if let Err(e) = step {
                    return partial(done, e);
                }
            }
            done += count;
        }
        Ok(done)
    }

    /// Writes up to `data.len()` bytes, returning how many were transferred.
    ///
    /// Writing past the logical size extends it.
    pub fn pwrite(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_request(offset, data.len() as u64)?;
        trace!(offset, len = data.len(), "store write");

        let mut inner = self.inner.lock();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let page_id = PageId::containing(pos);
            let start = offset_in_page(pos);
            let count = (PAGE_SIZE - start).min(data.len() - done);
            let chunk = &data[done..done + count];

            let step = inner.with_page(&self.config, page_id, |page| {
                page.write()[start..start + count].copy_from_slice(chunk);
            });
            if let Err(e) = step {
                return partial(done, e);
            }
            done += count;
            inner.size = inner.size.max(pos + count as u64);
        }
        Ok(done)
    }

    /// Materializes every page in the range so later writes there cannot
    /// fail for lack of backing storage.
    pub fn preallocate(&self, offset: u64, len: u64) -> Result<()> {
        self.check_offset(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        trace!(offset, len, "store preallocate");

        let mut inner = self.inner.lock();
        let mut page_id = PageId::containing(offset);
        let last = PageId::containing(offset + len - 1);
        while page_id <= last {
            inner.map_page(&self.config, page_id)?;
            inner.unmap_page(&self.config, page_id)?;
            page_id = page_id.next();
        }
        inner.size = inner.size.max(offset + len);
        Ok(())
    }

    /// Releases backing pages in the range; it reads back as zeroes.
    ///
    /// Whole pages are dropped and partially covered edge pages are zeroed.
    pub fn discard(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        trace!(offset, len, "store discard");

        let end = offset.saturating_add(len);
        let first = PageId::containing(offset);
        let last = PageId::containing(end - 1);

        let mut inner = self.inner.lock();
        inner.flush_cache(&self.config)?;

        let mut pages: BTreeSet<PageId> =
            inner.frames.range(first..=last).map(|(&p, _)| p).collect();
        if let Some(swap) = &inner.swap {
            pages.extend(swap.pages_in(first, last));
        }

        for page_id in pages {
            let page_start = page_id.offset();
            let start = page_start.max(offset);
            let stop = (page_start + PAGE_SIZE as u64).min(end);

            if start == page_start && stop - start == PAGE_SIZE as u64 {
                inner.drop_page(page_id);
                continue;
            }

            let (from, count) = (offset_in_page(start), (stop - start) as usize);
            inner.with_page(&self.config, page_id, |data| {
                data.write()[from..from + count].fill(0);
            })?;
        }
        Ok(())
    }

    /// Releases every backing page and resets the logical size to zero.
    pub fn discard_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.flush_cache(&self.config)?;
        inner.frames.clear();
        inner.replacer = LruReplacer::new();
        inner.swap = None;
        inner.size = 0;
        trace!(description = %self.config.description, "store discard all");
        Ok(())
    }

    /// Returns the first offset at or after `offset` that has backing data.
    ///
    /// Returns None if nothing at or after `offset` is backed, or if the
    /// answer would lie beyond the logical size.
    pub fn seek_next_resident(&self, offset: u64) -> Option<u64> {
        let inner = self.inner.lock();
        if offset >= inner.size {
            return None;
        }

        let page_id = PageId::containing(offset);
        let resident = inner.frames.range(page_id..).next().map(|(&p, _)| p);
        let swapped = inner.swap.as_ref().and_then(|s| s.next_at_or_after(page_id));
        let next = match (resident, swapped) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b)?,
        };

        let found = next.offset().max(offset);
        trace!(offset, found, "store seek data");
        (found < inner.size).then_some(found)
    }

    /// Maps the page containing `offset` for direct access.
    ///
    /// The range must stay within one page. A new page is zero-filled; the
    /// logical size grows to cover the range.
    /// The mapping is released when the handle drops.
    pub fn get_page(&self, offset: u64, len: u64) -> Result<PageHandle<'_>> {
        if len > (PAGE_SIZE - offset_in_page(offset)) as u64 {
            return Err(MemtreeError::PageSpansBoundary { offset, len });
        }
        self.check_offset(offset, len)?;

        let page_id = PageId::containing(offset);
        let mut inner = self.inner.lock();
        let data = inner.map_page(&self.config, page_id)?;
        inner.size = inner.size.max(offset + len);

        trace!(page = page_id.0, offset, len, "store get page");
        Ok(PageHandle {
            store: self,
            page_id,
            data,
            released: false,
        })
    }

    /// Re-enables the mapped-page cache.
    pub fn cache_enable(&self) {
        let mut inner = self.inner.lock();
        inner.cache_enabled = self.config.cache_entries > 0;
    }

    /// Disables the mapped-page cache, releasing its mappings.
    pub fn cache_disable(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cache_enabled = false;
        inner.flush_cache(&self.config)
    }

    /// Writes a hex dump of every non-zero 16-byte line with backing data.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        const LINE: usize = 16;

        let mut inner = self.inner.lock();
        let mut pages: BTreeSet<PageId> = inner.frames.keys().copied().collect();
        if let Some(swap) = &inner.swap {
            pages.extend(swap.pages_in(PageId(0), PageId(u64::MAX)));
        }

        writeln!(out, "store {}: {} bytes", self.config.description, inner.size)?;
        let mut any = false;
        for page_id in pages {
            let resident = inner.frames.get(&page_id).map(PageFrame::snapshot);
            let data: PageData = match resident {
                Some(data) => data,
                None => match inner.swap.as_mut() {
                    Some(swap) => match swap.read_page(page_id)? {
                        Some(data) => data,
                        None => continue,
                    },
                    None => continue,
                },
            };

            for (i, line) in data.chunks(LINE).enumerate() {
                if line.iter().all(|&b| b == 0) {
                    continue;
                }
                any = true;
                let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
                let text: String = line
                    .iter()
                    .map(|&b| if b.is_ascii_graphic() { b as char } else { '.' })
                    .collect();
                writeln!(
                    out,
                    "{:016x}: {}  {}",
                    page_id.offset() + (i * LINE) as u64,
                    hex.join(" "),
                    text
                )?;
            }
        }
        if !any {
            writeln!(out, "<all zeroes>")?;
        }
        Ok(())
    }

    /// Rejects transfers the store will never satisfy.
    fn check_request(&self, offset: u64, len: u64) -> Result<()> {
        if len > self.config.max_io_bytes {
            return Err(MemtreeError::RequestTooLarge {
                len,
                max: self.config.max_io_bytes,
            });
        }
        self.check_offset(offset, len)
    }

    fn check_offset(&self, offset: u64, len: u64) -> Result<()> {
        let max = self.config.max_file_size;
        if offset > max || max - offset < len {
            return Err(MemtreeError::OffsetTooLarge { offset, len, max });
        }
        Ok(())
    }

    /// Drops one mapping of a page.
    fn release(&self, page_id: PageId) -> Result<()> {
        trace!(page = page_id.0, "store put page");
        self.inner.lock().unmap_page(&self.config, page_id)
    }
}

impl Drop for VirtualStore {
    fn drop(&mut self) {
        let stat = self.stat();
        debug!(
            description = %self.config.description,
            size = stat.size,
            bytes_used = stat.bytes_used(),
            "destroyed virtual store"
        );
    }
}

impl std::fmt::Debug for VirtualStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStore")
            .field("description", &self.config.description)
            .field("stat", &self.stat())
            .finish()
    }
}

/// Direct access to one mapped page.
///
/// Holds a mapping on the page so it stays resident. Dropping the handle (or
/// calling `put`) releases it exactly once. Do not hold a data guard across
/// other calls into the same store.
pub struct PageHandle<'a> {
    store: &'a VirtualStore,
    page_id: PageId,
    data: SharedPage,
    released: bool,
}

impl std::fmt::Debug for PageHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl PageHandle<'_> {
    /// Returns the mapped page.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the store offset of the start of the page.
    pub fn offset(&self) -> u64 {
        self.page_id.offset()
    }

    /// Locks the page contents for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, PageData> {
        self.data.read()
    }

    /// Locks the page contents for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, PageData> {
        self.data.write()
    }

    /// Releases the mapping, reporting any failure to rebalance residency.
    pub fn put(mut self) -> Result<()> {
        self.released = true;
        self.store.release(self.page_id)
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release(self.page_id) {
            warn!(page = self.page_id.0, error = %e, "failed to release mapped page");
        }
    }
}

impl StoreInner {
    fn is_backed(&self, page_id: PageId) -> bool {
        self.frames.contains_key(&page_id)
            || self.swap.as_ref().is_some_and(|s| s.contains(page_id))
    }

    fn backed_pages(&self) -> u64 {
        (self.frames.len() + self.swap.as_ref().map_or(0, |s| s.len())) as u64
    }

    fn cache_active(&self, config: &StoreConfig) -> bool {
        self.cache_enabled && config.cache_entries > 0
    }

    /// Runs `f` on a page, going through the cache when it is enabled and
    /// mapping the page just for the call otherwise.
    fn with_page<R>(
        &mut self,
        config: &StoreConfig,
        page_id: PageId,
        f: impl FnOnce(&SharedPage) -> R,
    ) -> Result<R> {
        if self.cache_active(config) {
            let data = self.cache_lookup(config, page_id)?;
            return Ok(f(&data));
        }

        let data = self.map_page(config, page_id)?;
        let result = f(&data);
        self.unmap_page(config, page_id)?;
        Ok(result)
    }

    /// Pins a page, materializing it zero-filled or swapping it back in.
    fn map_page(&mut self, config: &StoreConfig, page_id: PageId) -> Result<SharedPage> {
        let backed = self.backed_pages();
        let frame = match self.frames.entry(page_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let frame = load_frame(&mut self.swap, backed, config, page_id)?;
                entry.insert(frame)
            }
        };
        frame.pin();
        let data = frame.shared();

        self.replacer.record_access(page_id);
        self.replacer.set_evictable(page_id, false);

        if let Err(e) = self.balance(config) {
            self.unmap_page(config, page_id)?;
            return Err(e);
        }
        Ok(data)
    }

    /// Drops one pin on a page. Unknown pages are ignored.
    fn unmap_page(&mut self, config: &StoreConfig, page_id: PageId) -> Result<()> {
        if let Some(frame) = self.frames.get_mut(&page_id) {
            if frame.unpin() == 0 {
                self.replacer.set_evictable(page_id, true);
            }
        }
        self.balance(config)
    }

    /// Returns a cached mapping, mapping the page into the cache on a miss.
    fn cache_lookup(&mut self, config: &StoreConfig, page_id: PageId) -> Result<SharedPage> {
        if let Some(idx) = self.cache.iter().position(|c| c.page_id == page_id) {
            if let Some(entry) = self.cache.remove(idx) {
                let data = entry.data.clone();
                self.cache.push_front(entry);
                self.replacer.record_access(page_id);
                return Ok(data);
            }
        }

        let data = self.map_page(config, page_id)?;
        self.cache.push_front(CachedPage {
            page_id,
            data: data.clone(),
        });
        while self.cache.len() > config.cache_entries {
            if let Some(old) = self.cache.pop_back() {
                self.unmap_page(config, old.page_id)?;
            }
        }
        Ok(data)
    }

    /// Releases every cached mapping.
    fn flush_cache(&mut self, config: &StoreConfig) -> Result<()> {
        let mut first_err = None;
        while let Some(entry) = self.cache.pop_front() {
            if let Err(e) = self.unmap_page(config, entry.page_id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Forgets a page entirely, resident or swapped.
    fn drop_page(&mut self, page_id: PageId) {
        self.frames.remove(&page_id);
        self.replacer.remove(page_id);
        if let Some(swap) = self.swap.as_mut() {
            swap.discard(page_id);
        }
    }

    /// Swaps out unmapped pages until residency fits the budget.
    ///
    /// Stops early when every remaining page is mapped.
    fn balance(&mut self, config: &StoreConfig) -> Result<()> {
        while self.frames.len() > config.max_resident_pages {
            let Some(victim) = self.replacer.evict() else {
                break;
            };
            let Some(data) = self.frames.get(&victim).map(PageFrame::snapshot) else {
                continue;
            };

            let swap = match self.swap.take() {
                Some(swap) => swap,
                None => {
                    debug!("created swap file");
                    SwapFile::new()?
                }
            };
            let swap = self.swap.insert(swap);
            if let Err(e) = swap.swap_out(victim, &data) {
                self.replacer.record_access(victim);
                self.replacer.set_evictable(victim, true);
                return Err(e);
            }
            self.frames.remove(&victim);
        }
        Ok(())
    }
}

/// Builds the frame for a page that is not resident.
fn load_frame(
    swap: &mut Option<SwapFile>,
    backed: u64,
    config: &StoreConfig,
    page_id: PageId,
) -> Result<PageFrame> {
    if let Some(data) = swap.as_mut().map(|s| s.swap_in(page_id)).transpose()?.flatten() {
        return Ok(PageFrame::with_data(page_id, data));
    }

    if let Some(capacity) = config.capacity_bytes {
        let requested = (backed + 1) * PAGE_SIZE as u64;
        if requested > capacity {
            return Err(MemtreeError::StoreFull {
                requested,
                capacity,
            });
        }
    }

    trace!(page = page_id.0, "materialized page");
    Ok(PageFrame::new(page_id))
}

/// Turns a failure after some bytes moved into a short count.
fn partial(done: usize, err: MemtreeError) -> Result<usize> {
    if done == 0 {
        return Err(err);
    }
    warn!(done, error = %err, "store transfer cut short");
    Ok(done)
}

/// Short transfers are failures for whole-object callers.
fn expect_full(offset: u64, expected: usize, actual: usize) -> Result<()> {
    if actual != expected {
        return Err(MemtreeError::ShortTransfer {
            offset,
            expected: expected as u64,
            actual: actual as u64,
        });
    }
    Ok(())
}
