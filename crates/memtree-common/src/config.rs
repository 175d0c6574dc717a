//! Configuration structures for memtree.

use crate::error::{MemtreeError, Result};
use crate::page::PAGE_SIZE;
use crate::types::{MetaUuid, PointerWidth};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Largest single transfer, in bytes (INT_MAX rounded down to a page).
pub const DEFAULT_MAX_IO_BYTES: u64 = (i32::MAX as u64) & !(PAGE_SIZE as u64 - 1);

/// Largest addressable store offset.
pub const DEFAULT_MAX_FILE_SIZE: u64 = i64::MAX as u64;

/// Largest block number a short pointer may address.
pub const DEFAULT_SHORT_PTR_LIMIT: u64 = i32::MAX as u64;

/// Configuration for one paged virtual store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name used in log output.
    pub description: String,
    /// Logical size the store starts out with.
    pub initial_size: u64,
    /// Number of slots in the mapped-page cache (0 disables it).
    pub cache_entries: usize,
    /// Pages kept in memory before older ones are swapped out.
    pub max_resident_pages: usize,
    /// Upper bound on memory plus swap, in bytes (None = unbounded).
    pub capacity_bytes: Option<u64>,
    /// Largest single read or write, in bytes.
    pub max_io_bytes: u64,
    /// Largest addressable offset.
    pub max_file_size: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            description: "memtree".to_string(),
            initial_size: 0,
            cache_entries: 8,
            max_resident_pages: 16384, // 64 MB with 4 KB pages
            capacity_bytes: None,
            max_io_bytes: DEFAULT_MAX_IO_BYTES,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Creates a default config with the given description.
    pub fn named(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Sizes the resident page budget to 1/8 of available system RAM.
    /// Minimum 256 pages.
    pub fn auto_sized(description: impl Into<String>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let max_resident_pages = (available_bytes / 8 / PAGE_SIZE).max(256);

        Self {
            description: description.into(),
            max_resident_pages,
            ..Default::default()
        }
    }

    /// Returns the resident page budget in bytes.
    pub fn resident_budget_bytes(&self) -> usize {
        self.max_resident_pages * PAGE_SIZE
    }

    /// Rejects configurations the store cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_resident_pages == 0 {
            return Err(invalid("max_resident_pages", self.max_resident_pages));
        }
        if self.max_io_bytes == 0 || self.max_io_bytes % PAGE_SIZE as u64 != 0 {
            return Err(invalid("max_io_bytes", self.max_io_bytes));
        }
        if self.initial_size > self.max_file_size {
            return Err(invalid("initial_size", self.initial_size));
        }
        Ok(())
    }
}

/// Configuration for one in-memory B+tree instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtreeConfig {
    /// Owner tag stamped into every block.
    pub owner: u64,
    /// Encoding of node pointers.
    pub pointer_width: PointerWidth,
    /// Identity tag of the filesystem being repaired.
    pub meta_uuid: MetaUuid,
    /// Block numbers at or above this cannot be handed out as short pointers.
    pub short_ptr_limit: u64,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            owner: 0,
            pointer_width: PointerWidth::Short,
            meta_uuid: MetaUuid::NIL,
            short_ptr_limit: DEFAULT_SHORT_PTR_LIMIT,
        }
    }
}

impl BtreeConfig {
    /// Creates a config for the given owner and pointer width.
    pub fn new(owner: u64, pointer_width: PointerWidth) -> Self {
        Self {
            owner,
            pointer_width,
            ..Default::default()
        }
    }

    /// Rejects configurations the backend cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.pointer_width == PointerWidth::Short && self.owner > u32::MAX as u64 {
            return Err(invalid("owner", self.owner));
        }
        if self.short_ptr_limit < 2 || self.short_ptr_limit > u32::MAX as u64 {
            return Err(invalid("short_ptr_limit", self.short_ptr_limit));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl std::fmt::Display) -> MemtreeError {
    MemtreeError::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    }
}
