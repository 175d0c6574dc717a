//! memtree common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all memtree components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{BtreeConfig, StoreConfig};
pub use error::{CorruptionSite, ErrorKind, MemtreeError, Result};
pub use page::{PageId, BLOCK_SIZE, PAGE_SIZE};
pub use types::{MetaUuid, PointerWidth};
