//! Error types for memtree.

use thiserror::Error;

/// Result type alias using MemtreeError.
pub type Result<T> = std::result::Result<T, MemtreeError>;

/// The check a verifier was running when it rejected a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionSite {
    /// Header block magic mismatch.
    HeadMagic,
    /// Header block claims a zero-height tree.
    HeadLevels,
    /// Header block identity tag mismatch.
    HeadUuid,
    /// Header block owned by another tree.
    HeadOwner,
    /// Tree block magic mismatch.
    BlockMagic,
    /// Tree block identity tag mismatch.
    BlockUuid,
    /// Tree block self-address does not match where it was read from.
    BlockAddress,
    /// Tree block level at or above the tree type's maximum height.
    BlockLevel,
    /// More records than fit in a block at this level.
    RecordCount,
    /// Left sibling points outside the store.
    LeftSibling,
    /// Right sibling points outside the store.
    RightSibling,
    /// Tree block owned by another tree.
    BlockOwner,
}

impl std::fmt::Display for CorruptionSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CorruptionSite::HeadMagic => "head magic",
            CorruptionSite::HeadLevels => "head level count",
            CorruptionSite::HeadUuid => "head uuid",
            CorruptionSite::HeadOwner => "head owner",
            CorruptionSite::BlockMagic => "block magic",
            CorruptionSite::BlockUuid => "block uuid",
            CorruptionSite::BlockAddress => "block address",
            CorruptionSite::BlockLevel => "block level",
            CorruptionSite::RecordCount => "record count",
            CorruptionSite::LeftSibling => "left sibling",
            CorruptionSite::RightSibling => "right sibling",
            CorruptionSite::BlockOwner => "block owner",
        };
        f.write_str(name)
    }
}

/// Failure classes the repair orchestrator acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backing medium exhausted or failed; abort this repair attempt.
    IoFailure,
    /// Short pointers cannot address a new block; try another strategy.
    OutOfAddressSpace,
    /// A verifier rejected a block; the input may be at fault.
    StructuralCorruption,
    /// A tree pointer escaped the store; the instance is unusable.
    PointerOutOfRange,
}

/// Errors that can occur in memtree operations.
#[derive(Debug, Error)]
pub enum MemtreeError {
    // Backing medium errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store full: need {requested} bytes, capacity {capacity}")]
    StoreFull { requested: u64, capacity: u64 },

    #[error("Request too large: {len} bytes (max {max})")]
    RequestTooLarge { len: u64, max: u64 },

    #[error("Offset too large: {offset} + {len} exceeds {max}")]
    OffsetTooLarge { offset: u64, len: u64, max: u64 },

    #[error("Short transfer at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Mapped access at offset {offset} of {len} bytes crosses a page boundary")]
    PageSpansBoundary { offset: u64, len: u64 },

    // B+ tree errors
    #[error("Block {block} cannot be addressed by a short pointer")]
    OutOfAddressSpace { block: u64 },

    #[error("Corrupt block {block}: {site}")]
    Corruption { block: u64, site: CorruptionSite },

    #[error("Corrupt pointer {ptr:#x} at level {level} index {index}")]
    PointerOutOfRange { ptr: u64, level: u32, index: u32 },

    // Lifecycle errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Configuration errors
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },
}

impl MemtreeError {
    /// Classifies this error for the orchestrator.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemtreeError::Io(_)
            | MemtreeError::StoreFull { .. }
            | MemtreeError::RequestTooLarge { .. }
            | MemtreeError::OffsetTooLarge { .. }
            | MemtreeError::ShortTransfer { .. }
            | MemtreeError::PageSpansBoundary { .. }
            | MemtreeError::InvalidState(_)
            | MemtreeError::InvalidParameter { .. } => ErrorKind::IoFailure,
            MemtreeError::OutOfAddressSpace { .. } => ErrorKind::OutOfAddressSpace,
            MemtreeError::Corruption { .. } => ErrorKind::StructuralCorruption,
            MemtreeError::PointerOutOfRange { .. } => ErrorKind::PointerOutOfRange,
        }
    }

    /// Returns true if the current repair attempt cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IoFailure | ErrorKind::PointerOutOfRange
        )
    }

    /// Returns true if a verifier rejected a block.
    pub fn is_corruption(&self) -> bool {
        self.kind() == ErrorKind::StructuralCorruption
    }
}
