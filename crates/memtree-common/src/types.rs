//! Small value types shared by the store and the tree backend.

use serde::{Deserialize, Serialize};

/// Width of the block pointers stored in tree nodes.
///
/// Short pointers are 32-bit block numbers (per-group trees); long pointers
/// are 64-bit block numbers (filesystem-wide trees).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PointerWidth {
    #[default]
    Short,
    Long,
}

impl PointerWidth {
    /// Encoded size of one pointer in bytes.
    #[inline]
    pub fn ptr_len(self) -> usize {
        match self {
            PointerWidth::Short => 4,
            PointerWidth::Long => 8,
        }
    }

    /// Returns true for 64-bit pointers.
    #[inline]
    pub fn is_long(self) -> bool {
        matches!(self, PointerWidth::Long)
    }
}

impl std::fmt::Display for PointerWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PointerWidth::Short => write!(f, "short"),
            PointerWidth::Long => write!(f, "long"),
        }
    }
}

/// 128-bit identity tag of the filesystem a staging tree is built for.
///
/// Stamped into the header block and every tree block so stale blocks from a
/// different filesystem are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MetaUuid(pub [u8; 16]);

impl MetaUuid {
    /// The all-zero tag.
    pub const NIL: MetaUuid = MetaUuid([0u8; 16]);

    /// Returns the raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reads a tag from the first 16 bytes of `buf`.
    pub fn from_slice(buf: &[u8]) -> Self {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&buf[..16]);
        Self(raw)
    }
}

impl std::fmt::Display for MetaUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}
