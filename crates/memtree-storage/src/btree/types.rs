//! On-store structures for in-memory B+trees.
//!
//! Everything here is big-endian and byte-matches the on-disk v5 btree
//! formats, since finished blocks are copied verbatim into the filesystem.

use super::constants::{
    HEAD_MAGIC, LONG_HEADER_LEN, NULL_LONG_PTR, NULL_SHORT_PTR, SHORT_HEADER_LEN,
};
use memtree_common::{MetaUuid, PointerWidth};

#[inline]
pub(crate) fn get_be_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn get_be_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn get_be_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

#[inline]
pub(crate) fn put_be_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_be_bytes());
}

#[inline]
pub(crate) fn put_be_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

#[inline]
pub(crate) fn put_be_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_be_bytes());
}

/// A block pointer as stored in tree nodes.
///
/// The value is a store block number. Short pointers address per-group
/// trees and are 32 bits wide; long pointers are 64 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtreePtr {
    Short(u32),
    Long(u64),
}

impl BtreePtr {
    /// Returns the null pointer of the given width.
    pub fn null(width: PointerWidth) -> Self {
        match width {
            PointerWidth::Short => BtreePtr::Short(NULL_SHORT_PTR),
            PointerWidth::Long => BtreePtr::Long(NULL_LONG_PTR),
        }
    }

    /// Builds a pointer to `block`. Returns None if a short pointer cannot
    /// hold the block number.
    pub fn from_block(width: PointerWidth, block: u64) -> Option<Self> {
        match width {
            PointerWidth::Short => u32::try_from(block).ok().map(BtreePtr::Short),
            PointerWidth::Long => Some(BtreePtr::Long(block)),
        }
    }

    /// Returns true for the null sentinel.
    pub fn is_null(&self) -> bool {
        match *self {
            BtreePtr::Short(v) => v == NULL_SHORT_PTR,
            BtreePtr::Long(v) => v == NULL_LONG_PTR,
        }
    }

    /// Returns the raw block number.
    pub fn block(&self) -> u64 {
        match *self {
            BtreePtr::Short(v) => v as u64,
            BtreePtr::Long(v) => v,
        }
    }

    /// Returns the pointer width.
    pub fn width(&self) -> PointerWidth {
        match self {
            BtreePtr::Short(_) => PointerWidth::Short,
            BtreePtr::Long(_) => PointerWidth::Long,
        }
    }

    /// Writes the pointer big-endian at the start of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        match *self {
            BtreePtr::Short(v) => put_be_u32(buf, 0, v),
            BtreePtr::Long(v) => put_be_u64(buf, 0, v),
        }
    }

    /// Reads a pointer of the given width from the start of `buf`.
    pub fn decode(width: PointerWidth, buf: &[u8]) -> Self {
        match width {
            PointerWidth::Short => BtreePtr::Short(get_be_u32(buf, 0)),
            PointerWidth::Long => BtreePtr::Long(get_be_u64(buf, 0)),
        }
    }
}

impl std::fmt::Display for BtreePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "blk:{}", self.block())
        }
    }
}

/// Header block of an in-memory tree (block 0 of the store).
///
/// Layout (40 bytes, big-endian):
/// - magic: 4 bytes
/// - nlevels: 4 bytes
/// - owner: 8 bytes
/// - root: 8 bytes (block number, whatever the pointer width)
/// - uuid: 16 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemHead {
    pub magic: u32,
    pub nlevels: u32,
    pub owner: u64,
    pub root: u64,
    pub uuid: MetaUuid,
}

impl MemHead {
    /// Size of the header in bytes.
    pub const SIZE: usize = 40;

    /// Creates the header of a one-level tree rooted at `root`.
    pub fn new(owner: u64, root: u64, uuid: MetaUuid) -> Self {
        Self {
            magic: HEAD_MAGIC,
            nlevels: 1,
            owner,
            root,
            uuid,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_be_u32(&mut buf, 0, self.magic);
        put_be_u32(&mut buf, 4, self.nlevels);
        put_be_u64(&mut buf, 8, self.owner);
        put_be_u64(&mut buf, 16, self.root);
        buf[24..40].copy_from_slice(self.uuid.as_bytes());
        buf
    }

    /// Deserializes from bytes.
    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            magic: get_be_u32(buf, 0),
            nlevels: get_be_u32(buf, 4),
            owner: get_be_u64(buf, 8),
            root: get_be_u64(buf, 16),
            uuid: MetaUuid::from_slice(&buf[24..40]),
        }
    }
}

/// Common header of every tree block.
///
/// Short form (56 bytes): magic 4, level 2, numrecs 2, leftsib 4,
/// rightsib 4, blkno 8, lsn 8, uuid 16, owner 4, crc 4.
///
/// Long form (72 bytes): magic 4, level 2, numrecs 2, leftsib 8,
/// rightsib 8, blkno 8, lsn 8, uuid 16, owner 8, crc 4, pad 4.
///
/// `blkno` holds the block's sector address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: BtreePtr,
    pub rightsib: BtreePtr,
    pub blkno: u64,
    pub lsn: u64,
    pub uuid: MetaUuid,
    pub owner: u64,
    pub crc: u32,
}

impl BlockHeader {
    /// Returns the header length for the given pointer width.
    pub fn len(width: PointerWidth) -> usize {
        match width {
            PointerWidth::Short => SHORT_HEADER_LEN,
            PointerWidth::Long => LONG_HEADER_LEN,
        }
    }

    /// Creates the header of an empty block without siblings.
    pub fn new(
        width: PointerWidth,
        magic: u32,
        level: u16,
        owner: u64,
        uuid: MetaUuid,
        blkno: u64,
    ) -> Self {
        Self {
            magic,
            level,
            numrecs: 0,
            leftsib: BtreePtr::null(width),
            rightsib: BtreePtr::null(width),
            blkno,
            lsn: 0,
            uuid,
            owner,
            crc: 0,
        }
    }

    /// Returns the pointer width of this header.
    pub fn width(&self) -> PointerWidth {
        self.leftsib.width()
    }

    /// Serializes into the start of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        put_be_u32(buf, 0, self.magic);
        put_be_u16(buf, 4, self.level);
        put_be_u16(buf, 6, self.numrecs);
        match self.width() {
            PointerWidth::Short => {
                put_be_u32(buf, 8, self.leftsib.block() as u32);
                put_be_u32(buf, 12, self.rightsib.block() as u32);
                put_be_u64(buf, 16, self.blkno);
                put_be_u64(buf, 24, self.lsn);
                buf[32..48].copy_from_slice(self.uuid.as_bytes());
                put_be_u32(buf, 48, self.owner as u32);
                put_be_u32(buf, 52, self.crc);
            }
            PointerWidth::Long => {
                put_be_u64(buf, 8, self.leftsib.block());
                put_be_u64(buf, 16, self.rightsib.block());
                put_be_u64(buf, 24, self.blkno);
                put_be_u64(buf, 32, self.lsn);
                buf[40..56].copy_from_slice(self.uuid.as_bytes());
                put_be_u64(buf, 56, self.owner);
                put_be_u32(buf, 64, self.crc);
                put_be_u32(buf, 68, 0);
            }
        }
    }

    /// Deserializes from the start of `buf`.
    pub fn read_from(buf: &[u8], width: PointerWidth) -> Self {
        let magic = get_be_u32(buf, 0);
        let level = get_be_u16(buf, 4);
        let numrecs = get_be_u16(buf, 6);
        match width {
            PointerWidth::Short => Self {
                magic,
                level,
                numrecs,
                leftsib: BtreePtr::Short(get_be_u32(buf, 8)),
                rightsib: BtreePtr::Short(get_be_u32(buf, 12)),
                blkno: get_be_u64(buf, 16),
                lsn: get_be_u64(buf, 24),
                uuid: MetaUuid::from_slice(&buf[32..48]),
                owner: get_be_u32(buf, 48) as u64,
                crc: get_be_u32(buf, 52),
            },
            PointerWidth::Long => Self {
                magic,
                level,
                numrecs,
                leftsib: BtreePtr::Long(get_be_u64(buf, 8)),
                rightsib: BtreePtr::Long(get_be_u64(buf, 16)),
                blkno: get_be_u64(buf, 24),
                lsn: get_be_u64(buf, 32),
                uuid: MetaUuid::from_slice(&buf[40..56]),
                owner: get_be_u64(buf, 56),
                crc: get_be_u32(buf, 64),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptr_null() {
        assert!(BtreePtr::null(PointerWidth::Short).is_null());
        assert!(BtreePtr::null(PointerWidth::Long).is_null());
        assert!(!BtreePtr::Short(0).is_null());
        assert_eq!(BtreePtr::null(PointerWidth::Short).block(), u32::MAX as u64);
        assert_eq!(format!("{}", BtreePtr::Long(NULL_LONG_PTR)), "null");
        assert_eq!(format!("{}", BtreePtr::Short(7)), "blk:7");
    }

    #[test]
    fn test_ptr_from_block() {
        assert_eq!(
            BtreePtr::from_block(PointerWidth::Short, 5),
            Some(BtreePtr::Short(5))
        );
        assert_eq!(BtreePtr::from_block(PointerWidth::Short, 1 << 32), None);
        assert_eq!(
            BtreePtr::from_block(PointerWidth::Long, 1 << 32),
            Some(BtreePtr::Long(1 << 32))
        );
    }

    #[test]
    fn test_ptr_encoding_is_big_endian() {
        let mut buf = [0u8; 8];
        BtreePtr::Short(0x0102_0304).encode(&mut buf);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(
            BtreePtr::decode(PointerWidth::Short, &buf),
            BtreePtr::Short(0x0102_0304)
        );

        BtreePtr::Long(0x0102_0304_0506_0708).encode(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(BtreePtr::decode(PointerWidth::Long, &buf).block(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_mem_head_layout() {
        let uuid = MetaUuid([0xEE; 16]);
        let head = MemHead::new(42, 1, uuid);
        let bytes = head.to_bytes();

        assert_eq!(&bytes[0..4], b"CATM");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(bytes[15], 42);
        assert_eq!(bytes[23], 1);
        assert_eq!(&bytes[24..40], &[0xEE; 16]);
        assert_eq!(MemHead::from_bytes(&bytes), head);
    }

    #[test]
    fn test_short_header_layout() {
        let mut header = BlockHeader::new(
            PointerWidth::Short,
            0xABCD_0001,
            1,
            42,
            MetaUuid([3; 16]),
            16,
        );
        header.numrecs = 5;
        header.rightsib = BtreePtr::Short(9);

        let mut buf = [0u8; SHORT_HEADER_LEN];
        header.write_to(&mut buf);

        assert_eq!(&buf[0..4], &[0xAB, 0xCD, 0x00, 0x01]);
        assert_eq!(&buf[4..8], &[0, 1, 0, 5]);
        assert_eq!(&buf[8..12], &[0xFF; 4]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 9]);
        assert_eq!(buf[23], 16);
        assert_eq!(&buf[32..48], &[3; 16]);
        assert_eq!(&buf[48..52], &[0, 0, 0, 42]);
        assert_eq!(BlockHeader::read_from(&buf, PointerWidth::Short), header);
    }

    #[test]
    fn test_long_header_layout() {
        let mut header = BlockHeader::new(
            PointerWidth::Long,
            0x7472_6362,
            0,
            1 << 40,
            MetaUuid::NIL,
            24,
        );
        header.leftsib = BtreePtr::Long(3);

        let mut buf = [0u8; LONG_HEADER_LEN];
        header.write_to(&mut buf);

        assert_eq!(&buf[0..4], b"trcb");
        assert_eq!(buf[15], 3);
        assert_eq!(&buf[16..24], &[0xFF; 8]);
        assert_eq!(buf[31], 24);
        assert_eq!(&buf[56..64], &(1u64 << 40).to_be_bytes());
        assert_eq!(BlockHeader::len(PointerWidth::Long), 72);
        assert_eq!(BlockHeader::read_from(&buf, PointerWidth::Long), header);
    }
}
