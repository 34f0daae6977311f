//! Core identifier types for Tessera
//!
//! Newtypes for file addresses, metadata entry type ids, tags, and flush
//! ordering rings. These are shared between the cache and its collaborators
//! (block store backends and per-type codecs).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte offset of a metadata block within the logical file
///
/// The address is the stable key of a cache entry: it never changes while
/// the entry is resident, except through an explicit move operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Addr(u64);

impl Addr {
    /// Create an address from a raw file offset
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Raw file offset
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.0
    }

    /// Address advanced by `len` bytes
    #[must_use]
    pub const fn add(self, len: u64) -> Self {
        Self(self.0 + len)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Addr {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

/// Identifier of a metadata entry type
///
/// Each kind of metadata block registers a per-type codec; the type id is
/// recorded in cache images so a placeholder entry can be routed back to
/// the right codec on first access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryTypeId(pub u8);

impl fmt::Display for EntryTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Tag grouping all entries logically owned by one higher-level object
///
/// The tag key is the file address of the owning object's header. Two
/// well-known buckets hold entries shared between objects; group sweeps may
/// include them so that group operations stay correct for entries the tag
/// does not own outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagKey(u64);

impl TagKey {
    /// Bucket for shared-message entries, swept by global-extra group ops
    pub const SHARED_MESSAGE: Self = Self(u64::MAX - 1);

    /// Bucket for global-heap entries, swept by global-extra group ops
    pub const GLOBAL_HEAP: Self = Self(u64::MAX);

    /// Create a tag key from the owner's header address
    #[must_use]
    pub const fn new(owner: u64) -> Self {
        Self(owner)
    }

    /// Raw key value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is one of the two always-included global buckets
    #[must_use]
    pub const fn is_global(self) -> bool {
        matches!(self, Self::SHARED_MESSAGE | Self::GLOBAL_HEAP)
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SHARED_MESSAGE => write!(f, "tag:shared-message"),
            Self::GLOBAL_HEAP => write!(f, "tag:global-heap"),
            Self(k) => write!(f, "tag:{k:#x}"),
        }
    }
}

/// Flush ordering domain
///
/// Rings order whole classes of metadata relative to each other: every
/// entry in an outer ring must be clean before the next ring inward is
/// flushed. Free-space metadata therefore lands after the user metadata
/// it describes, and the superblock lands last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ring {
    /// Outermost ring: ordinary user-visible metadata
    User = 0,
    /// Raw-data free space manager metadata
    RawFreeSpace = 1,
    /// Metadata free space manager metadata
    MetaFreeSpace = 2,
    /// Superblock extension metadata
    SuperblockExt = 3,
    /// Innermost ring: the superblock itself
    Superblock = 4,
}

impl Ring {
    /// Number of rings
    pub const COUNT: usize = 5;

    /// Innermost ring that may appear in a cache image; superblock-class
    /// entries are always re-read on open and never serialized into images.
    pub const MAX_IN_IMAGE: Self = Self::MetaFreeSpace;

    /// All rings in flush order, outermost first
    pub const ALL: [Self; Self::COUNT] = [
        Self::User,
        Self::RawFreeSpace,
        Self::MetaFreeSpace,
        Self::SuperblockExt,
        Self::Superblock,
    ];

    /// Ordinal position, 0 = outermost
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Decode an ordinal back into a ring
    #[must_use]
    pub const fn from_ordinal(ord: u8) -> Option<Self> {
        match ord {
            0 => Some(Self::User),
            1 => Some(Self::RawFreeSpace),
            2 => Some(Self::MetaFreeSpace),
            3 => Some(Self::SuperblockExt),
            4 => Some(Self::Superblock),
            _ => None,
        }
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::User
    }
}

/// Width of file offsets and lengths in encoded structures
///
/// Matches the file's size-of-offsets; small files may use 4-byte fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrWidth {
    /// 4-byte offsets and lengths
    Four,
    /// 8-byte offsets and lengths
    Eight,
}

impl AddrWidth {
    /// Encoded size in bytes
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Four => 4,
            Self::Eight => 8,
        }
    }

    /// Largest value representable at this width
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::Four => u32::MAX as u64,
            Self::Eight => u64::MAX,
        }
    }
}

impl Default for AddrWidth {
    fn default() -> Self {
        Self::Eight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_ordering() {
        assert!(Addr::new(0x100) < Addr::new(0x200));
        assert_eq!(Addr::new(0x100).add(0x40), Addr::new(0x140));
        assert_eq!(Addr::new(0x1000).to_string(), "0x1000");
    }

    #[test]
    fn test_ring_flush_order() {
        let mut prev = None;
        for ring in Ring::ALL {
            if let Some(p) = prev {
                assert!(p < ring);
            }
            prev = Some(ring);
            assert_eq!(Ring::from_ordinal(ring.ordinal()), Some(ring));
        }
        assert_eq!(Ring::from_ordinal(5), None);
        assert!(Ring::Superblock > Ring::MAX_IN_IMAGE);
    }

    #[test]
    fn test_global_tags() {
        assert!(TagKey::GLOBAL_HEAP.is_global());
        assert!(TagKey::SHARED_MESSAGE.is_global());
        assert!(!TagKey::new(0x480).is_global());
        assert_ne!(TagKey::GLOBAL_HEAP, TagKey::SHARED_MESSAGE);
    }

    #[test]
    fn test_addr_width() {
        assert_eq!(AddrWidth::Four.size(), 4);
        assert_eq!(AddrWidth::Eight.size(), 8);
        assert_eq!(AddrWidth::default(), AddrWidth::Eight);
    }
}
