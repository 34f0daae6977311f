//! Cache entries and the slot arena
//!
//! Entries live in an arena of slots addressed by generation-checked
//! [`EntryId`] handles. All of the cache's internal structures (the address
//! index, the replacement lists, tag lists, and the flush-dependency graph)
//! refer to entries through handles, so an entry evicted mid-traversal
//! leaves a stale id behind rather than a dangling pointer: a stale id
//! simply fails the generation check on lookup.

use crate::client::{EntryClient, Object};
use bytes::Bytes;
use std::rc::Rc;
use tessera_common::{Addr, EntryTypeId, Ring, TagKey};

/// Generation-checked handle to an arena slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

/// Protection state of an entry
///
/// An exclusively protected entry is reserved for one mutator; read-only
/// protection is shared and counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protection {
    Unprotected,
    Exclusive,
    ReadOnly(u32),
}

impl Protection {
    /// Whether any protector holds the entry
    #[must_use]
    pub const fn is_protected(self) -> bool {
        !matches!(self, Self::Unprotected)
    }
}

/// Which replacement structure currently holds the entry
///
/// Every resident entry is in exactly one of these at all times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListHome {
    /// Exclusively or shared-read protected; excluded from both lists
    Protected,
    /// On the pinned-entry list; excluded from eviction
    Pinned,
    /// On the LRU list; an eviction candidate
    Lru,
}

/// Entry payload: a decoded live object, or raw bytes awaiting first access
pub enum Slot {
    /// Decoded object plus the codec that owns it
    Live {
        object: Object,
        client: Rc<dyn EntryClient>,
    },
    /// Placeholder created during cache-image reconstruction; upgraded in
    /// place on first real access
    Placeholder,
}

impl Slot {
    /// Whether the entry still awaits its first real access
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder)
    }
}

/// One resident metadata entry
pub struct CacheEntry {
    /// Stable key: the entry's file address
    pub addr: Addr,
    /// On-disk length in bytes
    pub len: u64,
    /// Owning metadata type
    pub type_id: EntryTypeId,
    /// Flush ordering domain
    pub ring: Ring,
    /// Needs to be written before eviction or close
    pub dirty: bool,
    /// Protection state
    pub protection: Protection,
    /// Pinned (excluded from eviction even when unprotected)
    pub pinned: bool,
    /// Defer this entry to the final pass of a flush; also skipped by
    /// parallel candidate nomination
    pub flush_me_last: bool,
    /// Owning tag, if any
    pub tag: Option<TagKey>,
    /// Serialized image of the entry
    pub image: Option<Bytes>,
    /// The image reflects the current object state
    pub image_up_to_date: bool,
    /// Number of cache-image round trips survived
    pub age: u8,
    /// Payload
    pub slot: Slot,

    // Flush-dependency bookkeeping
    pub flush_dep_parents: Vec<EntryId>,
    pub flush_dep_nchildren: usize,
    pub flush_dep_ndirty_children: usize,

    // Replacement-list linkage (LRU or pinned list, per `home`)
    pub home: ListHome,
    pub link_prev: Option<EntryId>,
    pub link_next: Option<EntryId>,

    // Tag-list linkage
    pub tag_prev: Option<EntryId>,
    pub tag_next: Option<EntryId>,
}

impl CacheEntry {
    /// Create a fresh live entry; the caller places it into the index and
    /// replacement structures.
    pub fn new_live(
        addr: Addr,
        len: u64,
        ring: Ring,
        object: Object,
        client: Rc<dyn EntryClient>,
        dirty: bool,
    ) -> Self {
        Self {
            addr,
            len,
            type_id: client.entry_type_id(),
            ring,
            dirty,
            protection: Protection::Unprotected,
            pinned: false,
            flush_me_last: false,
            tag: None,
            image: None,
            image_up_to_date: false,
            age: 0,
            slot: Slot::Live { object, client },
            flush_dep_parents: Vec::new(),
            flush_dep_nchildren: 0,
            flush_dep_ndirty_children: 0,
            home: ListHome::Lru,
            link_prev: None,
            link_next: None,
            tag_prev: None,
            tag_next: None,
        }
    }

    /// Create a placeholder entry from a decoded cache-image record
    pub fn new_placeholder(
        addr: Addr,
        len: u64,
        type_id: EntryTypeId,
        ring: Ring,
        image: Bytes,
        dirty: bool,
        age: u8,
    ) -> Self {
        Self {
            addr,
            len,
            type_id,
            ring,
            dirty,
            protection: Protection::Unprotected,
            pinned: false,
            flush_me_last: false,
            tag: None,
            image: Some(image),
            image_up_to_date: true,
            age,
            slot: Slot::Placeholder,
            flush_dep_parents: Vec::new(),
            flush_dep_nchildren: 0,
            flush_dep_ndirty_children: 0,
            home: ListHome::Lru,
            link_prev: None,
            link_next: None,
            tag_prev: None,
            tag_next: None,
        }
    }

    /// Whether the entry is currently protected
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        self.protection.is_protected()
    }

    /// Client codec, when the entry is live
    #[must_use]
    pub fn client(&self) -> Option<&Rc<dyn EntryClient>> {
        match &self.slot {
            Slot::Live { client, .. } => Some(client),
            Slot::Placeholder => None,
        }
    }
}

/// Token returned by `protect`; consumed by `unprotect`
///
/// The guard does not release on drop: the single-owner cache cannot be
/// reached from a destructor. `MetadataCache::with_entry_mut` wraps the
/// protect/unprotect pair and releases on every exit path.
#[must_use = "a protected entry must be unprotected"]
pub struct ProtectGuard {
    pub(crate) id: EntryId,
    pub(crate) addr: Addr,
    pub(crate) read_only: bool,
}

impl ProtectGuard {
    /// Address of the protected entry
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }

    /// Whether this is a shared read-only protection
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Token returned by `pin`; consumed by `unpin`
#[must_use = "a pinned entry must be unpinned"]
pub struct PinGuard {
    pub(crate) id: EntryId,
    pub(crate) addr: Addr,
}

impl PinGuard {
    /// Address of the pinned entry
    #[must_use]
    pub const fn addr(&self) -> Addr {
        self.addr
    }
}

struct ArenaSlot {
    generation: u32,
    entry: Option<CacheEntry>,
}

/// Slot arena holding all resident entries
#[derive(Default)]
pub struct Arena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    len: usize,
}

impl Arena {
    /// Create an empty arena
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena holds no entries
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Place an entry into a slot and return its handle
    pub fn insert(&mut self, entry: CacheEntry) -> EntryId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            EntryId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(ArenaSlot {
                generation: 0,
                entry: Some(entry),
            });
            EntryId {
                index,
                generation: 0,
            }
        }
    }

    /// Borrow an entry; `None` for a stale or never-issued handle
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Mutably borrow an entry
    #[must_use]
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Remove an entry, invalidating its handle
    pub fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(entry)
    }

    /// Iterate over all live entries
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    /// Handles of all live entries
    #[must_use]
    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
