//! Entry index and replacement lists
//!
//! The index maps file addresses to arena handles; every resident entry is
//! also threaded onto exactly one of the replacement structures: the LRU
//! list (eviction candidates), the pinned list (excluded from eviction), or
//! neither while protected. Byte accounting is maintained on every
//! transition so the cache can answer "how much is resident" and "how much
//! is dirty" in O(1).

use crate::entry::{Arena, CacheEntry, EntryId, ListHome};
use std::collections::HashMap;
use tessera_common::{Addr, Error, Result};

/// One doubly-linked replacement list threaded through entry link fields
#[derive(Default)]
struct LinkedList {
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
    bytes: u64,
}

/// Address index plus replacement lists over the entry arena
#[derive(Default)]
pub struct EntryIndex {
    pub arena: Arena,
    map: HashMap<Addr, EntryId>,
    lru: LinkedList,
    pinned: LinkedList,
    protected_len: usize,
    total_bytes: u64,
    dirty_bytes: u64,
}

impl EntryIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Total resident bytes
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Resident dirty bytes
    #[must_use]
    pub const fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    /// Resident clean bytes
    #[must_use]
    pub const fn clean_bytes(&self) -> u64 {
        self.total_bytes - self.dirty_bytes
    }

    /// Entries on the LRU list
    #[must_use]
    pub const fn lru_len(&self) -> usize {
        self.lru.len
    }

    /// Entries on the pinned list
    #[must_use]
    pub const fn pinned_len(&self) -> usize {
        self.pinned.len
    }

    /// Protected entries (on neither list)
    #[must_use]
    pub const fn protected_len(&self) -> usize {
        self.protected_len
    }

    /// Look up an entry by address
    #[must_use]
    pub fn lookup(&self, addr: Addr) -> Option<EntryId> {
        self.map.get(&addr).copied()
    }

    /// Insert a new entry and thread it onto the structure named by its
    /// `home` field (LRU head, pinned list, or protected).
    pub fn insert(&mut self, entry: CacheEntry) -> Result<EntryId> {
        let addr = entry.addr;
        if self.map.contains_key(&addr) {
            return Err(Error::AddrInUse(addr));
        }
        let home = entry.home;
        let len = entry.len;
        let dirty = entry.dirty;

        let id = self.arena.insert(entry);
        self.map.insert(addr, id);
        self.total_bytes += len;
        if dirty {
            self.dirty_bytes += len;
        }
        self.link(id, home);
        Ok(id)
    }

    /// Insert at the LRU tail instead of the head (image reconstruction
    /// replays recency oldest-last by appending in stream order).
    pub fn insert_at_lru_tail(&mut self, entry: CacheEntry) -> Result<EntryId> {
        debug_assert_eq!(entry.home, ListHome::Lru);
        let addr = entry.addr;
        if self.map.contains_key(&addr) {
            return Err(Error::AddrInUse(addr));
        }
        let len = entry.len;
        let dirty = entry.dirty;

        let id = self.arena.insert(entry);
        self.map.insert(addr, id);
        self.total_bytes += len;
        if dirty {
            self.dirty_bytes += len;
        }
        self.push_tail(ListKind::Lru, id);
        Ok(id)
    }

    /// Remove an entry from the index, its list, and the arena
    pub fn remove(&mut self, id: EntryId) -> Result<CacheEntry> {
        self.unlink(id)?;
        let entry = self
            .arena
            .remove(id)
            .ok_or_else(|| Error::invariant("remove of a stale entry handle"))?;
        self.map.remove(&entry.addr);
        self.total_bytes -= entry.len;
        if entry.dirty {
            self.dirty_bytes -= entry.len;
        }
        Ok(entry)
    }

    /// Move an LRU-resident entry to the LRU head
    pub fn touch(&mut self, id: EntryId) -> Result<()> {
        let home = self.entry(id)?.home;
        if home != ListHome::Lru {
            return Ok(());
        }
        self.unlink(id)?;
        self.link(id, ListHome::Lru);
        Ok(())
    }

    /// Migrate an entry between protected / pinned / LRU membership
    ///
    /// LRU membership always re-enters at the head.
    pub fn set_home(&mut self, id: EntryId, home: ListHome) -> Result<()> {
        self.unlink(id)?;
        self.entry_mut(id)?.home = home;
        self.link(id, home);
        Ok(())
    }

    /// Re-key an entry under a new address
    pub fn rekey(&mut self, id: EntryId, new_addr: Addr) -> Result<()> {
        if self.map.contains_key(&new_addr) {
            return Err(Error::AddrInUse(new_addr));
        }
        let old_addr = self.entry(id)?.addr;
        self.map.remove(&old_addr);
        self.map.insert(new_addr, id);
        self.entry_mut(id)?.addr = new_addr;
        Ok(())
    }

    /// Adjust byte accounting for an entry whose length changed
    pub fn resize(&mut self, id: EntryId, new_len: u64) -> Result<()> {
        let (old_len, dirty, home) = {
            let entry = self.entry(id)?;
            (entry.len, entry.dirty, entry.home)
        };
        self.total_bytes = self.total_bytes - old_len + new_len;
        if dirty {
            self.dirty_bytes = self.dirty_bytes - old_len + new_len;
        }
        match home {
            ListHome::Lru => self.lru.bytes = self.lru.bytes - old_len + new_len,
            ListHome::Pinned => self.pinned.bytes = self.pinned.bytes - old_len + new_len,
            ListHome::Protected => {}
        }
        self.entry_mut(id)?.len = new_len;
        Ok(())
    }

    /// Record a clean-to-dirty transition for byte accounting
    pub fn note_dirtied(&mut self, len: u64) {
        self.dirty_bytes += len;
    }

    /// Record a dirty-to-clean transition for byte accounting
    pub fn note_cleaned(&mut self, len: u64) {
        self.dirty_bytes -= len;
    }

    /// LRU entries from the tail (least recent) to the head
    #[must_use]
    pub fn lru_tail_to_head(&self) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(self.lru.len);
        let mut cursor = self.lru.tail;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.arena.get(id).and_then(|e| e.link_prev);
        }
        ids
    }

    /// LRU entries from the head (most recent) to the tail
    #[must_use]
    pub fn lru_head_to_tail(&self) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(self.lru.len);
        let mut cursor = self.lru.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.arena.get(id).and_then(|e| e.link_next);
        }
        ids
    }

    /// Borrow an entry through its handle, failing on staleness
    pub fn entry(&self, id: EntryId) -> Result<&CacheEntry> {
        self.arena
            .get(id)
            .ok_or_else(|| Error::invariant("stale entry handle"))
    }

    /// Mutably borrow an entry through its handle
    pub fn entry_mut(&mut self, id: EntryId) -> Result<&mut CacheEntry> {
        self.arena
            .get_mut(id)
            .ok_or_else(|| Error::invariant("stale entry handle"))
    }

    fn list(&mut self, kind: ListKind) -> &mut LinkedList {
        match kind {
            ListKind::Lru => &mut self.lru,
            ListKind::Pinned => &mut self.pinned,
        }
    }

    fn link(&mut self, id: EntryId, home: ListHome) {
        let kind = match home {
            ListHome::Protected => {
                self.protected_len += 1;
                return;
            }
            ListHome::Pinned => ListKind::Pinned,
            ListHome::Lru => ListKind::Lru,
        };
        self.push_head(kind, id);
    }

    fn push_head(&mut self, kind: ListKind, id: EntryId) {
        let old_head = self.list(kind).head;
        let len = {
            let entry = self.arena.get_mut(id).expect("linking a stale handle");
            entry.link_prev = None;
            entry.link_next = old_head;
            entry.len
        };
        if let Some(head) = old_head {
            if let Some(head_entry) = self.arena.get_mut(head) {
                head_entry.link_prev = Some(id);
            }
        }
        let list = self.list(kind);
        list.head = Some(id);
        if list.tail.is_none() {
            list.tail = Some(id);
        }
        list.len += 1;
        list.bytes += len;
    }

    fn push_tail(&mut self, kind: ListKind, id: EntryId) {
        let old_tail = self.list(kind).tail;
        let len = {
            let entry = self.arena.get_mut(id).expect("linking a stale handle");
            entry.link_next = None;
            entry.link_prev = old_tail;
            entry.len
        };
        if let Some(tail) = old_tail {
            if let Some(tail_entry) = self.arena.get_mut(tail) {
                tail_entry.link_next = Some(id);
            }
        }
        let list = self.list(kind);
        list.tail = Some(id);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.len += 1;
        list.bytes += len;
    }

    fn unlink(&mut self, id: EntryId) -> Result<()> {
        let (home, prev, next, len) = {
            let entry = self.entry(id)?;
            (entry.home, entry.link_prev, entry.link_next, entry.len)
        };
        let kind = match home {
            ListHome::Protected => {
                self.protected_len -= 1;
                return Ok(());
            }
            ListHome::Pinned => ListKind::Pinned,
            ListHome::Lru => ListKind::Lru,
        };

        match prev {
            Some(prev_id) => {
                self.entry_mut(prev_id)?.link_next = next;
            }
            None => self.list(kind).head = next,
        }
        match next {
            Some(next_id) => {
                self.entry_mut(next_id)?.link_prev = prev;
            }
            None => self.list(kind).tail = prev,
        }

        let entry = self.entry_mut(id)?;
        entry.link_prev = None;
        entry.link_next = None;

        let list = self.list(kind);
        list.len -= 1;
        list.bytes -= len;
        Ok(())
    }

    /// Full consistency check: every resident entry is in the map and in
    /// exactly one replacement structure, and the byte accounting matches
    /// the sum of resident entry sizes.
    pub fn validate(&self) -> Result<()> {
        if self.map.len() != self.arena.len() {
            return Err(Error::invariant(format!(
                "index has {} addresses but arena has {} entries",
                self.map.len(),
                self.arena.len()
            )));
        }

        let mut total = 0u64;
        let mut dirty = 0u64;
        let mut protected = 0usize;
        for (id, entry) in self.arena.iter() {
            if self.map.get(&entry.addr) != Some(&id) {
                return Err(Error::invariant(format!(
                    "entry at {} not indexed under its address",
                    entry.addr
                )));
            }
            total += entry.len;
            if entry.dirty {
                dirty += entry.len;
            }
            if entry.home == ListHome::Protected {
                protected += 1;
                if !entry.is_protected() {
                    return Err(Error::invariant(format!(
                        "unprotected entry at {} off both lists",
                        entry.addr
                    )));
                }
            }
        }
        if total != self.total_bytes || dirty != self.dirty_bytes {
            return Err(Error::invariant(format!(
                "byte accounting mismatch: tracked {}/{} dirty, actual {total}/{dirty} dirty",
                self.total_bytes, self.dirty_bytes
            )));
        }
        if protected != self.protected_len {
            return Err(Error::invariant("protected entry count mismatch"));
        }

        self.validate_list(ListKind::Lru, ListHome::Lru)?;
        self.validate_list(ListKind::Pinned, ListHome::Pinned)?;
        if self.lru.len + self.pinned.len + self.protected_len != self.arena.len() {
            return Err(Error::invariant(
                "entry not in exactly one replacement structure",
            ));
        }
        Ok(())
    }

    fn validate_list(&self, kind: ListKind, home: ListHome) -> Result<()> {
        let list = match kind {
            ListKind::Lru => &self.lru,
            ListKind::Pinned => &self.pinned,
        };
        let mut len = 0usize;
        let mut bytes = 0u64;
        let mut prev: Option<EntryId> = None;
        let mut cursor = list.head;
        while let Some(id) = cursor {
            let entry = self.entry(id)?;
            if entry.home != home {
                return Err(Error::invariant(format!(
                    "entry at {} on the wrong replacement list",
                    entry.addr
                )));
            }
            if entry.link_prev != prev {
                return Err(Error::invariant("broken back link in replacement list"));
            }
            len += 1;
            bytes += entry.len;
            prev = cursor;
            cursor = entry.link_next;
        }
        if prev != list.tail || len != list.len || bytes != list.bytes {
            return Err(Error::invariant("replacement list accounting mismatch"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ListKind {
    Lru,
    Pinned,
}
