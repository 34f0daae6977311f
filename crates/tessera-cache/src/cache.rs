//! The metadata object cache
//!
//! [`MetadataCache`] owns the entry index, replacement lists, tag index,
//! and flush machinery for one open file. It is single-threaded by design:
//! every operation takes `&mut self` and there are no internal locks.
//! Multi-process coordination happens strictly through the parallel
//! candidate coordinator built on top of this type.
//!
//! Write ordering rules enforced here:
//! - rings flush outermost first; an inner ring is not touched until the
//!   outer ring is fully clean,
//! - within one pass, dirty entries are visited in non-decreasing address
//!   order,
//! - a flush-dependency parent is never serialized while it has a dirty
//!   dependency child.

use crate::client::{EntryClient, NotifyAction, Object};
use crate::deps;
use crate::entry::{
    CacheEntry, EntryId, ListHome, PinGuard, ProtectGuard, Protection, Slot,
};
use crate::index::EntryIndex;
use crate::log::{log_op, OpLog};
use crate::stats::CacheStats;
use crate::store::BlockStore;
use crate::tags::TagIndex;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use tessera_common::{Addr, CacheConfig, Error, Result, Ring, TagKey};
use tracing::{debug, warn};

/// Options for [`MetadataCache::protect`]
#[derive(Default, Clone, Copy)]
pub struct ProtectOpts {
    /// Shared read-only protection instead of exclusive
    pub read_only: bool,
    /// Ring for a newly loaded entry
    pub ring: Ring,
    /// Tag applied to a newly loaded entry
    pub tag: Option<TagKey>,
}

/// Options for [`MetadataCache::insert`]
#[derive(Default, Clone, Copy)]
pub struct InsertOpts {
    /// Ring of the new entry
    pub ring: Ring,
    /// Tag applied to the new entry
    pub tag: Option<TagKey>,
    /// Defer the entry to the final pass of every flush
    pub flush_me_last: bool,
}

/// Flush behavior flags
#[derive(Default, Clone, Copy)]
struct FlushFlags {
    /// Drop dirty flags without writing
    clear_only: bool,
    /// Teardown flush: ignore corks, error on protected entries
    invalidate: bool,
}

/// Read-only snapshot of one entry's externally visible state
#[derive(Debug, Clone)]
pub struct EntrySummary {
    pub addr: Addr,
    pub len: u64,
    pub ring: Ring,
    pub dirty: bool,
    pub pinned: bool,
    pub protected: bool,
    pub is_placeholder: bool,
    pub tag: Option<TagKey>,
    pub flush_dep_parent_count: usize,
    pub flush_dep_child_count: usize,
}

/// Location of a written cache image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLocation {
    pub addr: Addr,
    pub len: u64,
}

/// Metadata object cache for one open file
pub struct MetadataCache {
    pub(crate) config: CacheConfig,
    pub(crate) store: Box<dyn BlockStore>,
    pub(crate) index: EntryIndex,
    pub(crate) tags: TagIndex,
    pub(crate) stats: CacheStats,
    pub(crate) log: OpLog,
}

impl MetadataCache {
    /// Create a cache over a block store
    pub fn new(store: impl BlockStore + 'static, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let mut log = OpLog::new();
        if let Some(path) = &config.log.path {
            log.enable(path, config.log.start_on_open)?;
        }
        debug!(max_size = config.max_size, "metadata cache created");
        Ok(Self {
            config,
            store: Box::new(store),
            index: EntryIndex::new(),
            tags: TagIndex::new(),
            stats: CacheStats::default(),
            log,
        })
    }

    /// Cache configuration
    #[must_use]
    pub const fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Aggregate statistics
    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Reset statistics counters
    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Number of resident entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the cache holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Total resident bytes
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    /// Resident dirty bytes
    #[must_use]
    pub const fn dirty_bytes(&self) -> u64 {
        self.index.dirty_bytes()
    }

    // ------------------------------------------------------------------
    // Protect / unprotect
    // ------------------------------------------------------------------

    /// Protect an entry for access, loading it on a miss
    ///
    /// An exclusive protection reserves the entry for one mutator;
    /// `read_only` protections are shared and counted. While protected the
    /// entry is off the replacement lists and immune to eviction, flush
    /// resizing, and tag sweeps.
    pub fn protect(
        &mut self,
        client: &Rc<dyn EntryClient>,
        addr: Addr,
        udata: &dyn Any,
        opts: ProtectOpts,
    ) -> Result<ProtectGuard> {
        let id = match self.index.lookup(addr) {
            Some(id) => {
                self.stats.hits += 1;
                if self.index.entry(id)?.slot.is_placeholder() {
                    self.upgrade_placeholder(id, client, udata)?;
                }
                id
            }
            None => {
                self.stats.misses += 1;
                self.load_entry(client, addr, udata, opts)?
            }
        };

        let entry = self.index.entry_mut(id)?;
        let first = match (&mut entry.protection, opts.read_only) {
            (p @ Protection::Unprotected, false) => {
                *p = Protection::Exclusive;
                true
            }
            (p @ Protection::Unprotected, true) => {
                *p = Protection::ReadOnly(1);
                true
            }
            (Protection::ReadOnly(n), true) => {
                *n += 1;
                false
            }
            (Protection::ReadOnly(_) | Protection::Exclusive, _) => {
                return Err(Error::EntryProtected(addr));
            }
        };
        if first {
            self.index.set_home(id, ListHome::Protected)?;
        }
        log_op!(self.log, "protect addr={addr} read_only={}", opts.read_only);
        Ok(ProtectGuard {
            id,
            addr,
            read_only: opts.read_only,
        })
    }

    /// Release a protection, optionally dirtying the entry
    ///
    /// The entry returns to the pinned list if pinned, otherwise to the
    /// LRU head.
    pub fn unprotect(&mut self, guard: ProtectGuard, dirtied: bool) -> Result<()> {
        let ProtectGuard { id, addr, read_only } = guard;
        if dirtied && read_only {
            return Err(Error::invariant(format!(
                "read-only protection of {addr} cannot dirty the entry"
            )));
        }

        let entry = self.index.entry_mut(id)?;
        let released = match &mut entry.protection {
            Protection::Unprotected => {
                return Err(Error::invariant(format!(
                    "unprotect of unprotected entry at {addr}"
                )));
            }
            p @ Protection::Exclusive => {
                *p = Protection::Unprotected;
                true
            }
            Protection::ReadOnly(1) => {
                entry.protection = Protection::Unprotected;
                true
            }
            Protection::ReadOnly(n) => {
                *n -= 1;
                false
            }
        };

        if dirtied {
            self.mark_dirty_internal(id)?;
        }
        if released {
            let home = if self.index.entry(id)?.pinned {
                ListHome::Pinned
            } else {
                ListHome::Lru
            };
            self.index.set_home(id, home)?;
        }
        log_op!(self.log, "unprotect addr={addr} dirtied={dirtied}");
        Ok(())
    }

    /// Protect, run `f` against the live object, and unprotect on every
    /// exit path
    ///
    /// `f` returns the caller's value plus whether it dirtied the object.
    /// If `f` fails, the entry is unprotected clean and the error is
    /// propagated.
    pub fn with_entry_mut<R>(
        &mut self,
        client: &Rc<dyn EntryClient>,
        addr: Addr,
        udata: &dyn Any,
        f: impl FnOnce(&mut dyn Any) -> Result<(R, bool)>,
    ) -> Result<R> {
        let guard = self.protect(client, addr, udata, ProtectOpts::default())?;
        let outcome = self.object_mut(&guard).and_then(f);
        match outcome {
            Ok((value, dirtied)) => {
                self.unprotect(guard, dirtied)?;
                Ok(value)
            }
            Err(err) => {
                self.unprotect(guard, false)?;
                Err(err)
            }
        }
    }

    /// Borrow the live object behind a protection
    pub fn object(&self, guard: &ProtectGuard) -> Result<&dyn Any> {
        match &self.index.entry(guard.id)?.slot {
            Slot::Live { object, .. } => Ok(object.as_ref()),
            Slot::Placeholder => Err(Error::invariant("protected entry left as placeholder")),
        }
    }

    /// Mutably borrow the live object behind a protection
    pub fn object_mut(&mut self, guard: &ProtectGuard) -> Result<&mut dyn Any> {
        if guard.read_only {
            return Err(Error::invariant(format!(
                "mutable access through read-only protection of {}",
                guard.addr
            )));
        }
        match &mut self.index.entry_mut(guard.id)?.slot {
            Slot::Live { object, .. } => Ok(object.as_mut()),
            Slot::Placeholder => Err(Error::invariant("protected entry left as placeholder")),
        }
    }

    // ------------------------------------------------------------------
    // Insert / expunge / modify
    // ------------------------------------------------------------------

    /// Insert a brand new (necessarily dirty) entry
    pub fn insert(
        &mut self,
        client: &Rc<dyn EntryClient>,
        addr: Addr,
        len: u64,
        object: Object,
        opts: InsertOpts,
    ) -> Result<()> {
        if self.index.lookup(addr).is_some() {
            return Err(Error::AddrInUse(addr));
        }
        self.make_space(len)?;

        let mut entry = CacheEntry::new_live(addr, len, opts.ring, object, client.clone(), true);
        entry.flush_me_last = opts.flush_me_last;
        let id = self.index.insert(entry)?;
        if let Some(key) = opts.tag {
            self.tags.tag(&mut self.index, id, key)?;
        }
        self.notify_entry(id, NotifyAction::AfterInsert)?;
        self.stats.insertions += 1;
        log_op!(self.log, "insert addr={addr} len={len}");
        Ok(())
    }

    /// Drop an entry without writing it, dirty or not
    ///
    /// The entry must be unprotected, unpinned, and free of flush
    /// dependencies.
    pub fn expunge(&mut self, addr: Addr) -> Result<()> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        let entry = self.index.entry(id)?;
        if entry.is_protected() {
            return Err(Error::EntryProtected(addr));
        }
        if entry.pinned {
            return Err(Error::EntryPinned(addr));
        }
        if deps::has_dependencies(&self.index, id)? {
            return Err(Error::invariant(format!(
                "expunge of {addr} with live flush dependencies"
            )));
        }
        self.evict_single(id)?;
        self.stats.expunges += 1;
        log_op!(self.log, "expunge addr={addr}");
        Ok(())
    }

    /// Mark a protected or pinned entry dirty
    pub fn mark_dirty(&mut self, addr: Addr) -> Result<()> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        let entry = self.index.entry(id)?;
        if !entry.is_protected() && !entry.pinned {
            return Err(Error::invariant(format!(
                "mark_dirty of {addr} requires protection or a pin"
            )));
        }
        self.mark_dirty_internal(id)?;
        log_op!(self.log, "mark_dirty addr={addr}");
        Ok(())
    }

    /// Resize a protected or pinned entry
    pub fn resize(&mut self, addr: Addr, new_len: u64) -> Result<()> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        let entry = self.index.entry(id)?;
        if !entry.is_protected() && !entry.pinned {
            return Err(Error::invariant(format!(
                "resize of {addr} requires protection or a pin"
            )));
        }
        self.index.resize(id, new_len)?;
        let entry = self.index.entry_mut(id)?;
        entry.image = None;
        entry.image_up_to_date = false;
        self.mark_dirty_internal(id)?;
        self.stats.resizes += 1;
        log_op!(self.log, "resize addr={addr} len={new_len}");
        Ok(())
    }

    /// Move an unprotected entry to a new address
    pub fn move_entry(&mut self, old: Addr, new: Addr) -> Result<()> {
        let id = self.index.lookup(old).ok_or(Error::EntryNotFound(old))?;
        if self.index.entry(id)?.is_protected() {
            return Err(Error::EntryProtected(old));
        }
        self.index.rekey(id, new)?;
        self.mark_dirty_internal(id)?;
        self.stats.moves += 1;
        log_op!(self.log, "move old={old} new={new}");
        Ok(())
    }

    /// Pin a resident entry, excluding it from eviction
    pub fn pin(&mut self, addr: Addr) -> Result<PinGuard> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        let entry = self.index.entry_mut(id)?;
        if entry.pinned {
            return Err(Error::EntryPinned(addr));
        }
        entry.pinned = true;
        if entry.home == ListHome::Lru {
            self.index.set_home(id, ListHome::Pinned)?;
        }
        self.stats.pins += 1;
        log_op!(self.log, "pin addr={addr}");
        Ok(PinGuard { id, addr })
    }

    /// Release a pin
    pub fn unpin(&mut self, guard: PinGuard) -> Result<()> {
        let PinGuard { id, addr } = guard;
        let entry = self.index.entry_mut(id)?;
        if !entry.pinned {
            return Err(Error::invariant(format!("unpin of unpinned entry at {addr}")));
        }
        entry.pinned = false;
        if entry.home == ListHome::Pinned {
            self.index.set_home(id, ListHome::Lru)?;
        }
        self.stats.unpins += 1;
        log_op!(self.log, "unpin addr={addr}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush dependencies
    // ------------------------------------------------------------------

    /// Create a flush dependency: `parent` may not be written while
    /// `child` is dirty
    ///
    /// Both entries must be resident and in the same ring; edges that
    /// would close a cycle are rejected.
    pub fn create_flush_dependency(&mut self, parent: Addr, child: Addr) -> Result<()> {
        let parent_id = self
            .index
            .lookup(parent)
            .ok_or(Error::EntryNotFound(parent))?;
        let child_id = self.index.lookup(child).ok_or(Error::EntryNotFound(child))?;
        if self.index.entry(parent_id)?.ring != self.index.entry(child_id)?.ring {
            return Err(Error::invariant(format!(
                "flush dependency between rings: {parent} and {child}"
            )));
        }
        deps::create_dependency(&mut self.index, parent_id, child_id)?;
        log_op!(self.log, "create_dependency parent={parent} child={child}");
        Ok(())
    }

    /// Destroy a flush dependency
    pub fn destroy_flush_dependency(&mut self, parent: Addr, child: Addr) -> Result<()> {
        let parent_id = self
            .index
            .lookup(parent)
            .ok_or(Error::EntryNotFound(parent))?;
        let child_id = self.index.lookup(child).ok_or(Error::EntryNotFound(child))?;
        deps::destroy_dependency(&mut self.index, parent_id, child_id)?;
        log_op!(self.log, "destroy_dependency parent={parent} child={child}");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------

    /// Attach a resident entry to a tag
    pub fn tag(&mut self, addr: Addr, key: TagKey) -> Result<()> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        self.tags.tag(&mut self.index, id, key)
    }

    /// Detach a resident entry from its tag
    pub fn untag(&mut self, addr: Addr) -> Result<()> {
        let id = self.index.lookup(addr).ok_or(Error::EntryNotFound(addr))?;
        self.tags.untag(&mut self.index, id)
    }

    /// Suppress flush and eviction for a tag
    pub fn cork(&mut self, key: TagKey) {
        self.tags.cork(key);
    }

    /// Lift flush/evict suppression for a tag
    pub fn uncork(&mut self, key: TagKey) -> Result<()> {
        self.tags.uncork(key)
    }

    /// Whether a tag is corked
    #[must_use]
    pub fn is_corked(&self, key: TagKey) -> bool {
        self.tags.is_corked(key)
    }

    /// Move every entry of `old` under `new`
    pub fn retag(&mut self, old: TagKey, new: TagKey) -> Result<()> {
        self.tags.retag(&mut self.index, old, new)
    }

    /// Visit every entry of a tag, optionally including the global
    /// shared-message and global-heap buckets
    pub fn for_each_tagged(
        &self,
        key: TagKey,
        include_global_extras: bool,
        mut f: impl FnMut(&EntrySummary),
    ) -> Result<()> {
        for id in self
            .tags
            .entries_for_group_op(&self.index, key, include_global_extras)
        {
            f(&self.summarize(id)?);
        }
        Ok(())
    }

    /// Flush every dirty entry of a tag (plus the global buckets)
    ///
    /// Suppressed while the tag is corked. Entries whose dirty dependency
    /// children lie outside the tagged set are left dirty.
    pub fn flush_tagged(&mut self, key: TagKey) -> Result<()> {
        if self.tags.is_corked(key) {
            debug!(%key, "flush_tagged suppressed by cork");
            return Ok(());
        }
        loop {
            let mut progress = false;
            let members = self
                .tags
                .entries_for_group_op(&self.index, key, true);
            let mut by_addr: BTreeMap<Addr, EntryId> = BTreeMap::new();
            for id in members {
                let entry = self.index.entry(id)?;
                if entry.dirty && !entry.is_protected() && entry.flush_dep_ndirty_children == 0 {
                    by_addr.insert(entry.addr, id);
                }
            }
            for (_, id) in by_addr {
                self.flush_single(id, true)?;
                progress = true;
            }
            if !progress {
                break;
            }
        }
        log_op!(self.log, "flush_tagged key={key}");
        Ok(())
    }

    /// Evict every entry of a tag (plus the global buckets), flushing
    /// dirty entries first; removes the TagInfo with its last entry
    ///
    /// Suppressed while the tag is corked.
    pub fn evict_tagged(&mut self, key: TagKey) -> Result<()> {
        if self.tags.is_corked(key) {
            debug!(%key, "evict_tagged suppressed by cork");
            return Ok(());
        }
        self.flush_tagged(key)?;
        loop {
            let mut progress = false;
            let members = self
                .tags
                .entries_for_group_op(&self.index, key, true);
            let remaining = members.len();
            for id in members {
                let entry = self.index.entry(id)?;
                if entry.is_protected() || entry.pinned {
                    continue;
                }
                if deps::has_dependencies(&self.index, id)? {
                    continue;
                }
                if entry.dirty {
                    self.flush_single(id, true)?;
                }
                self.evict_single(id)?;
                progress = true;
            }
            if !progress {
                if remaining > 0 {
                    return Err(Error::invariant(format!(
                        "evict_tagged {key} stalled with {remaining} unevictable entries"
                    )));
                }
                break;
            }
        }
        log_op!(self.log, "evict_tagged key={key}");
        Ok(())
    }

    /// Expunge every entry of a tag without writing (plus the global
    /// buckets)
    pub fn expunge_tagged(&mut self, key: TagKey) -> Result<()> {
        loop {
            let mut progress = false;
            let members = self.tags.entries_for_group_op(&self.index, key, true);
            let remaining = members.len();
            for id in members {
                let entry = self.index.entry(id)?;
                if entry.is_protected() || entry.pinned {
                    continue;
                }
                if deps::has_dependencies(&self.index, id)? {
                    continue;
                }
                self.evict_single(id)?;
                self.stats.expunges += 1;
                progress = true;
            }
            if !progress {
                if remaining > 0 {
                    return Err(Error::invariant(format!(
                        "expunge_tagged {key} stalled with {remaining} unevictable entries"
                    )));
                }
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    /// Flush every dirty entry, ring by ring from the outside in
    pub fn flush(&mut self) -> Result<()> {
        for ring in Ring::ALL {
            self.flush_ring(ring, FlushFlags::default())?;
        }
        log_op!(self.log, "flush");
        Ok(())
    }

    /// Drop every dirty flag without writing anything
    pub fn clear_all_dirty(&mut self) -> Result<()> {
        for ring in Ring::ALL {
            self.flush_ring(
                ring,
                FlushFlags {
                    clear_only: true,
                    ..FlushFlags::default()
                },
            )?;
        }
        Ok(())
    }

    /// Flush and destroy the whole cache, optionally writing a cache
    /// image first
    ///
    /// With image generation enabled, image-eligible entries are persisted
    /// through the image block and only cleared locally; everything else
    /// is written normally. Returns the image location when one was
    /// written.
    pub fn close(mut self) -> Result<Option<ImageLocation>> {
        if self.index.protected_len() > 0 {
            return Err(Error::invariant(format!(
                "close with {} protected entries",
                self.index.protected_len()
            )));
        }
        let image = if self.config.image.generate {
            self.write_cache_image()?
        } else {
            None
        };
        self.flush_invalidate()?;
        self.log.disable()?;
        Ok(image)
    }

    /// Flush everything and evict every entry
    pub(crate) fn flush_invalidate(&mut self) -> Result<()> {
        if self.index.protected_len() > 0 {
            return Err(Error::invariant(
                "flush_invalidate with protected entries",
            ));
        }
        for ring in Ring::ALL {
            self.flush_ring(
                ring,
                FlushFlags {
                    invalidate: true,
                    ..FlushFlags::default()
                },
            )?;
            self.destroy_ring(ring)?;
        }
        Ok(())
    }

    /// Flush one ring, looping until it is clean
    ///
    /// Each pass snapshots the ring's dirty entries in address order and
    /// flushes those whose dirty-child counters are zero; children
    /// flushed in one pass unblock their parents in the next.
    /// `flush_me_last` entries are deferred until nothing else makes
    /// progress. A pass that flushes nothing while eligible dirty entries
    /// remain means a dependency cycle and is fatal.
    fn flush_ring(&mut self, ring: Ring, flags: FlushFlags) -> Result<()> {
        let mut allow_flush_me_last = false;
        loop {
            let snapshot = self.dirty_in_ring(ring, flags)?;
            if snapshot.is_empty() {
                break;
            }
            let mut progress = false;
            for (&addr, &id) in &snapshot {
                // Revalidate: earlier flushes in this pass may have
                // restructured things through client notifications.
                if self.index.lookup(addr) != Some(id) {
                    continue;
                }
                let entry = self.index.entry(id)?;
                if !entry.dirty || entry.ring != ring || entry.is_protected() {
                    continue;
                }
                if entry.flush_dep_ndirty_children > 0 {
                    continue;
                }
                if entry.flush_me_last && !allow_flush_me_last {
                    continue;
                }
                self.flush_single(id, !flags.clear_only)?;
                progress = true;
            }
            if !progress {
                if allow_flush_me_last {
                    return Err(Error::invariant(format!(
                        "flush of ring {ring:?} stalled with {} dirty entries",
                        snapshot.len()
                    )));
                }
                allow_flush_me_last = true;
            }
        }
        Ok(())
    }

    /// Dirty entries of a ring eligible for this flush, in address order
    ///
    /// Entries held back by a cork are excluded, and so are entries whose
    /// dirty-child counters cannot drop because every dirty child below
    /// them is itself held back. Both stay dirty until the tag is
    /// uncorked.
    fn dirty_in_ring(&self, ring: Ring, flags: FlushFlags) -> Result<BTreeMap<Addr, EntryId>> {
        let mut map = BTreeMap::new();
        let mut corked = Vec::new();
        for (id, entry) in self.index.arena.iter() {
            if !entry.dirty || entry.ring != ring {
                continue;
            }
            if entry.is_protected() {
                if flags.invalidate {
                    return Err(Error::EntryProtected(entry.addr));
                }
                continue;
            }
            if !flags.invalidate
                && entry.tag.is_some_and(|key| self.tags.is_corked(key))
            {
                corked.push(id);
                continue;
            }
            map.insert(entry.addr, id);
        }
        if !corked.is_empty() {
            let suppressed = self.cork_suppressed_closure(corked)?;
            map.retain(|_, id| !suppressed.contains(id));
        }
        Ok(map)
    }

    /// Close the set of corked dirty entries upward over dependency edges
    ///
    /// A dirty parent joins the set once all of its dirty children are in
    /// it: no pass can lower its counter, so it is suppressed rather than
    /// stalled on.
    fn cork_suppressed_closure(&self, seed: Vec<EntryId>) -> Result<HashSet<EntryId>> {
        let mut suppressed = HashSet::new();
        let mut blocked_children: HashMap<EntryId, usize> = HashMap::new();
        let mut worklist = seed;
        while let Some(id) = worklist.pop() {
            if !suppressed.insert(id) {
                continue;
            }
            for &parent in &self.index.entry(id)?.flush_dep_parents {
                let Ok(parent_entry) = self.index.entry(parent) else {
                    continue;
                };
                if !parent_entry.dirty {
                    continue;
                }
                let blocked = blocked_children.entry(parent).or_insert(0);
                *blocked += 1;
                if *blocked == parent_entry.flush_dep_ndirty_children {
                    worklist.push(parent);
                }
            }
        }
        Ok(suppressed)
    }

    /// Evict every (now clean) entry of a ring during teardown
    fn destroy_ring(&mut self, ring: Ring) -> Result<()> {
        for id in self.index.arena.ids() {
            let Ok(entry) = self.index.entry(id) else {
                continue;
            };
            if entry.ring != ring {
                continue;
            }
            self.sever_edges_for_teardown(id)?;
            self.evict_single(id)?;
        }
        Ok(())
    }

    /// Flush one dirty entry: serialize, notify, write, mark clean
    pub(crate) fn flush_single(&mut self, id: EntryId, write: bool) -> Result<()> {
        debug_assert!(self.index.entry(id)?.dirty);
        if write {
            self.serialize_entry(id)?;
            self.notify_entry(id, NotifyAction::BeforeFlush)?;
            let (addr, image) = {
                let entry = self.index.entry(id)?;
                let image = entry
                    .image
                    .clone()
                    .ok_or_else(|| Error::invariant("flush of entry without an image"))?;
                (entry.addr, image)
            };
            self.store.write(addr, &image)?;
            self.stats.flushes += 1;
            self.notify_entry(id, NotifyAction::AfterFlush)?;
        } else {
            self.stats.clears += 1;
        }
        self.mark_clean_internal(id)?;
        Ok(())
    }

    /// Bring an entry's serialized image up to date
    pub(crate) fn serialize_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self.index.entry(id)?;
        if entry.image_up_to_date && entry.image.is_some() {
            return Ok(());
        }
        let (client, len) = match &entry.slot {
            Slot::Live { client, .. } => (client.clone(), entry.len),
            // A placeholder's raw bytes are its image by definition.
            Slot::Placeholder => {
                return Err(Error::invariant(
                    "placeholder entry with stale image",
                ));
            }
        };
        let entry = self.index.entry_mut(id)?;
        let Slot::Live { object, .. } = &mut entry.slot else {
            return Err(Error::invariant("entry changed shape during serialize"));
        };
        let image = client.serialize(object.as_ref(), len)?;
        if image.len() as u64 != len {
            return Err(Error::client(format!(
                "serialized image of {} is {} bytes, entry is {len}",
                entry.addr,
                image.len()
            )));
        }
        entry.image = Some(image);
        entry.image_up_to_date = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Space management
    // ------------------------------------------------------------------

    /// Make room for `needed` more bytes
    ///
    /// Scans the LRU from the tail, evicting clean entries first and then
    /// flushing-and-evicting dirty ones. Pinned, protected, corked, and
    /// dependency-bearing entries are skipped. A full pass that frees
    /// nothing with the target unmet is a hard failure, not a retry.
    fn make_space(&mut self, needed: u64) -> Result<()> {
        if self.index.total_bytes() + needed <= self.config.max_size {
            return Ok(());
        }
        let target = self.index.total_bytes() + needed - self.config.max_size;
        let mut freed = 0u64;

        while freed < target {
            let mut pass_freed = 0u64;

            // Clean entries first.
            for id in self.index.lru_tail_to_head() {
                if freed + pass_freed >= target {
                    break;
                }
                if !self.evictable(id)? {
                    continue;
                }
                if !self.index.entry(id)?.dirty {
                    let len = self.index.entry(id)?.len;
                    self.evict_single(id)?;
                    pass_freed += len;
                }
            }

            // Then flush-and-evict dirty entries in the same pass.
            if freed + pass_freed < target {
                for id in self.index.lru_tail_to_head() {
                    if freed + pass_freed >= target {
                        break;
                    }
                    if !self.evictable(id)? {
                        continue;
                    }
                    let entry = self.index.entry(id)?;
                    if entry.dirty && entry.flush_dep_ndirty_children == 0 {
                        let len = entry.len;
                        self.flush_single(id, true)?;
                        self.evict_single(id)?;
                        pass_freed += len;
                    }
                }
            }

            if pass_freed == 0 {
                warn!(
                    required = target,
                    freed, "eviction scan stalled on pinned/protected remainder"
                );
                return Err(Error::SpaceUnavailable {
                    required: target,
                    freed,
                });
            }
            freed += pass_freed;
        }
        self.restore_min_clean()
    }

    /// Flush cold dirty entries until the clean-size target holds again
    ///
    /// Runs only when cache pressure already forced an eviction scan.
    /// Entries are written but kept resident; a pinned/corked/dependent
    /// remainder below the target is tolerated, unlike a failed eviction.
    fn restore_min_clean(&mut self) -> Result<()> {
        let target = self.config.min_clean_size().min(self.index.total_bytes());
        while self.index.clean_bytes() < target {
            let mut progress = false;
            for id in self.index.lru_tail_to_head() {
                if self.index.clean_bytes() >= target {
                    break;
                }
                let Ok(entry) = self.index.entry(id) else {
                    continue;
                };
                if !entry.dirty || entry.flush_dep_ndirty_children > 0 {
                    continue;
                }
                if entry.tag.is_some_and(|key| self.tags.is_corked(key)) {
                    continue;
                }
                self.flush_single(id, true)?;
                progress = true;
            }
            if !progress {
                break;
            }
        }
        Ok(())
    }

    /// Whether the eviction scan may take this entry
    fn evictable(&self, id: EntryId) -> Result<bool> {
        // Stale ids happen when an earlier eviction in this pass removed
        // the entry.
        let Ok(entry) = self.index.entry(id) else {
            return Ok(false);
        };
        if entry.home != ListHome::Lru || entry.is_protected() || entry.pinned {
            return Ok(false);
        }
        if entry.tag.is_some_and(|key| self.tags.is_corked(key)) {
            return Ok(false);
        }
        Ok(!deps::has_dependencies(&self.index, id)?)
    }

    // ------------------------------------------------------------------
    // Internal transitions
    // ------------------------------------------------------------------

    pub(crate) fn mark_dirty_internal(&mut self, id: EntryId) -> Result<()> {
        let entry = self.index.entry_mut(id)?;
        entry.image_up_to_date = false;
        if entry.dirty {
            return Ok(());
        }
        entry.dirty = true;
        let len = entry.len;
        self.index.note_dirtied(len);
        let parents = deps::propagate_dirtied(&mut self.index, id)?;
        self.notify_entry(id, NotifyAction::EntryDirtied)?;
        for parent in parents {
            self.notify_entry(parent, NotifyAction::ChildDirtied)?;
        }
        Ok(())
    }

    pub(crate) fn mark_clean_internal(&mut self, id: EntryId) -> Result<()> {
        let entry = self.index.entry_mut(id)?;
        if !entry.dirty {
            return Ok(());
        }
        entry.dirty = false;
        let len = entry.len;
        self.index.note_cleaned(len);
        let parents = deps::propagate_cleaned(&mut self.index, id)?;
        self.notify_entry(id, NotifyAction::EntryCleaned)?;
        for parent in parents {
            self.notify_entry(parent, NotifyAction::ChildCleaned)?;
        }
        Ok(())
    }

    /// Evict one entry: notify, untag, remove, free
    fn evict_single(&mut self, id: EntryId) -> Result<()> {
        self.notify_entry(id, NotifyAction::BeforeEvict)?;
        self.tags.untag(&mut self.index, id)?;
        let entry = self.index.remove(id)?;
        if let Slot::Live { object, client } = entry.slot {
            client.free(object)?;
        }
        self.stats.evictions += 1;
        Ok(())
    }

    /// Sever the entry's parent-side edges during whole-cache teardown
    ///
    /// Parents already destroyed are skipped; child-side references to
    /// this entry die with their owners in the same teardown.
    fn sever_edges_for_teardown(&mut self, id: EntryId) -> Result<()> {
        let (dirty, parents) = {
            let entry = self.index.entry(id)?;
            (entry.dirty, entry.flush_dep_parents.clone())
        };
        for parent in parents {
            if let Some(parent_entry) = self.index.arena.get_mut(parent) {
                parent_entry.flush_dep_nchildren =
                    parent_entry.flush_dep_nchildren.saturating_sub(1);
                if dirty {
                    parent_entry.flush_dep_ndirty_children =
                        parent_entry.flush_dep_ndirty_children.saturating_sub(1);
                }
            }
        }
        self.index.entry_mut(id)?.flush_dep_parents.clear();
        Ok(())
    }

    /// Deliver a lifecycle notification to the entry's client
    ///
    /// Placeholders have no client yet and receive no notifications.
    pub(crate) fn notify_entry(&mut self, id: EntryId, action: NotifyAction) -> Result<()> {
        let client = match &self.index.entry(id)?.slot {
            Slot::Live { client, .. } => client.clone(),
            Slot::Placeholder => return Ok(()),
        };
        let Slot::Live { object, .. } = &mut self.index.entry_mut(id)?.slot else {
            return Ok(());
        };
        client.notify(action, object.as_mut())
    }

    /// Load an entry from storage on a cache miss
    fn load_entry(
        &mut self,
        client: &Rc<dyn EntryClient>,
        addr: Addr,
        udata: &dyn Any,
        opts: ProtectOpts,
    ) -> Result<EntryId> {
        let len = client.load_size(udata)?;
        self.make_space(len)?;
        let image = self.store.read(addr, len)?;
        let (object, dirty) = client.deserialize(&image, udata)?;

        let mut entry = CacheEntry::new_live(addr, len, opts.ring, object, client.clone(), dirty);
        entry.image = Some(image);
        entry.image_up_to_date = !dirty;
        let id = self.index.insert(entry)?;
        if let Some(key) = opts.tag {
            self.tags.tag(&mut self.index, id, key)?;
        }
        self.notify_entry(id, NotifyAction::AfterLoad)?;
        Ok(id)
    }

    /// Upgrade a placeholder to a live object on first real access
    ///
    /// Dependency edges stay where they are: the placeholder and the live
    /// entry share one arena slot, so every handle remains valid.
    fn upgrade_placeholder(
        &mut self,
        id: EntryId,
        client: &Rc<dyn EntryClient>,
        udata: &dyn Any,
    ) -> Result<EntryId> {
        let entry = self.index.entry(id)?;
        if entry.type_id != client.entry_type_id() {
            return Err(Error::client(format!(
                "placeholder at {} has {} but was accessed as {}",
                entry.addr,
                entry.type_id,
                client.entry_type_id()
            )));
        }
        let image = entry
            .image
            .clone()
            .ok_or_else(|| Error::invariant("placeholder without image bytes"))?;
        let (object, decode_dirty) = client.deserialize(&image, udata)?;

        let entry = self.index.entry_mut(id)?;
        entry.slot = Slot::Live {
            object,
            client: client.clone(),
        };
        if decode_dirty {
            self.mark_dirty_internal(id)?;
        }
        self.stats.placeholder_upgrades += 1;
        self.notify_entry(id, NotifyAction::AfterLoad)?;
        log_op!(self.log, "upgrade addr={}", self.index.entry(id)?.addr);
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Externally visible state of one entry
    pub fn entry_status(&self, addr: Addr) -> Option<EntrySummary> {
        let id = self.index.lookup(addr)?;
        self.summarize(id).ok()
    }

    fn summarize(&self, id: EntryId) -> Result<EntrySummary> {
        let entry = self.index.entry(id)?;
        Ok(EntrySummary {
            addr: entry.addr,
            len: entry.len,
            ring: entry.ring,
            dirty: entry.dirty,
            pinned: entry.pinned,
            protected: entry.is_protected(),
            is_placeholder: entry.slot.is_placeholder(),
            tag: entry.tag,
            flush_dep_parent_count: entry.flush_dep_parents.len(),
            flush_dep_child_count: entry.flush_dep_nchildren,
        })
    }

    /// Human-readable dump of the index, LRU order, and dirty set
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "metadata cache: {} entries, {} bytes ({} dirty)",
            self.index.len(),
            self.index.total_bytes(),
            self.index.dirty_bytes()
        );
        let _ = writeln!(out, "lru (head to tail):");
        for id in self.index.lru_head_to_tail() {
            if let Ok(entry) = self.index.entry(id) {
                let _ = writeln!(
                    out,
                    "  {} len={} ring={:?} dirty={} placeholder={}",
                    entry.addr,
                    entry.len,
                    entry.ring,
                    entry.dirty,
                    entry.slot.is_placeholder()
                );
            }
        }
        let _ = writeln!(out, "dirty entries (address order):");
        let mut dirty: Vec<_> = self
            .index
            .arena
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(_, e)| (e.addr, e.len))
            .collect();
        dirty.sort_unstable();
        for (addr, len) in dirty {
            let _ = writeln!(out, "  {addr} len={len}");
        }
        out
    }

    /// Run the full internal consistency check
    pub fn validate(&self) -> Result<()> {
        self.index.validate()
    }

    // ------------------------------------------------------------------
    // Op log control
    // ------------------------------------------------------------------

    /// Open the op log file
    pub fn log_enable(&mut self, path: impl AsRef<std::path::Path>, start_now: bool) -> Result<()> {
        self.log.enable(path, start_now)
    }

    /// Close the op log file
    pub fn log_disable(&mut self) -> Result<()> {
        self.log.disable()
    }

    /// Start writing op log lines
    pub fn log_start(&mut self) {
        self.log.start();
    }

    /// Stop writing op log lines
    pub fn log_stop(&mut self) {
        self.log.stop();
    }

    /// Whether the op log file is open
    #[must_use]
    pub const fn log_is_enabled(&self) -> bool {
        self.log.is_enabled()
    }

    /// Whether op log lines are currently written
    #[must_use]
    pub const fn log_is_logging(&self) -> bool {
        self.log.is_logging()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client::BlobClient;
    use crate::store::MemoryStore;

    fn cache_with(store: MemoryStore, max_size: u64) -> MetadataCache {
        let config = CacheConfig {
            max_size,
            ..CacheConfig::default()
        };
        MetadataCache::new(store, config).unwrap()
    }

    fn blob_client() -> Rc<dyn EntryClient> {
        Rc::new(BlobClient::new(1))
    }

    fn insert_blob(cache: &mut MetadataCache, addr: u64, len: u64) {
        let client = blob_client();
        cache
            .insert(
                &client,
                Addr::new(addr),
                len,
                Box::new(vec![0xABu8; len as usize]),
                InsertOpts::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_insert_protect_unprotect() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 64);

        let client = blob_client();
        let guard = cache
            .protect(&client, Addr::new(0x100), &64u64, ProtectOpts::default())
            .unwrap();
        {
            let object = cache.object_mut(&guard).unwrap();
            let bytes = object.downcast_mut::<Vec<u8>>().unwrap();
            bytes[0] = 0xFF;
        }
        cache.unprotect(guard, true).unwrap();

        let status = cache.entry_status(Addr::new(0x100)).unwrap();
        assert!(status.dirty);
        cache.validate().unwrap();
    }

    #[test]
    fn test_protect_miss_loads_from_store() {
        let mut store = MemoryStore::new();
        store.write(Addr::new(0x200), b"on-disk metadata").unwrap();
        let mut cache = cache_with(store, 1024);

        let client = blob_client();
        let guard = cache
            .protect(&client, Addr::new(0x200), &16u64, ProtectOpts::default())
            .unwrap();
        let object = cache.object(&guard).unwrap();
        assert_eq!(
            object.downcast_ref::<Vec<u8>>().unwrap().as_slice(),
            b"on-disk metadata"
        );
        cache.unprotect(guard, false).unwrap();

        assert_eq!(cache.stats().misses, 1);
        // Second protect is a hit.
        let guard = cache
            .protect(&client, Addr::new(0x200), &16u64, ProtectOpts::default())
            .unwrap();
        cache.unprotect(guard, false).unwrap();
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_double_exclusive_protect_rejected() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);

        let client = blob_client();
        let guard = cache
            .protect(&client, Addr::new(0x100), &16u64, ProtectOpts::default())
            .unwrap();
        assert!(matches!(
            cache.protect(&client, Addr::new(0x100), &16u64, ProtectOpts::default()),
            Err(Error::EntryProtected(_))
        ));
        cache.unprotect(guard, false).unwrap();
    }

    #[test]
    fn test_shared_read_only_protects() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        cache.flush().unwrap();

        let client = blob_client();
        let read_opts = ProtectOpts {
            read_only: true,
            ..ProtectOpts::default()
        };
        let g1 = cache
            .protect(&client, Addr::new(0x100), &16u64, read_opts)
            .unwrap();
        let g2 = cache
            .protect(&client, Addr::new(0x100), &16u64, read_opts)
            .unwrap();
        // Mutable access through a read-only guard is rejected.
        assert!(cache.object_mut(&g1).is_err());
        cache.unprotect(g1, false).unwrap();
        // Still protected by g2.
        assert!(cache.entry_status(Addr::new(0x100)).unwrap().protected);
        cache.unprotect(g2, false).unwrap();
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().protected);
        cache.validate().unwrap();
    }

    #[test]
    fn test_with_entry_mut_releases_on_error() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);

        let client = blob_client();
        let result: Result<()> =
            cache.with_entry_mut(&client, Addr::new(0x100), &16u64, |_object| {
                Err(Error::client("mutation failed"))
            });
        assert!(result.is_err());
        // Entry was unprotected on the error path.
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().protected);
        cache.validate().unwrap();
    }

    #[test]
    fn test_flush_clean_cache_writes_nothing() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        cache.flush().unwrap();
        let writes_after_first = probe.write_count();
        assert_eq!(writes_after_first, 1);

        // Idempotence: an all-clean cache issues zero writes.
        cache.flush().unwrap();
        assert_eq!(probe.write_count(), writes_after_first);
    }

    #[test]
    fn test_flush_respects_dependency_order() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 4096);
        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);
        cache
            .create_flush_dependency(Addr::new(0x100), Addr::new(0x200))
            .unwrap();

        cache.flush().unwrap();
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().dirty);
        assert!(!cache.entry_status(Addr::new(0x200)).unwrap().dirty);
        assert_eq!(
            cache
                .entry_status(Addr::new(0x100))
                .unwrap()
                .flush_dep_child_count,
            1
        );
        cache.validate().unwrap();
    }

    #[test]
    fn test_eviction_prefers_clean_and_skips_pinned() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 64);
        insert_blob(&mut cache, 0x100, 32);
        insert_blob(&mut cache, 0x200, 32);
        cache.flush().unwrap();
        let _pin = cache.pin(Addr::new(0x100)).unwrap();

        // Needs 32 bytes; only 0x200 is evictable.
        insert_blob(&mut cache, 0x300, 32);
        assert!(cache.entry_status(Addr::new(0x200)).is_none());
        assert!(cache.entry_status(Addr::new(0x100)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        cache.validate().unwrap();
    }

    #[test]
    fn test_space_unavailable_when_everything_pinned() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 64);
        insert_blob(&mut cache, 0x100, 64);
        cache.flush().unwrap();
        let _pin = cache.pin(Addr::new(0x100)).unwrap();

        let client = blob_client();
        let result = cache.insert(
            &client,
            Addr::new(0x200),
            32,
            Box::new(vec![0u8; 32]),
            InsertOpts::default(),
        );
        assert!(matches!(result, Err(Error::SpaceUnavailable { .. })));
    }

    #[test]
    fn test_protected_entry_survives_eviction_pressure() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 64);
        insert_blob(&mut cache, 0x100, 32);
        cache.flush().unwrap();

        let client = blob_client();
        let guard = cache
            .protect(&client, Addr::new(0x100), &32u64, ProtectOpts::default())
            .unwrap();

        // Pressure that would otherwise evict 0x100.
        insert_blob(&mut cache, 0x200, 32);
        assert!(cache.entry_status(Addr::new(0x100)).is_some());
        cache.unprotect(guard, false).unwrap();
        cache.validate().unwrap();
    }

    #[test]
    fn test_dirty_eviction_flushes_first() {
        let store = MemoryStore::new();
        let mut probe = store.clone();
        let mut cache = cache_with(store, 32);
        insert_blob(&mut cache, 0x100, 32);

        // 0x100 is dirty; inserting 0x200 must flush-then-evict it.
        insert_blob(&mut cache, 0x200, 32);
        assert!(cache.entry_status(Addr::new(0x100)).is_none());
        assert_eq!(probe.write_count(), 1);
        assert_eq!(probe.read(Addr::new(0x100), 32).unwrap().as_ref(), &[0xAB; 32]);
    }

    #[test]
    fn test_expunge_discards_dirty_entry() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        cache.expunge(Addr::new(0x100)).unwrap();

        assert!(cache.entry_status(Addr::new(0x100)).is_none());
        assert_eq!(probe.write_count(), 0);
        assert_eq!(cache.stats().expunges, 1);
    }

    #[test]
    fn test_move_entry_rekeys_and_dirties() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        cache.flush().unwrap();

        cache.move_entry(Addr::new(0x100), Addr::new(0x500)).unwrap();
        assert!(cache.entry_status(Addr::new(0x100)).is_none());
        let status = cache.entry_status(Addr::new(0x500)).unwrap();
        assert!(status.dirty);
        assert_eq!(cache.stats().moves, 1);
        cache.validate().unwrap();
    }

    #[test]
    fn test_resize_requires_protection_or_pin() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        assert!(cache.resize(Addr::new(0x100), 32).is_err());

        let pin = cache.pin(Addr::new(0x100)).unwrap();
        cache.resize(Addr::new(0x100), 32).unwrap();
        assert_eq!(cache.entry_status(Addr::new(0x100)).unwrap().len, 32);
        assert_eq!(cache.total_bytes(), 32);
        cache.unpin(pin).unwrap();
        cache.validate().unwrap();
    }

    #[test]
    fn test_cork_suppresses_flush_and_evict() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        let key = TagKey::new(0x40);
        insert_blob(&mut cache, 0x100, 16);
        cache.tag(Addr::new(0x100), key).unwrap();

        cache.cork(key);
        assert!(cache.is_corked(key));
        cache.flush_tagged(key).unwrap();
        assert_eq!(probe.write_count(), 0);
        assert!(cache.entry_status(Addr::new(0x100)).unwrap().dirty);

        // The global flush also skips corked entries.
        cache.flush().unwrap();
        assert!(cache.entry_status(Addr::new(0x100)).unwrap().dirty);

        cache.uncork(key).unwrap();
        cache.flush_tagged(key).unwrap();
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().dirty);
        assert_eq!(probe.write_count(), 1);
    }

    #[test]
    fn test_cork_blocked_dependency_chain_left_dirty_by_flush() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        let key = TagKey::new(0x40);
        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);
        insert_blob(&mut cache, 0x300, 16);
        insert_blob(&mut cache, 0x400, 16);
        cache
            .create_flush_dependency(Addr::new(0x100), Addr::new(0x200))
            .unwrap();
        cache
            .create_flush_dependency(Addr::new(0x200), Addr::new(0x300))
            .unwrap();
        cache.tag(Addr::new(0x300), key).unwrap();
        cache.cork(key);

        // The whole chain above the corked leaf is held back, not stalled
        // on; the unrelated entry still flushes.
        cache.flush().unwrap();
        assert!(cache.entry_status(Addr::new(0x100)).unwrap().dirty);
        assert!(cache.entry_status(Addr::new(0x200)).unwrap().dirty);
        assert!(cache.entry_status(Addr::new(0x300)).unwrap().dirty);
        assert!(!cache.entry_status(Addr::new(0x400)).unwrap().dirty);
        assert_eq!(probe.write_count(), 1);

        cache.uncork(key).unwrap();
        cache.flush().unwrap();
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().dirty);
        assert!(!cache.entry_status(Addr::new(0x300)).unwrap().dirty);
        assert_eq!(probe.write_count(), 4);
        cache.validate().unwrap();
    }

    #[test]
    fn test_evict_tagged_removes_group_and_taginfo() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        let key = TagKey::new(0x40);
        let other = TagKey::new(0x80);

        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);
        insert_blob(&mut cache, 0x300, 16);
        cache.tag(Addr::new(0x100), key).unwrap();
        cache.tag(Addr::new(0x200), key).unwrap();
        cache.tag(Addr::new(0x300), other).unwrap();

        cache.evict_tagged(key).unwrap();
        assert!(cache.entry_status(Addr::new(0x100)).is_none());
        assert!(cache.entry_status(Addr::new(0x200)).is_none());
        // The unrelated tag and its entry are untouched.
        assert!(cache.entry_status(Addr::new(0x300)).is_some());
        assert_eq!(cache.tags.entry_count(key), 0);
        assert_eq!(cache.tags.entry_count(other), 1);
        cache.validate().unwrap();
    }

    #[test]
    fn test_for_each_tagged_with_globals() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        let key = TagKey::new(0x40);
        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);
        cache.tag(Addr::new(0x100), key).unwrap();
        cache.tag(Addr::new(0x200), TagKey::GLOBAL_HEAP).unwrap();

        let mut seen = Vec::new();
        cache
            .for_each_tagged(key, true, |summary| seen.push(summary.addr))
            .unwrap();
        assert_eq!(seen.len(), 2);

        seen.clear();
        cache
            .for_each_tagged(key, false, |summary| seen.push(summary.addr))
            .unwrap();
        assert_eq!(seen, vec![Addr::new(0x100)]);
    }

    #[test]
    fn test_close_flushes_everything() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);
        cache
            .create_flush_dependency(Addr::new(0x100), Addr::new(0x200))
            .unwrap();

        let image = cache.close().unwrap();
        assert!(image.is_none());
        assert_eq!(probe.write_count(), 2);
    }

    #[test]
    fn test_close_with_protected_entry_fails() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        let client = blob_client();
        let _guard = cache
            .protect(&client, Addr::new(0x100), &16u64, ProtectOpts::default())
            .unwrap();
        assert!(cache.close().is_err());
    }

    #[test]
    fn test_flush_me_last_deferred() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        let client = blob_client();
        cache
            .insert(
                &client,
                Addr::new(0x100),
                16,
                Box::new(vec![0u8; 16]),
                InsertOpts {
                    flush_me_last: true,
                    ..InsertOpts::default()
                },
            )
            .unwrap();
        insert_blob(&mut cache, 0x200, 16);

        cache.flush().unwrap();
        // Both clean afterwards; the deferred entry flushed in the final
        // pass.
        assert!(!cache.entry_status(Addr::new(0x100)).unwrap().dirty);
        assert!(!cache.entry_status(Addr::new(0x200)).unwrap().dirty);
    }

    #[test]
    fn test_rings_flush_outer_before_inner() {
        // Track write order through addresses: the inner-ring entry has
        // the lower address but must still be written last.
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        let client = blob_client();
        cache
            .insert(
                &client,
                Addr::new(0x100),
                16,
                Box::new(vec![0u8; 16]),
                InsertOpts {
                    ring: Ring::Superblock,
                    ..InsertOpts::default()
                },
            )
            .unwrap();
        cache
            .insert(
                &client,
                Addr::new(0x900),
                16,
                Box::new(vec![1u8; 16]),
                InsertOpts::default(),
            )
            .unwrap();

        // A dependency across rings is rejected.
        assert!(
            cache
                .create_flush_dependency(Addr::new(0x100), Addr::new(0x900))
                .is_err()
        );

        cache.flush().unwrap();
        cache.validate().unwrap();
    }

    #[test]
    fn test_clear_all_dirty_writes_nothing() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        insert_blob(&mut cache, 0x200, 16);

        cache.clear_all_dirty().unwrap();
        assert_eq!(probe.write_count(), 0);
        assert_eq!(cache.dirty_bytes(), 0);
        assert_eq!(cache.stats().clears, 2);
    }

    #[test]
    fn test_random_workload_keeps_index_consistent() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        tracing_subscriber::fmt().with_test_writer().try_init().ok();
        let mut rng = StdRng::seed_from_u64(0x7E55E7A);
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 2048);
        let client = blob_client();
        let mut resident: Vec<(Addr, u64)> = Vec::new();
        let mut next_addr = 0x1000u64;

        for _ in 0..500 {
            match rng.gen_range(0..6) {
                // Insert a fresh entry.
                0 | 1 => {
                    let len = rng.gen_range(8..64);
                    let addr = Addr::new(next_addr);
                    next_addr += 0x100;
                    match cache.insert(
                        &client,
                        addr,
                        len,
                        Box::new(vec![0u8; len as usize]),
                        InsertOpts::default(),
                    ) {
                        Ok(()) => resident.push((addr, len)),
                        Err(Error::SpaceUnavailable { .. }) => {}
                        Err(other) => panic!("insert failed: {other}"),
                    }
                }
                // Touch a random entry through protect/unprotect.
                2 | 3 => {
                    if resident.is_empty() {
                        continue;
                    }
                    let (addr, len) = resident[rng.gen_range(0..resident.len())];
                    if cache.entry_status(addr).is_none() {
                        continue;
                    }
                    let guard = cache
                        .protect(&client, addr, &len, ProtectOpts::default())
                        .unwrap();
                    cache.unprotect(guard, rng.gen_bool(0.5)).unwrap();
                }
                // Expunge.
                4 => {
                    if resident.is_empty() {
                        continue;
                    }
                    let (addr, _) = resident.swap_remove(rng.gen_range(0..resident.len()));
                    if cache.entry_status(addr).is_some() {
                        cache.expunge(addr).unwrap();
                    }
                }
                // Flush everything.
                _ => cache.flush().unwrap(),
            }
            cache.validate().unwrap();
        }
        assert!(cache.total_bytes() <= 2048);
        cache.flush().unwrap();
        assert_eq!(cache.dirty_bytes(), 0);
    }

    #[test]
    fn test_file_store_lifecycle_with_op_log() {
        use crate::store::FileStore;
        use tessera_common::LogConfig;

        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("cache.log");
        let config = CacheConfig {
            log: LogConfig {
                path: Some(log_path.clone()),
                start_on_open: true,
            },
            ..CacheConfig::default()
        };

        let store = FileStore::create(dir.path().join("meta.tsr")).unwrap();
        let mut cache = MetadataCache::new(store, config).unwrap();
        assert!(cache.log_is_logging());

        insert_blob(&mut cache, 0x100, 16);
        let client = blob_client();
        let guard = cache
            .protect(&client, Addr::new(0x100), &16u64, ProtectOpts::default())
            .unwrap();
        cache.unprotect(guard, true).unwrap();
        cache.flush().unwrap();
        cache.close().unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("insert addr=0x100"));
        assert!(log.contains("protect addr=0x100"));
        assert!(log.contains("flush"));

        // The entry reached the file.
        let mut store = FileStore::open(dir.path().join("meta.tsr")).unwrap();
        assert_eq!(store.read(Addr::new(0x100), 16).unwrap().as_ref(), &[0xAB; 16]);
    }

    #[test]
    fn test_dump_mentions_entries() {
        let store = MemoryStore::new();
        let mut cache = cache_with(store, 1024);
        insert_blob(&mut cache, 0x100, 16);
        let dump = cache.dump();
        assert!(dump.contains("0x100"));
        assert!(dump.contains("dirty entries"));
    }
}
