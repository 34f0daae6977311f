//! Tag index
//!
//! Many metadata entries logically belong to one higher-level object and
//! must be flushed, evicted, or shielded from eviction together. The tag
//! index maps an owner key to the list of entries it owns so group
//! operations never scan the whole cache. Entries in the two global
//! buckets (shared-message and global-heap) are owned by no single object;
//! group sweeps may opt in to them via `include_global_extras`.
//!
//! Corking a tag suppresses flush and eviction for its entries while a
//! multi-step metadata update is in flight; uncorking lifts the
//! suppression atomically.

use crate::entry::EntryId;
use crate::index::EntryIndex;
use std::collections::HashMap;
use tessera_common::{Error, Result, TagKey};

/// Per-tag bookkeeping
struct TagInfo {
    /// Head of the doubly-linked list of owned entries
    head: Option<EntryId>,
    /// Number of owned entries
    count: usize,
    /// Flush/evict suppression flag
    corked: bool,
}

/// Secondary index from owner key to owned entries
#[derive(Default)]
pub struct TagIndex {
    tags: HashMap<TagKey, TagInfo>,
}

impl TagIndex {
    /// Create an empty tag index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct tags with entries or cork state
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether no tags are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of entries owned by `key`
    #[must_use]
    pub fn entry_count(&self, key: TagKey) -> usize {
        self.tags.get(&key).map_or(0, |info| info.count)
    }

    /// Whether `key` is currently corked
    #[must_use]
    pub fn is_corked(&self, key: TagKey) -> bool {
        self.tags.get(&key).is_some_and(|info| info.corked)
    }

    /// Attach an entry to a tag, detaching it from any previous tag first
    pub fn tag(&mut self, index: &mut EntryIndex, id: EntryId, key: TagKey) -> Result<()> {
        if index.entry(id)?.tag.is_some() {
            self.untag(index, id)?;
        }

        let info = self.tags.entry(key).or_insert(TagInfo {
            head: None,
            count: 0,
            corked: false,
        });
        let old_head = info.head;
        info.head = Some(id);
        info.count += 1;

        if let Some(head) = old_head {
            index.entry_mut(head)?.tag_prev = Some(id);
        }
        let entry = index.entry_mut(id)?;
        entry.tag = Some(key);
        entry.tag_prev = None;
        entry.tag_next = old_head;
        Ok(())
    }

    /// Detach an entry from its tag
    ///
    /// The TagInfo is destroyed when its last entry leaves, unless it is
    /// corked (cork state must survive an empty interval mid-update).
    pub fn untag(&mut self, index: &mut EntryIndex, id: EntryId) -> Result<()> {
        let (key, prev, next) = {
            let entry = index.entry(id)?;
            let Some(key) = entry.tag else {
                return Ok(());
            };
            (key, entry.tag_prev, entry.tag_next)
        };

        let info = self
            .tags
            .get_mut(&key)
            .ok_or_else(|| Error::invariant(format!("tagged entry under unknown {key}")))?;

        match prev {
            Some(prev_id) => index.entry_mut(prev_id)?.tag_next = next,
            None => info.head = next,
        }
        if let Some(next_id) = next {
            index.entry_mut(next_id)?.tag_prev = prev;
        }
        info.count -= 1;
        if info.count == 0 && !info.corked {
            self.tags.remove(&key);
        }

        let entry = index.entry_mut(id)?;
        entry.tag = None;
        entry.tag_prev = None;
        entry.tag_next = None;
        Ok(())
    }

    /// Cork a tag, creating the cork state if the tag has no entries yet
    pub fn cork(&mut self, key: TagKey) {
        self.tags
            .entry(key)
            .or_insert(TagInfo {
                head: None,
                count: 0,
                corked: false,
            })
            .corked = true;
    }

    /// Uncork a tag
    pub fn uncork(&mut self, key: TagKey) -> Result<()> {
        let Some(info) = self.tags.get_mut(&key) else {
            return Err(Error::invariant(format!("uncork of uncorked {key}")));
        };
        if !info.corked {
            return Err(Error::invariant(format!("uncork of uncorked {key}")));
        }
        info.corked = false;
        if info.count == 0 {
            self.tags.remove(&key);
        }
        Ok(())
    }

    /// Entries owned by `key`, in list order
    #[must_use]
    pub fn entries(&self, index: &EntryIndex, key: TagKey) -> Vec<EntryId> {
        let mut ids = Vec::new();
        let mut cursor = self.tags.get(&key).and_then(|info| info.head);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = index.entry(id).ok().and_then(|e| e.tag_next);
        }
        ids
    }

    /// Entries owned by `key`, optionally including the two global buckets
    ///
    /// Group operations on an object must also cover shared-message and
    /// global-heap entries the object references but does not own.
    #[must_use]
    pub fn entries_for_group_op(
        &self,
        index: &EntryIndex,
        key: TagKey,
        include_global_extras: bool,
    ) -> Vec<EntryId> {
        let mut ids = self.entries(index, key);
        if include_global_extras && !key.is_global() {
            ids.extend(self.entries(index, TagKey::SHARED_MESSAGE));
            ids.extend(self.entries(index, TagKey::GLOBAL_HEAP));
        }
        ids
    }

    /// Move every entry of `old` under `new`
    pub fn retag(&mut self, index: &mut EntryIndex, old: TagKey, new: TagKey) -> Result<()> {
        for id in self.entries(index, old) {
            self.tag(index, id, new)?;
        }
        Ok(())
    }
}
