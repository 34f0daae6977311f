//! Cache image serialization
//!
//! A cache image is a single metadata block snapshotting the cache at file
//! close so the next open starts warm. Entries are reconstituted as
//! placeholder entries holding only their raw bytes; the first real access
//! upgrades a placeholder in place.
//!
//! Block layout (all integers little-endian, offsets and lengths at the
//! file's address width):
//!
//! ```text
//! +----------+---------+-------+----------+-------------+
//! | "MDCI"   | version | flags | data_len | entry_count |
//! | 4 bytes  | 1 byte  | 1 byte| width    | 4 bytes     |
//! +----------+---------+-------+----------+-------------+
//! per entry:
//! | type_id  entry_flags  ring  age : 1 byte each          |
//! | fd_child_count  fd_dirty_child_count  fd_parent_count : 2 bytes each |
//! | lru_rank : 4 bytes signed | addr  len : width each |
//! | parent addrs : width each | raw image : len bytes |
//! +------------------------------------------------------+
//! | crc32c over everything above : 4 bytes               |
//! +------------------------------------------------------+
//! ```
//!
//! Entries are ordered by flush-dependency height descending (parents
//! first), ties broken by LRU rank ascending. Reconstruction appends
//! placeholders to the LRU tail in stream order, which replays the saved
//! recency, and every parent reference resolves to an entry decoded
//! earlier in the stream.

use crate::cache::{ImageLocation, MetadataCache};
use crate::deps;
use crate::entry::{CacheEntry, EntryId, ListHome};
use bytes::Bytes;
use std::collections::HashMap;
use tessera_common::checksum::{compute_crc32c, verify_crc32c};
use tessera_common::{Addr, AddrWidth, EntryTypeId, Error, Result, Ring};
use tracing::{debug, info};

const SIGNATURE: &[u8; 4] = b"MDCI";
const VERSION: u8 = 0;

const FLAG_DIRTY: u8 = 0x01;
const FLAG_IN_LRU: u8 = 0x02;
const FLAG_IS_FD_PARENT: u8 = 0x04;
const FLAG_IS_FD_CHILD: u8 = 0x08;
const FLAG_MASK: u8 = FLAG_DIRTY | FLAG_IN_LRU | FLAG_IS_FD_PARENT | FLAG_IS_FD_CHILD;

/// Construction moves strictly forward through these phases; a phase
/// regression is a bug in the caller, not a recoverable condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ImagePhase {
    Idle,
    Serializing,
    Scanning,
    Pruning,
    Sorting,
    Encoding,
    Written,
}

/// Snapshot of one entry taken during the scan phase
struct ImageEntry {
    id: EntryId,
    addr: Addr,
    len: u64,
    type_id: EntryTypeId,
    ring: Ring,
    dirty: bool,
    age: u8,
    /// 1 = most recently used; -1 = not on the LRU list
    lru_rank: i32,
    /// Parent addresses surviving boundary pruning
    parents: Vec<Addr>,
    height: u32,
    image: Bytes,
}

/// One entry decoded from an image block
struct DecodedEntry {
    addr: Addr,
    len: u64,
    type_id: EntryTypeId,
    ring: Ring,
    dirty: bool,
    age: u8,
    parents: Vec<Addr>,
    fd_child_count: u16,
    fd_dirty_child_count: u16,
    image: Bytes,
}

impl MetadataCache {
    /// Snapshot the image-eligible entries and write the image block
    ///
    /// Returns `None` when nothing is eligible. Dirty entries included in
    /// the image are marked clean afterwards without individual writes;
    /// the image block is their persistence until the next open.
    pub fn write_cache_image(&mut self) -> Result<Option<ImageLocation>> {
        let mut phase = ImagePhase::Idle;
        advance(&mut phase, ImagePhase::Serializing);

        let candidates: Vec<EntryId> = self
            .index
            .arena
            .iter()
            .filter(|(_, e)| e.ring <= Ring::MAX_IN_IMAGE)
            .map(|(id, _)| id)
            .collect();
        for &id in &candidates {
            self.serialize_entry(id)?;
        }

        advance(&mut phase, ImagePhase::Scanning);
        let mut entries = self.scan_image_entries(&candidates)?;
        if entries.is_empty() {
            debug!("no image-eligible entries, skipping cache image");
            return Ok(None);
        }

        advance(&mut phase, ImagePhase::Pruning);
        prune_boundary_edges(&mut entries);

        advance(&mut phase, ImagePhase::Sorting);
        assign_heights(&mut entries)?;
        entries.sort_by(|a, b| {
            b.height
                .cmp(&a.height)
                .then(a.lru_rank.cmp(&b.lru_rank))
                .then(a.addr.cmp(&b.addr))
        });

        advance(&mut phase, ImagePhase::Encoding);
        let buf = encode_image(&entries, self.config.addr_width)?;

        let addr = self.store.alloc(buf.len() as u64)?;
        self.store.write(addr, &buf)?;
        advance(&mut phase, ImagePhase::Written);

        // The image now persists these entries; clear their dirty flags
        // locally so the teardown flush does not write them again.
        for entry in &entries {
            if self.index.entry(entry.id)?.dirty {
                self.flush_single(entry.id, false)?;
            }
        }

        self.stats.images_written += 1;
        info!(
            %addr,
            len = buf.len(),
            entries = entries.len(),
            "cache image written"
        );
        Ok(Some(ImageLocation {
            addr,
            len: buf.len() as u64,
        }))
    }

    /// Read and decode an image block, populating the cache with
    /// placeholder entries
    ///
    /// Intended for a freshly opened (empty or near-empty) cache; decoded
    /// placeholders are appended to the LRU tail in stream order so the
    /// saved recency ordering is replayed exactly.
    pub fn load_cache_image(&mut self, location: ImageLocation) -> Result<()> {
        let buf = self.store.read(location.addr, location.len)?;
        let decoded = decode_image(&buf, self.config.addr_width)?;

        let mut by_addr: HashMap<Addr, EntryId> = HashMap::new();
        for record in &decoded {
            let entry = CacheEntry::new_placeholder(
                record.addr,
                record.len,
                record.type_id,
                record.ring,
                record.image.clone(),
                record.dirty,
                record.age,
            );
            let id = self.index.insert_at_lru_tail(entry)?;
            by_addr.insert(record.addr, id);

            for parent_addr in &record.parents {
                let &parent_id = by_addr.get(parent_addr).ok_or_else(|| {
                    Error::image_format(format!(
                        "entry at {} references parent {parent_addr} not decoded before it",
                        record.addr
                    ))
                })?;
                deps::create_dependency(&mut self.index, parent_id, id)
                    .map_err(|_| {
                        Error::image_format(format!(
                            "invalid flush dependency edge {parent_addr} -> {}",
                            record.addr
                        ))
                    })?;
            }
        }

        // The encoded per-entry counters double as a cross-check on the
        // reconstructed graph.
        for record in &decoded {
            let entry = self.index.entry(by_addr[&record.addr])?;
            if entry.flush_dep_nchildren != record.fd_child_count as usize
                || entry.flush_dep_ndirty_children != record.fd_dirty_child_count as usize
            {
                return Err(Error::image_format(format!(
                    "dependency counters for {} disagree with reconstructed graph",
                    record.addr
                )));
            }
        }

        self.stats.images_loaded += 1;
        info!(entries = decoded.len(), "cache image loaded");
        Ok(())
    }

    /// Build the scan-phase snapshot: ranks, ages, and raw parent lists
    fn scan_image_entries(&self, candidates: &[EntryId]) -> Result<Vec<ImageEntry>> {
        let mut ranks: HashMap<EntryId, i32> = HashMap::new();
        for (rank, id) in (1..).zip(self.index.lru_head_to_tail()) {
            ranks.insert(id, rank);
        }

        let mut entries = Vec::new();
        for &id in candidates {
            let entry = self.index.entry(id)?;
            // A placeholder has survived one more image round trip; a live
            // entry enters the image fresh.
            let age = if entry.slot.is_placeholder() {
                entry.age.saturating_add(1)
            } else {
                0
            };
            if let Some(max_age) = self.config.image.entry_ageout {
                if age >= max_age {
                    continue;
                }
            }
            let image = entry
                .image
                .clone()
                .ok_or_else(|| Error::invariant("image-eligible entry left unserialized"))?;
            let parents = entry
                .flush_dep_parents
                .iter()
                .map(|&p| Ok(self.index.entry(p)?.addr))
                .collect::<Result<Vec<Addr>>>()?;
            entries.push(ImageEntry {
                id,
                addr: entry.addr,
                len: entry.len,
                type_id: entry.type_id,
                ring: entry.ring,
                dirty: entry.dirty,
                age,
                lru_rank: if entry.home == ListHome::Lru {
                    ranks.get(&id).copied().unwrap_or(-1)
                } else {
                    -1
                },
                parents,
                height: 0,
                image,
            });
        }
        Ok(entries)
    }
}

fn advance(phase: &mut ImagePhase, next: ImagePhase) {
    debug_assert!(*phase < next, "image phase regression: {phase:?} -> {next:?}");
    *phase = next;
}

/// Drop every dependency edge that crosses the image boundary
///
/// An entry excluded by ring or age must leave no reference behind in
/// either direction, otherwise decode would chase a parent that is not in
/// the block. Repeats until a full pass prunes nothing.
fn prune_boundary_edges(entries: &mut [ImageEntry]) {
    loop {
        let included: std::collections::HashSet<Addr> =
            entries.iter().map(|e| e.addr).collect();
        let mut pruned = false;
        for entry in entries.iter_mut() {
            let before = entry.parents.len();
            entry.parents.retain(|p| included.contains(p));
            pruned |= entry.parents.len() != before;
        }
        if !pruned {
            break;
        }
    }
}

/// Compute flush-dependency heights over the included subset
fn assign_heights(entries: &mut [ImageEntry]) -> Result<()> {
    let positions: HashMap<Addr, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.addr, i))
        .collect();
    let parents: Vec<Vec<usize>> = entries
        .iter()
        .map(|e| e.parents.iter().filter_map(|p| positions.get(p).copied()).collect())
        .collect();
    let heights = deps::compute_heights(&parents)?;
    for (entry, height) in entries.iter_mut().zip(heights) {
        entry.height = height;
    }
    Ok(())
}

fn put_width(buf: &mut Vec<u8>, value: u64, width: AddrWidth) -> Result<()> {
    if value > width.max_value() {
        return Err(Error::image_format(format!(
            "value {value:#x} does not fit the file's address width"
        )));
    }
    match width {
        AddrWidth::Four => buf.extend_from_slice(&(value as u32).to_le_bytes()),
        AddrWidth::Eight => buf.extend_from_slice(&value.to_le_bytes()),
    }
    Ok(())
}

fn encode_image(entries: &[ImageEntry], width: AddrWidth) -> Result<Vec<u8>> {
    let w = width.size();
    let header_len = 4 + 1 + 1 + w + 4;
    let body_len: usize = entries
        .iter()
        .map(|e| 4 + 2 * 3 + 4 + 2 * w + e.parents.len() * w + e.image.len())
        .sum();
    let total = header_len + body_len + 4;

    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(SIGNATURE);
    buf.push(VERSION);
    buf.push(0); // flags
    put_width(&mut buf, total as u64, width)?;
    let count = u32::try_from(entries.len())
        .map_err(|_| Error::image_format("too many entries for one image block"))?;
    buf.extend_from_slice(&count.to_le_bytes());

    // Dirty-child counters are recomputed over the pruned subset rather
    // than copied from the live graph, which may hold boundary edges.
    let mut child_counts: HashMap<Addr, (u16, u16)> = HashMap::new();
    for entry in entries {
        for &parent in &entry.parents {
            let counts = child_counts.entry(parent).or_insert((0, 0));
            counts.0 += 1;
            if entry.dirty {
                counts.1 += 1;
            }
        }
    }

    for entry in entries {
        let (children, dirty_children) =
            child_counts.get(&entry.addr).copied().unwrap_or((0, 0));
        let mut flags = 0u8;
        if entry.dirty {
            flags |= FLAG_DIRTY;
        }
        if entry.lru_rank >= 0 {
            flags |= FLAG_IN_LRU;
        }
        if children > 0 {
            flags |= FLAG_IS_FD_PARENT;
        }
        if !entry.parents.is_empty() {
            flags |= FLAG_IS_FD_CHILD;
        }

        buf.push(entry.type_id.0);
        buf.push(flags);
        buf.push(entry.ring.ordinal());
        buf.push(entry.age);
        buf.extend_from_slice(&children.to_le_bytes());
        buf.extend_from_slice(&dirty_children.to_le_bytes());
        let parent_count = u16::try_from(entry.parents.len())
            .map_err(|_| Error::image_format("entry has too many dependency parents"))?;
        buf.extend_from_slice(&parent_count.to_le_bytes());
        buf.extend_from_slice(&entry.lru_rank.to_le_bytes());
        put_width(&mut buf, entry.addr.offset(), width)?;
        put_width(&mut buf, entry.len, width)?;
        for parent in &entry.parents {
            put_width(&mut buf, parent.offset(), width)?;
        }
        buf.extend_from_slice(&entry.image);
    }

    let checksum = compute_crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// Cursor over the raw image bytes; every read is bounds-checked so a
/// truncated or corrupt block fails cleanly instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::image_format("truncated cache image"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn width(&mut self, width: AddrWidth) -> Result<u64> {
        match width {
            AddrWidth::Four => Ok(u64::from(self.u32()?)),
            AddrWidth::Eight => {
                let b = self.take(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                Ok(u64::from_le_bytes(arr))
            }
        }
    }
}

fn decode_image(buf: &[u8], width: AddrWidth) -> Result<Vec<DecodedEntry>> {
    if buf.len() < 8 {
        return Err(Error::image_format("image block shorter than its header"));
    }
    let (body, checksum_bytes) = buf.split_at(buf.len() - 4);
    let expected = u32::from_le_bytes([
        checksum_bytes[0],
        checksum_bytes[1],
        checksum_bytes[2],
        checksum_bytes[3],
    ]);
    let actual = compute_crc32c(body);
    if !verify_crc32c(body, expected) {
        return Err(Error::ImageChecksum { expected, actual });
    }

    let mut r = Reader { buf: body, pos: 0 };
    if r.take(4)? != SIGNATURE {
        return Err(Error::image_format("bad cache image signature"));
    }
    let version = r.u8()?;
    if version != VERSION {
        return Err(Error::image_format(format!(
            "unsupported cache image version {version}"
        )));
    }
    let header_flags = r.u8()?;
    if header_flags != 0 {
        return Err(Error::image_format(format!(
            "unsupported cache image flags {header_flags:#04x}"
        )));
    }
    let data_len = r.width(width)?;
    if data_len != buf.len() as u64 {
        return Err(Error::image_format(format!(
            "image declares {data_len} bytes but block holds {}",
            buf.len()
        )));
    }
    let count = r.u32()?;
    if count == 0 {
        return Err(Error::image_format("cache image with zero entries"));
    }

    let mut decoded = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let type_id = EntryTypeId(r.u8()?);
        let flags = r.u8()?;
        if flags & !FLAG_MASK != 0 {
            return Err(Error::image_format(format!(
                "unknown entry flags {flags:#04x}"
            )));
        }
        let ring_ord = r.u8()?;
        let ring = Ring::from_ordinal(ring_ord)
            .filter(|&ring| ring <= Ring::MAX_IN_IMAGE)
            .ok_or_else(|| {
                Error::image_format(format!("invalid ring ordinal {ring_ord} in image"))
            })?;
        let age = r.u8()?;
        let fd_child_count = r.u16()?;
        let fd_dirty_child_count = r.u16()?;
        if fd_dirty_child_count > fd_child_count {
            return Err(Error::image_format(
                "dirty child count exceeds child count",
            ));
        }
        let fd_parent_count = r.u16()?;
        let lru_rank = r.i32()?;
        let in_lru = flags & FLAG_IN_LRU != 0;
        if in_lru != (lru_rank >= 0) {
            return Err(Error::image_format(
                "LRU flag disagrees with encoded rank",
            ));
        }
        let addr = Addr::new(r.width(width)?);
        let len = r.width(width)?;
        if len == 0 {
            return Err(Error::image_format(format!("zero-length entry at {addr}")));
        }
        let mut parents = Vec::with_capacity(fd_parent_count as usize);
        for _ in 0..fd_parent_count {
            parents.push(Addr::new(r.width(width)?));
        }
        let image = Bytes::copy_from_slice(r.take(len as usize)?);
        decoded.push(DecodedEntry {
            addr,
            len,
            type_id,
            ring,
            dirty: flags & FLAG_DIRTY != 0,
            age,
            parents,
            fd_child_count,
            fd_dirty_child_count,
            image,
        });
    }
    if r.pos != body.len() {
        return Err(Error::image_format(format!(
            "{} trailing bytes after the last entry",
            body.len() - r.pos
        )));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InsertOpts, ProtectOpts};
    use crate::client::test_client::BlobClient;
    use crate::client::EntryClient;
    use crate::store::{BlockStore, MemoryStore};
    use std::rc::Rc;
    use tessera_common::CacheConfig;
    use tessera_common::ImageConfig;

    fn image_cache(store: MemoryStore) -> MetadataCache {
        let config = CacheConfig {
            image: ImageConfig {
                generate: true,
                entry_ageout: None,
            },
            ..CacheConfig::default()
        };
        MetadataCache::new(store, config).unwrap()
    }

    fn blob_client() -> Rc<dyn EntryClient> {
        Rc::new(BlobClient::new(1))
    }

    fn insert_blob(cache: &mut MetadataCache, addr: u64, byte: u8, len: u64) {
        let client = blob_client();
        cache
            .insert(
                &client,
                Addr::new(addr),
                len,
                Box::new(vec![byte; len as usize]),
                InsertOpts::default(),
            )
            .unwrap();
    }

    #[test]
    fn test_image_roundtrip_restores_entries() {
        let store = MemoryStore::new();
        let reopened_store = store.clone();
        let mut cache = image_cache(store);
        insert_blob(&mut cache, 0x100, 0x11, 32);
        insert_blob(&mut cache, 0x200, 0x22, 16);
        cache
            .create_flush_dependency(Addr::new(0x100), Addr::new(0x200))
            .unwrap();

        let location = cache.close().unwrap().expect("image written");

        let mut reopened = image_cache(reopened_store);
        reopened.load_cache_image(location).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.stats().images_loaded, 1);

        let parent = reopened.entry_status(Addr::new(0x100)).unwrap();
        assert!(parent.is_placeholder);
        assert!(parent.dirty);
        assert_eq!(parent.flush_dep_child_count, 1);
        let child = reopened.entry_status(Addr::new(0x200)).unwrap();
        assert_eq!(child.flush_dep_parent_count, 1);
        reopened.validate().unwrap();

        // First access upgrades the placeholder with the snapshotted bytes.
        let client = blob_client();
        let guard = reopened
            .protect(&client, Addr::new(0x200), &16u64, ProtectOpts::default())
            .unwrap();
        let object = reopened.object(&guard).unwrap();
        assert_eq!(
            object.downcast_ref::<Vec<u8>>().unwrap().as_slice(),
            &[0x22; 16]
        );
        reopened.unprotect(guard, false).unwrap();
        assert_eq!(reopened.stats().placeholder_upgrades, 1);

        // The upgrade happened in place: the dependency edges survived it.
        let child = reopened.entry_status(Addr::new(0x200)).unwrap();
        assert!(!child.is_placeholder);
        assert_eq!(child.flush_dep_parent_count, 1);
        assert_eq!(
            reopened
                .entry_status(Addr::new(0x100))
                .unwrap()
                .flush_dep_child_count,
            1
        );
    }

    #[test]
    fn test_image_preserves_lru_order() {
        let store = MemoryStore::new();
        let reopened_store = store.clone();
        let mut cache = image_cache(store);
        insert_blob(&mut cache, 0x100, 1, 8);
        insert_blob(&mut cache, 0x200, 2, 8);
        insert_blob(&mut cache, 0x300, 3, 8);
        // Recency order head to tail: 0x300, 0x200, 0x100.

        let location = cache.close().unwrap().unwrap();
        let mut reopened = image_cache(reopened_store);
        reopened.load_cache_image(location).unwrap();

        let order: Vec<Addr> = reopened
            .index
            .lru_head_to_tail()
            .into_iter()
            .map(|id| reopened.index.entry(id).unwrap().addr)
            .collect();
        assert_eq!(
            order,
            vec![Addr::new(0x300), Addr::new(0x200), Addr::new(0x100)]
        );
        reopened.validate().unwrap();
    }

    #[test]
    fn test_parents_precede_children_in_stream() {
        let store = MemoryStore::new();
        let mut probe = store.clone();
        let mut cache = image_cache(store);
        // Chain 0x300 -> 0x200 -> 0x100 built against recency order, so
        // height sorting has to rearrange it.
        insert_blob(&mut cache, 0x100, 1, 8);
        insert_blob(&mut cache, 0x200, 2, 8);
        insert_blob(&mut cache, 0x300, 3, 8);
        cache
            .create_flush_dependency(Addr::new(0x300), Addr::new(0x200))
            .unwrap();
        cache
            .create_flush_dependency(Addr::new(0x200), Addr::new(0x100))
            .unwrap();

        let location = cache.close().unwrap().unwrap();

        let block = probe.read(location.addr, location.len).unwrap();
        let decoded = decode_image(&block, AddrWidth::Eight).unwrap();
        let stream_order: Vec<Addr> = decoded.iter().map(|d| d.addr).collect();
        // Height descending: grandparent, parent, leaf.
        assert_eq!(
            stream_order,
            vec![Addr::new(0x300), Addr::new(0x200), Addr::new(0x100)]
        );
        // Every parent reference resolves to an earlier record.
        for (pos, record) in decoded.iter().enumerate() {
            for parent in &record.parents {
                assert!(stream_order[..pos].contains(parent));
            }
        }
    }

    #[test]
    fn test_superblock_rings_excluded() {
        let store = MemoryStore::new();
        let reopened_store = store.clone();
        let mut cache = image_cache(store);
        insert_blob(&mut cache, 0x100, 1, 8);
        let client = blob_client();
        cache
            .insert(
                &client,
                Addr::new(0x200),
                8,
                Box::new(vec![2u8; 8]),
                InsertOpts {
                    ring: Ring::Superblock,
                    ..InsertOpts::default()
                },
            )
            .unwrap();

        let location = cache.close().unwrap().unwrap();
        let mut reopened = image_cache(reopened_store);
        reopened.load_cache_image(location).unwrap();
        assert!(reopened.entry_status(Addr::new(0x100)).is_some());
        // Superblock-class entries never ride the image.
        assert!(reopened.entry_status(Addr::new(0x200)).is_none());
    }

    #[test]
    fn test_ageout_excludes_old_placeholders() {
        let store = MemoryStore::new();
        let second_store = store.clone();
        let third_store = store.clone();
        let config = CacheConfig {
            image: ImageConfig {
                generate: true,
                entry_ageout: Some(1),
            },
            ..CacheConfig::default()
        };

        let mut cache = MetadataCache::new(store, config.clone()).unwrap();
        insert_blob(&mut cache, 0x100, 1, 8);
        let location = cache.close().unwrap().unwrap();

        // Second session: the entry rides in as a placeholder and is never
        // touched, so its age crosses the threshold at the next snapshot.
        let mut second = MetadataCache::new(second_store, config.clone()).unwrap();
        second.load_cache_image(location).unwrap();
        let second_location = second.close().unwrap();
        assert!(second_location.is_none());

        let _ = MetadataCache::new(third_store, config).unwrap();
    }

    #[test]
    fn test_corrupt_image_rejected() {
        let store = MemoryStore::new();
        let reopened_store = store.clone();
        let mut cache = image_cache(store);
        insert_blob(&mut cache, 0x100, 1, 8);
        let location = cache.close().unwrap().unwrap();

        // Flip one byte in the stored block.
        let mut probe = reopened_store.clone();
        let mut block = probe.read(location.addr, location.len).unwrap().to_vec();
        block[10] ^= 0xFF;
        probe.write(location.addr, &block).unwrap();

        let mut reopened = image_cache(reopened_store);
        let err = reopened.load_cache_image(location).unwrap_err();
        assert!(err.is_corruption());
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_signature() {
        let mut buf = b"XXXX\x00\x00".to_vec();
        buf.extend_from_slice(&8u64.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        let checksum = compute_crc32c(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        assert!(matches!(
            decode_image(&buf, AddrWidth::Eight),
            Err(Error::ImageFormat(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_block() {
        assert!(decode_image(b"MDC", AddrWidth::Eight).is_err());
    }

    #[test]
    fn test_image_written_once_per_close() {
        let store = MemoryStore::new();
        let probe = store.clone();
        let mut cache = image_cache(store);
        insert_blob(&mut cache, 0x100, 1, 8);

        let location = cache.close().unwrap().unwrap();
        // One write for the image block; the included entry itself is
        // cleared, not written.
        assert_eq!(probe.write_count(), 1);
        assert!(location.len > 0);
    }

    #[test]
    fn test_four_byte_width_roundtrip() {
        let store = MemoryStore::new();
        let reopened_store = store.clone();
        let config = CacheConfig {
            addr_width: AddrWidth::Four,
            image: ImageConfig {
                generate: true,
                entry_ageout: None,
            },
            ..CacheConfig::default()
        };
        let mut cache = MetadataCache::new(store, config.clone()).unwrap();
        insert_blob(&mut cache, 0x100, 7, 24);
        let location = cache.close().unwrap().unwrap();

        let mut reopened = MetadataCache::new(reopened_store, config).unwrap();
        reopened.load_cache_image(location).unwrap();
        let status = reopened.entry_status(Addr::new(0x100)).unwrap();
        assert_eq!(status.len, 24);
        assert!(status.is_placeholder);
    }
}
