//! Parallel candidate coordinator
//!
//! In a multi-process deployment every rank holds a mirror of the same
//! metadata cache, and the ranks must agree on who writes what before any
//! byte reaches storage. The protocol is candidate-based: rank 0 nominates
//! a candidate list of dirty entries, broadcasts it, and every rank
//! processes the *full* list deterministically — writing the slice the
//! partition table assigns to it and marking the rest clean without
//! writing. Each entry is written by exactly one rank and ends clean on
//! every rank.
//!
//! Collective calls must be symmetric: every rank participates in the same
//! broadcasts and barriers in the same order. An asymmetric call sequence
//! is a protocol violation and fatal.

use crate::cache::MetadataCache;
use crate::client::NotifyAction;
use crate::entry::EntryId;
use bytes::Bytes;
use std::collections::BTreeMap;
use tessera_common::{Addr, Error, Result};
use tracing::debug;

/// Communicator contract for collective candidate exchange
///
/// Implementations wrap whatever transport the deployment uses (MPI, a
/// test harness, ...). All methods must be called symmetrically across
/// ranks.
pub trait Collective {
    /// This process's rank, `0..size`
    fn rank(&self) -> usize;

    /// Number of participating ranks
    fn size(&self) -> usize;

    /// Broadcast `buf` from `root` to every rank
    ///
    /// On the root, `buf` holds the payload to send; on every other rank
    /// it is replaced with the received payload.
    fn broadcast(&mut self, root: usize, buf: &mut Vec<u8>) -> Result<()>;

    /// Block until every rank arrives
    fn barrier(&mut self) -> Result<()>;
}

/// Partition `n_candidates` across `n_ranks` as contiguous slices
///
/// Returns the boundary table: rank `r` owns candidates
/// `table[r]..table[r + 1]`. Slice sizes differ by at most one, with the
/// first `n_candidates % n_ranks` ranks taking the larger share.
#[must_use]
pub fn candidate_partition(n_candidates: usize, n_ranks: usize) -> Vec<usize> {
    assert!(n_ranks > 0, "partition over zero ranks");
    let per_rank = n_candidates / n_ranks;
    let leftover = n_candidates % n_ranks;

    let mut table = Vec::with_capacity(n_ranks + 1);
    let mut boundary = 0;
    table.push(boundary);
    for rank in 0..n_ranks {
        boundary += per_rank + usize::from(rank < leftover);
        table.push(boundary);
    }
    table
}

/// Serialize a candidate list for broadcast (8-byte LE addresses)
#[must_use]
pub fn encode_candidates(candidates: &[Addr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(candidates.len() * 8);
    for addr in candidates {
        buf.extend_from_slice(&addr.offset().to_le_bytes());
    }
    buf
}

/// Decode a broadcast candidate list
pub fn decode_candidates(buf: &[u8]) -> Result<Vec<Addr>> {
    if buf.len() % 8 != 0 {
        return Err(Error::protocol(format!(
            "candidate broadcast of {} bytes is not a whole number of addresses",
            buf.len()
        )));
    }
    Ok(buf
        .chunks_exact(8)
        .map(|chunk| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            Addr::new(u64::from_le_bytes(arr))
        })
        .collect())
}

impl MetadataCache {
    /// Nominate every dirty entry as a flush candidate, in address order
    ///
    /// Protected entries cannot be nominated; `flush_me_last` entries are
    /// held back until `include_flush_me_last` rounds.
    #[must_use]
    pub fn construct_candidates_for_full_clean(
        &self,
        include_flush_me_last: bool,
    ) -> Vec<Addr> {
        let mut candidates: Vec<Addr> = self
            .index
            .arena
            .iter()
            .filter(|(_, e)| {
                e.dirty
                    && !e.is_protected()
                    && (include_flush_me_last || !e.flush_me_last)
                    && !e.tag.is_some_and(|key| self.tags.is_corked(key))
            })
            .map(|(_, e)| e.addr)
            .collect();
        candidates.sort_unstable();
        candidates
    }

    /// Nominate dirty entries from the cold end of the LRU until at least
    /// `target_bytes` of dirty data is covered
    ///
    /// Used to restore the clean-size target without flushing the world.
    #[must_use]
    pub fn construct_candidates_for_min_clean(&self, target_bytes: u64) -> Vec<Addr> {
        let mut candidates = Vec::new();
        let mut covered = 0u64;
        for id in self.index.lru_tail_to_head() {
            if covered >= target_bytes {
                break;
            }
            let Ok(entry) = self.index.entry(id) else {
                continue;
            };
            if !entry.dirty
                || entry.flush_me_last
                || entry.tag.is_some_and(|key| self.tags.is_corked(key))
            {
                continue;
            }
            candidates.push(entry.addr);
            covered += entry.len;
        }
        candidates.sort_unstable();
        candidates
    }

    /// Process a broadcast candidate list as rank `rank` of `size`
    ///
    /// Every rank calls this with the same list. Writes for the slice this
    /// rank owns are issued as one batch; every other candidate is marked
    /// clean without a write. Candidates that are unknown, clean, or
    /// protected break the cross-rank mirror assumption and are fatal
    /// protocol violations.
    pub fn apply_candidate_list(
        &mut self,
        candidates: &[Addr],
        rank: usize,
        size: usize,
    ) -> Result<()> {
        if size == 0 || rank >= size {
            return Err(Error::protocol(format!(
                "rank {rank} outside communicator of size {size}"
            )));
        }
        if candidates.is_empty() {
            return Ok(());
        }

        let mut sorted = candidates.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(Error::protocol("duplicate address in candidate list"));
        }

        // Validate the whole list before touching anything: a bad
        // candidate means the ranks disagree about cache state.
        let mut ids: BTreeMap<Addr, EntryId> = BTreeMap::new();
        for &addr in &sorted {
            let id = self.index.lookup(addr).ok_or_else(|| {
                Error::protocol(format!("candidate {addr} is not resident"))
            })?;
            let entry = self.index.entry(id)?;
            if !entry.dirty {
                return Err(Error::protocol(format!("candidate {addr} is clean")));
            }
            if entry.is_protected() {
                return Err(Error::protocol(format!("candidate {addr} is protected")));
            }
            ids.insert(addr, id);
        }

        let table = candidate_partition(sorted.len(), size);
        let my_slice = table[rank]..table[rank + 1];
        debug!(
            rank,
            size,
            candidates = sorted.len(),
            owned = my_slice.len(),
            "applying candidate list"
        );

        // Passes over the list in address order; an entry waits until its
        // dirty dependency children (also candidates) have gone clean.
        let mut batch: Vec<(Addr, Bytes)> = Vec::new();
        let mut written: Vec<EntryId> = Vec::new();
        loop {
            let mut progress = false;
            let mut remaining = 0usize;
            for (position, &addr) in sorted.iter().enumerate() {
                let id = ids[&addr];
                let entry = self.index.entry(id)?;
                if !entry.dirty {
                    continue;
                }
                if entry.flush_dep_ndirty_children > 0 {
                    remaining += 1;
                    continue;
                }
                if my_slice.contains(&position) {
                    self.serialize_entry(id)?;
                    self.notify_entry(id, NotifyAction::BeforeFlush)?;
                    let image = self
                        .index
                        .entry(id)?
                        .image
                        .clone()
                        .ok_or_else(|| Error::invariant("candidate left unserialized"))?;
                    batch.push((addr, image));
                    written.push(id);
                } else {
                    self.stats.clears += 1;
                }
                self.mark_clean_internal(id)?;
                progress = true;
            }
            if remaining == 0 {
                break;
            }
            if !progress {
                return Err(Error::protocol(format!(
                    "candidate flush stalled with {remaining} entries blocked by \
                     dirty children outside the candidate list"
                )));
            }
        }

        self.store.write_batch(&batch)?;
        self.stats.flushes += batch.len() as u64;
        for id in written {
            self.notify_entry(id, NotifyAction::AfterFlush)?;
        }
        Ok(())
    }

    /// Mark entries another rank has written as clean, without writing
    pub fn mark_entries_clean(&mut self, addrs: &[Addr]) -> Result<()> {
        for &addr in addrs {
            let id = self.index.lookup(addr).ok_or_else(|| {
                Error::protocol(format!("clean notification for non-resident {addr}"))
            })?;
            if self.index.entry(id)?.dirty {
                self.flush_single(id, false)?;
            }
        }
        Ok(())
    }
}

/// Drives whole-cache flushes, hiding whether the deployment is serial or
/// collective
pub trait Coordinator {
    /// Flush every dirty entry the coordinator can reach
    fn flush_all(&mut self, cache: &mut MetadataCache) -> Result<()>;
}

/// Serial deployment: flushes are plain local flushes
pub struct SingleProcess;

impl Coordinator for SingleProcess {
    fn flush_all(&mut self, cache: &mut MetadataCache) -> Result<()> {
        cache.flush()
    }
}

/// Collective deployment over a [`Collective`] communicator
///
/// Rank 0 nominates candidates round by round (deferred entries join in
/// later rounds) and broadcasts each list; an empty list terminates the
/// exchange on every rank.
pub struct MultiProcess<C: Collective> {
    collective: C,
}

impl<C: Collective> MultiProcess<C> {
    /// Wrap a communicator
    pub const fn new(collective: C) -> Self {
        Self { collective }
    }

    /// This process's rank
    #[must_use]
    pub fn rank(&self) -> usize {
        self.collective.rank()
    }
}

impl<C: Collective> Coordinator for MultiProcess<C> {
    fn flush_all(&mut self, cache: &mut MetadataCache) -> Result<()> {
        let rank = self.collective.rank();
        let size = self.collective.size();
        let mut include_flush_me_last = false;
        loop {
            let mut buf = if rank == 0 {
                encode_candidates(
                    &cache.construct_candidates_for_full_clean(include_flush_me_last),
                )
            } else {
                Vec::new()
            };
            self.collective.broadcast(0, &mut buf)?;
            let candidates = decode_candidates(&buf)?;
            if candidates.is_empty() {
                break;
            }
            cache.apply_candidate_list(&candidates, rank, size)?;
            self.collective.barrier()?;
            include_flush_me_last = true;
        }
        self.collective.barrier()?;
        Ok(())
    }
}
