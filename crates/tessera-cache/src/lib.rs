//! Tessera Metadata Cache - Single-owner metadata object cache
//!
//! This crate implements the metadata cache for Tessera including:
//! - Address-indexed entry store with LRU/pinned replacement lists
//! - Flush-dependency DAG with write-ordering enforcement
//! - Ring-ordered whole-cache flushes
//! - Tag index for per-object group operations and corking
//! - Cache-image snapshots for warm restarts
//! - Parallel candidate coordination for multi-rank deployments

pub mod cache;
pub mod client;
pub mod deps;
pub mod entry;
pub mod image;
pub mod index;
pub mod log;
pub mod parallel;
pub mod stats;
pub mod store;
pub mod tags;

// Re-exports
pub use cache::{EntrySummary, ImageLocation, InsertOpts, MetadataCache, ProtectOpts};
pub use client::{EntryClient, NotifyAction, Object};
pub use entry::{CacheEntry, EntryId, ListHome, PinGuard, ProtectGuard, Protection, Slot};
pub use index::EntryIndex;
pub use log::OpLog;
pub use parallel::{
    Collective, Coordinator, MultiProcess, SingleProcess, candidate_partition,
    decode_candidates, encode_candidates,
};
pub use stats::CacheStats;
pub use store::{BlockStore, FileStore, MemoryStore};
pub use tags::TagIndex;
