//! Cache statistics and diagnostics
//!
//! Aggregate counters for operators and tests. Nothing here is load-bearing
//! for correctness; the cache updates counters inline and exposes them
//! read-only.

use std::fmt;

/// Aggregate cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Protect calls that found the entry resident
    pub hits: u64,
    /// Protect calls that loaded from storage
    pub misses: u64,
    /// Explicit insertions of new entries
    pub insertions: u64,
    /// Entries evicted by the make-space scan or group eviction
    pub evictions: u64,
    /// Entries written to storage
    pub flushes: u64,
    /// Entries marked clean without a write (clear-only and non-owning
    /// ranks of a collective flush)
    pub clears: u64,
    /// Pin operations
    pub pins: u64,
    /// Unpin operations
    pub unpins: u64,
    /// Entries moved to a new address
    pub moves: u64,
    /// Entry resizes
    pub resizes: u64,
    /// Entries expunged without a write
    pub expunges: u64,
    /// Placeholder entries upgraded to live objects
    pub placeholder_upgrades: u64,
    /// Cache images written
    pub images_written: u64,
    /// Cache images loaded
    pub images_loaded: u64,
}

impl CacheStats {
    /// Hit ratio over protect calls, 0.0 to 1.0
    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Reset all counters
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "cache statistics:")?;
        writeln!(
            f,
            "  hits: {} misses: {} (ratio {:.3})",
            self.hits,
            self.misses,
            self.hit_ratio()
        )?;
        writeln!(
            f,
            "  insertions: {} evictions: {} expunges: {}",
            self.insertions, self.evictions, self.expunges
        )?;
        writeln!(
            f,
            "  flushes: {} clears: {} moves: {} resizes: {}",
            self.flushes, self.clears, self.moves, self.resizes
        )?;
        writeln!(f, "  pins: {} unpins: {}", self.pins, self.unpins)?;
        write!(
            f,
            "  placeholder upgrades: {} images written: {} loaded: {}",
            self.placeholder_upgrades, self.images_written, self.images_loaded
        )
    }
}
