//! Error types for Tessera
//!
//! This module defines the common error type used throughout the engine.
//! Nothing in the cache core retries automatically: every failure is
//! returned to the caller, who decides whether to abort the whole file
//! operation.

use crate::types::Addr;
use thiserror::Error;

/// Common result type for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tessera
#[derive(Debug, Error)]
pub enum Error {
    /// Internal consistency check failed (index/list/size-accounting
    /// mismatch). Always fatal for the offending operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    // Storage errors
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("entry not found at {0}")]
    EntryNotFound(Addr),

    #[error("entry at {0} is protected")]
    EntryProtected(Addr),

    #[error("entry at {0} is pinned")]
    EntryPinned(Addr),

    #[error("address {0} already in use")]
    AddrInUse(Addr),

    /// Eviction scan reached a pinned/protected-only remainder without
    /// meeting the space target.
    #[error("insufficient evictable space: required {required} bytes, freed {freed} bytes")]
    SpaceUnavailable { required: u64, freed: u64 },

    // Cache image errors
    #[error("cache image format error: {0}")]
    ImageFormat(String),

    #[error("cache image checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ImageChecksum { expected: u32, actual: u32 },

    // Parallel flush errors
    #[error("collective protocol violation: {0}")]
    Protocol(String),

    // Per-type codec errors
    #[error("client codec failure: {0}")]
    Client(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a cache image format error
    pub fn image_format(msg: impl Into<String>) -> Self {
        Self::ImageFormat(msg.into())
    }

    /// Create a collective protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a client codec failure error
    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }

    /// Check if this error indicates file corruption
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ImageFormat(_) | Self::ImageChecksum { .. })
    }

    /// Check if this error is fatal for the whole cache (rather than for a
    /// single load/flush)
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_)
                | Self::ImageFormat(_)
                | Self::ImageChecksum { .. }
                | Self::Protocol(_)
        )
    }
}
