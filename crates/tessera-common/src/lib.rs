//! Tessera common types and utilities
//!
//! Shared building blocks for the Tessera storage engine: the common error
//! type, core identifiers (addresses, entry types, tags, rings), checksum
//! helpers, and configuration structures.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, ImageConfig, LogConfig};
pub use error::{Error, Result};
pub use types::{Addr, AddrWidth, EntryTypeId, Ring, TagKey};
