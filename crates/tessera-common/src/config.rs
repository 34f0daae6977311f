//! Configuration types for Tessera
//!
//! This module defines configuration structures for the metadata cache.

use crate::types::AddrWidth;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum resident size in bytes
    pub max_size: u64,
    /// Fraction of `max_size` that should stay clean; flushes triggered by
    /// cache pressure aim for this target
    pub min_clean_fraction: f64,
    /// Width of file offsets and lengths in encoded structures
    pub addr_width: AddrWidth,
    /// Cache image configuration
    pub image: ImageConfig,
    /// Operation log configuration
    pub log: LogConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 32 * 1024 * 1024, // 32 MB
            min_clean_fraction: 0.5,
            addr_width: AddrWidth::Eight,
            image: ImageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Validate configuration values
    ///
    /// # Errors
    /// Returns a configuration error for a zero size or a clean fraction
    /// outside `[0, 1]`.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_size == 0 {
            return Err(crate::Error::Configuration("max_size must be nonzero".into()));
        }
        if !(0.0..=1.0).contains(&self.min_clean_fraction) {
            return Err(crate::Error::Configuration(format!(
                "min_clean_fraction {} outside [0, 1]",
                self.min_clean_fraction
            )));
        }
        Ok(())
    }

    /// Clean-size target in bytes
    #[must_use]
    pub fn min_clean_size(&self) -> u64 {
        (self.max_size as f64 * self.min_clean_fraction) as u64
    }
}

/// Cache image (snapshot) configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Generate a cache image at file close
    pub generate: bool,
    /// Exclude entries that have survived this many image round trips;
    /// `None` disables age-out
    pub entry_ageout: Option<u8>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            generate: false,
            entry_ageout: None,
        }
    }
}

/// Operation log configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file path; `None` leaves logging disabled
    pub path: Option<PathBuf>,
    /// Begin logging immediately once the log file is open
    pub start_on_open: bool,
}
