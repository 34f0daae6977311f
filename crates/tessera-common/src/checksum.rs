//! Checksum utilities for Tessera
//!
//! CRC32C is the engine-wide checksum for metadata structures; it is cheap
//! enough to verify inline on every decode.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Streaming CRC32C calculator for multi-part structures
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32cCalculator {
    state: u32,
}

impl Crc32cCalculator {
    /// Create a new calculator
    #[must_use]
    pub const fn new() -> Self {
        Self { state: 0 }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, data);
    }

    /// Finalize and return the checksum
    #[must_use]
    pub const fn finalize(self) -> u32 {
        self.state
    }
}
