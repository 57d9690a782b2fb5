//! Small deterministic PRNG for protocol jitter.
//!
//! Allocation back-off must not synchronise across a fleet of
//! bootstrapping nodes, so the generator is seeded from the device's
//! 16-byte unique identifier rather than a fixed constant.

use crate::utilities::crc::crc64we;

/// xorshift64* generator.
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Seeds the generator from device-unique bytes.
    pub fn seeded_from(unique: &[u8]) -> Self {
        // The seed must be non-zero or the sequence degenerates.
        XorShift64 { state: crc64we(unique) | 1 }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform draw from `[low, high]`.
    pub fn in_range(&mut self, low: u64, high: u64) -> u64 {
        debug_assert!(low <= high);
        low + self.next_u64() % (high - low + 1)
    }
}
