//! Integrity checksums used across the bootloader.
//!
//! [`Crc64We`] authenticates application images and [`Crc32`] protects
//! the configuration pool. Both are fixed, bit-exact algorithms that
//! are part of the on-flash formats; neither applies byte reflection
//! beyond what its definition requires.

/// Streaming CRC-64/WE.
///
/// Polynomial `0x42F0E1EBA9EA3693`, initial value and output xor all
/// ones, not reflected. Check value: `crc64we(b"123456789") ==
/// 0x62EC59E3F1A4F00A`.
///
/// Image verification runs against the watchdog, so the per-byte inner
/// loop is kept as eight explicit steps; do not fold it back into a
/// loop.
pub struct Crc64We {
    crc: u64,
}

const POLY64: u64 = 0x42F0_E1EB_A9EA_3693;
const MASK64: u64 = 1 << 63;

impl Crc64We {
    pub const fn new() -> Self { Crc64We { crc: u64::MAX } }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut crc = self.crc;
        for &byte in bytes {
            crc ^= u64::from(byte) << 56;
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
            crc = if crc & MASK64 != 0 { (crc << 1) ^ POLY64 } else { crc << 1 };
        }
        self.crc = crc;
    }

    pub const fn finalize(&self) -> u64 { self.crc ^ u64::MAX }
}

/// One-shot CRC-64/WE over a byte slice.
pub fn crc64we(bytes: &[u8]) -> u64 {
    let mut crc = Crc64We::new();
    crc.update(bytes);
    crc.finalize()
}

/// Streaming CRC-32 of the configuration store.
///
/// Reflected polynomial `0xEDB88320`, initial value 0, no final xor.
/// Deliberately not the IEEE variant: the stored layout hash and value
/// checksum are defined over this exact parameterisation.
#[derive(Copy, Clone)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    pub const fn new() -> Self { Crc32 { crc: 0 } }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut crc = self.crc;
        for &byte in bytes {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                crc = (crc >> 1) ^ (0xEDB8_8320 & (crc & 1).wrapping_neg());
            }
        }
        self.crc = crc;
    }

    pub const fn value(&self) -> u32 { self.crc }
}

/// One-shot configuration CRC-32 over a byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.value()
}
