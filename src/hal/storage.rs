//! Interface to the application image storage.
//!
//! The backend abstracts the target-specific NVM routines. An upgrade
//! always follows the bracket `begin_upgrade` → repeated `write` →
//! `end_upgrade`. Read performance is critical: slow access can starve
//! the watchdog and expire the boot timeout, which is why the scanner
//! built on top of this trait always reads in large chunks.

use core::fmt::Debug;

/// Byte-addressed access to the application storage region.
pub trait StorageBackend {
    type Error: Debug + Copy + Clone;

    /// Prepares the storage for a new image, typically by erasing it.
    /// May take seconds on real flash.
    fn begin_upgrade(&mut self) -> Result<(), Self::Error>;

    /// Finalises an upgrade; `success` reports whether the download
    /// completed. Called exactly once per `begin_upgrade`.
    fn end_upgrade(&mut self, success: bool) -> Result<(), Self::Error>;

    /// Writes `bytes` at `offset`, returning the number actually
    /// accepted.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<usize, Self::Error>;

    /// Reads into `bytes` from `offset`, returning the number actually
    /// read. Short reads at the end of the region are not errors.
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Byte-addressed access to the configuration storage region, disjoint
/// from the application region.
pub trait ConfigBackend {
    type Error: Debug + Copy + Clone;

    /// Reads exactly `bytes.len()` bytes from `offset`.
    fn read(&mut self, offset: usize, bytes: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes all of `bytes` at `offset`.
    fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Erases the whole configuration region.
    fn erase(&mut self) -> Result<(), Self::Error>;
}
