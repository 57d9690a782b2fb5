//! Process-wide restart request flag.
//!
//! The flag is the sole cancellation channel: long-running loops in
//! the field node (bit rate detection, allocation, the main loop and
//! the download) check it between iterations and wind down once set.
//! The outer firmware observes it to actually reset the device.

use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct RestartRequest {
    requested: AtomicBool,
}

impl RestartRequest {
    pub const fn new() -> Self { RestartRequest { requested: AtomicBool::new(false) } }

    /// Latches the request. There is no way to clear it short of the
    /// reset it asks for.
    pub fn request(&self) { self.requested.store(true, Ordering::Release); }

    pub fn is_requested(&self) -> bool { self.requested.load(Ordering::Acquire) }
}
