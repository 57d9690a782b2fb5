//! Time units and clock interfaces.
//!
//! The protocol engines need an absolute microsecond clock that never
//! wraps. [`Timekeeper`] builds one on top of any free-running tick
//! counter by accumulating counter increments into a 64-bit base; the
//! caller must query often enough that the counter cannot wrap twice
//! between samples.

use core::cell::Cell;
use core::ops::{Add, Sub};

/// An absolute point in time, in microseconds since boot. Subtracting
/// two instants yields the span between them.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Microseconds(pub u64);

/// A span of time in milliseconds.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Milliseconds(pub u32);

impl From<Milliseconds> for Microseconds {
    fn from(ms: Milliseconds) -> Self { Microseconds(u64::from(ms.0) * 1_000) }
}

impl Add<Microseconds> for Microseconds {
    type Output = Microseconds;
    fn add(self, rhs: Microseconds) -> Microseconds { Microseconds(self.0 + rhs.0) }
}

impl Add<Milliseconds> for Microseconds {
    type Output = Microseconds;
    fn add(self, rhs: Milliseconds) -> Microseconds { self + Microseconds::from(rhs) }
}

impl Sub for Microseconds {
    type Output = Microseconds;
    fn sub(self, rhs: Microseconds) -> Microseconds { Microseconds(self.0.saturating_sub(rhs.0)) }
}

/// A monotonic microsecond clock.
pub trait Clock {
    /// Microseconds elapsed since boot. Monotonic, never wraps.
    fn now(&self) -> Microseconds;

    /// Busy-waits until the given span has elapsed.
    fn sleep(&self, duration: Milliseconds) {
        let wake_at = self.now() + duration;
        while self.now() < wake_at {}
    }
}

impl<T: Clock> Clock for &T {
    fn now(&self) -> Microseconds { (**self).now() }
    fn sleep(&self, duration: Milliseconds) { (**self).sleep(duration) }
}

/// A free-running hardware counter. The counter is expected to wrap at
/// `2^32`; anything faster-wrapping must be widened by the driver.
pub trait TickSource {
    /// Current counter value.
    fn ticks(&self) -> u32;
    /// Counter increments per second.
    fn frequency_hz(&self) -> u32;
}

impl<T: TickSource> TickSource for &T {
    fn ticks(&self) -> u32 { (**self).ticks() }
    fn frequency_hz(&self) -> u32 { (**self).frequency_hz() }
}

/// Wrap-free absolute clock over a [`TickSource`].
///
/// Each query samples the counter, folds the increment since the last
/// sample into a 64-bit tick total and converts that to microseconds.
pub struct Timekeeper<T: TickSource> {
    source: T,
    last_sample: Cell<u32>,
    total_ticks: Cell<u64>,
}

impl<T: TickSource> Timekeeper<T> {
    pub fn new(source: T) -> Self {
        let last_sample = Cell::new(source.ticks());
        Timekeeper { source, last_sample, total_ticks: Cell::new(0) }
    }
}

impl<T: TickSource> Clock for Timekeeper<T> {
    fn now(&self) -> Microseconds {
        let sample = self.source.ticks();
        let increment = sample.wrapping_sub(self.last_sample.get());
        self.last_sample.set(sample);
        self.total_ticks.set(self.total_ticks.get() + u64::from(increment));
        Microseconds(self.total_ticks.get() * 1_000_000 / u64::from(self.source.frequency_hz()))
    }
}
