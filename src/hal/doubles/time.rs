use std::cell::Cell;

use crate::hal::time::{Clock, Microseconds, Milliseconds, TickSource};

/// Settable clock. `sleep` jumps time forward instead of spinning, and
/// an optional auto-tick advances time on every query so that loops
/// polling for a deadline make progress.
pub struct MockClock {
    now: Cell<u64>,
    auto_tick: Cell<u64>,
}

impl MockClock {
    pub fn new() -> Self { MockClock { now: Cell::new(0), auto_tick: Cell::new(0) } }

    pub fn advance(&self, microseconds: u64) { self.now.set(self.now.get() + microseconds); }

    /// Every `now()` call advances time by this many microseconds.
    pub fn set_auto_tick(&self, microseconds: u64) { self.auto_tick.set(microseconds); }
}

impl Clock for MockClock {
    fn now(&self) -> Microseconds {
        let now = self.now.get();
        self.now.set(now + self.auto_tick.get());
        Microseconds(now)
    }

    fn sleep(&self, duration: Milliseconds) { self.advance(u64::from(duration.0) * 1_000); }
}

/// Hand-cranked tick counter for exercising the timekeeper.
pub struct ManualTicks {
    value: Cell<u32>,
    frequency_hz: u32,
}

impl ManualTicks {
    pub fn new(initial: u32, frequency_hz: u32) -> Self {
        ManualTicks { value: Cell::new(initial), frequency_hz }
    }

    pub fn advance(&self, ticks: u32) { self.value.set(self.value.get().wrapping_add(ticks)); }
}

impl TickSource for ManualTicks {
    fn ticks(&self) -> u32 { self.value.get() }
    fn frequency_hz(&self) -> u32 { self.frequency_hz }
}
