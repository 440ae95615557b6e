//! Monotonic millisecond timebase used for ISO-TP pacing and K-Line timeouts.
//!
//! The firmware binary backs this with `rtic_monotonics`' systick monotonic,
//! the same 1kHz timebase `projectgus-fakon` exposes as `hardware::Mono`.

/// A free-running millisecond clock. Never goes backwards; wraps per `u32`
/// semantics after ~49 days, which the reference firmware does not handle
/// either (`unsigned long millis()`).
pub trait Clock {
    fn now_ms(&self) -> u32;
}

#[cfg(test)]
pub(crate) struct FakeClock {
    pub now: core::cell::Cell<u32>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: u32) -> Self {
        Self {
            now: core::cell::Cell::new(start),
        }
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}
