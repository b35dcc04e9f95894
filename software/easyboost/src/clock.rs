//! Millisecond tick sources for sample gating.
//!
//! The control loop only ever asks "what tick is it now"; the tick is a `u32`
//! count of milliseconds that wraps back to zero after ~49.7 days. Elapsed time
//! must always be taken with [`elapsed_ms`] so that a wrap does not produce a
//! huge or negative interval.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// A monotonic millisecond counter
pub trait Clock {
    /// Current tick in milliseconds. Wraps silently at `u32::MAX`.
    fn now_ms(&self) -> u32;
}

impl<F> Clock for F
where
    F: Fn() -> u32,
{
    fn now_ms(&self) -> u32 {
        self()
    }
}

/// Milliseconds from `since` to `now`, tolerant of a single counter wrap
#[inline]
pub fn elapsed_ms(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Host monotonic clock, counting from the moment it was created
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap
        self.start.elapsed().as_millis() as u32
    }
}

/// A tick that only moves when told to.
///
/// Clones share the same counter, so one handle can be given to the
/// controller while the test or simulation keeps another to advance time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    tick: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self {
            tick: Rc::new(Cell::new(start_ms)),
        }
    }

    /// Move time forward, wrapping like a hardware counter
    pub fn advance(&self, ms: u32) {
        self.tick.set(self.tick.get().wrapping_add(ms));
    }

    pub fn set(&self, tick_ms: u32) {
        self.tick.set(tick_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.tick.get()
    }
}
