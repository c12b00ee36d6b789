//! Millisecond timestamps on a modulo-2^32 circle.
//!
//! Nodes run for longer than 2^32 ms (~49.7 days), so timestamps wrap.
//! "After" is decided by the sign of the wrapped difference, which stays
//! correct across the wrap as long as the two points are less than 2^31 ms
//! apart.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// True if `when` lies strictly after `reference` on the circle.
///
/// Exactly one of `time_is_after(a, b)` and `time_is_after(b, a)` holds for
/// every pair except `a == b` and antipodal pairs (`a - b == 2^31`), for
/// which neither does.
pub fn time_is_after(when: u32, reference: u32) -> bool {
    (when.wrapping_sub(reference) as i32) > 0
}

/// True once `now` has reached or passed `deadline`.
pub fn deadline_reached(now: u32, deadline: u32) -> bool {
    !time_is_after(deadline, now)
}

/// Source of local elapsed milliseconds.
pub trait LocalClock {
    fn now_millis(&self) -> u32;
}

/// Monotonic wall clock: milliseconds since construction, wrapping.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClock for SystemClock {
    fn now_millis(&self) -> u32 {
        // Truncation is the wrap.
        self.epoch.elapsed().as_millis() as u32
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u32>>,
}

impl ManualClock {
    pub fn new(start: u32) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: u32) {
        self.now.set(now);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl LocalClock for ManualClock {
    fn now_millis(&self) -> u32 {
        self.now.get()
    }
}
