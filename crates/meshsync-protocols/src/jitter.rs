//! Randomized scheduling. Nodes with identical timers would otherwise
//! collide on every interval.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `now` plus a uniform delay in `[lo, hi)`. An empty range yields `lo`.
pub(crate) fn deadline_in(rng: &mut StdRng, now: u32, lo: u32, hi: u32) -> u32 {
    let delay = if hi > lo { rng.gen_range(lo..hi) } else { lo };
    now.wrapping_add(delay)
}

/// `now` plus a uniform delay in `[base, 2 * base)`.
pub(crate) fn jittered_interval(rng: &mut StdRng, now: u32, base: u32) -> u32 {
    deadline_in(rng, now, base, base.saturating_mul(2))
}

pub(crate) fn entropy_rng() -> StdRng {
    StdRng::from_entropy()
}
