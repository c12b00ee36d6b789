//! Clock sync — a shared logical clock across the mesh.
//!
//! Synced time is local elapsed time plus an offset. Every node broadcasts
//! `{synced_millis, synced_duration}`; a node adopts a peer's clock only when
//! the peer has held its synchronization longer, so the whole mesh drifts
//! toward the most stable lineage without electing a root.
//!
//! Small corrections are smoothed over a window instead of stepped:
//!
//! - forward jump `J`: for `J` local ms the synced clock runs at double rate
//! - backward jump `-J`: for `2J` local ms it runs at half rate
//!
//! The window includes its last millisecond. Outside it the conversions are
//! exact inverses.

use std::cell::RefCell;

use rand::rngs::StdRng;
use rand::Rng;
use zerocopy::AsBytes;

use meshsync_core::config::ClockSyncConfig;
use meshsync_core::wire::{ClockSyncData, CLOCK_SYNC_LEN};
use meshsync_core::{deadline_reached, time_is_after, PacketHeader};

use crate::handler::{ProtocolHandler, Transmit};
use crate::jitter::{deadline_in, entropy_rng, jittered_interval};

/// Spread of the initial synced duration, so that nodes booted together
/// still have a strict order.
const INITIAL_DURATION_SPREAD_MS: u32 = 1_000;

/// Rebroadcast delay range after adopting a peer's clock.
const REBROADCAST_MIN_MS: u32 = 1;
const REBROADCAST_MAX_MS: u32 = 50;

/// Conversion between local and synced time.
pub trait TimeSource {
    fn local_to_synced(&self, local: u32) -> u32;

    /// Earliest local time whose synced value is at least `synced`.
    fn synced_to_local(&self, synced: u32) -> u32;
}

impl<T: TimeSource> TimeSource for RefCell<T> {
    fn local_to_synced(&self, local: u32) -> u32 {
        self.borrow().local_to_synced(local)
    }

    fn synced_to_local(&self, synced: u32) -> u32 {
        self.borrow().synced_to_local(synced)
    }
}

/// A smoothing window in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Adjustment {
    /// Local time the window opened.
    start: u32,
    /// Offset in effect when the window opened.
    base_offset: u32,
    jump: i32,
}

impl Adjustment {
    fn window(&self) -> u32 {
        if self.jump >= 0 {
            self.jump as u32
        } else {
            self.jump.unsigned_abs().saturating_mul(2)
        }
    }

    /// Synced time gained (or lost) relative to `base_offset`, `e` local ms
    /// into the window.
    fn progress(&self, e: u32) -> u32 {
        if self.jump >= 0 {
            e
        } else {
            // Half rate: synced advances ceil(e/2), so it trails by floor(e/2).
            (e / 2).wrapping_neg()
        }
    }
}

/// The clock sync protocol handler.
pub struct ClockSync {
    config: ClockSyncConfig,
    rng: StdRng,
    created: u32,

    /// synced = local + offset once any adjustment has finished.
    offset: u32,
    adjustment: Option<Adjustment>,

    /// Synced duration at `lineage_mark`.
    lineage_duration: u32,
    lineage_mark: u32,

    next_transmit: u32,
    adoptions: u32,
}

impl ClockSync {
    pub fn new(now: u32, config: &ClockSyncConfig) -> Self {
        let mut sync = Self {
            config: config.clone(),
            rng: entropy_rng(),
            created: now,
            offset: 0,
            adjustment: None,
            lineage_duration: 0,
            lineage_mark: now,
            next_transmit: now,
            adoptions: 0,
        };
        sync.roll_initial_state();
        sync
    }

    /// Replace the RNG and redraw the random initial state from it.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self.roll_initial_state();
        self
    }

    fn roll_initial_state(&mut self) {
        let now = self.created;
        self.offset = self.rng.gen();
        self.adjustment = None;
        self.lineage_duration = self.rng.gen_range(0..INITIAL_DURATION_SPREAD_MS);
        self.lineage_mark = now;
        self.next_transmit = jittered_interval(&mut self.rng, now, self.config.transmit_interval_ms);
    }

    /// How long this node's current synchronization lineage has held.
    pub fn synced_duration(&self, now: u32) -> u32 {
        self.lineage_duration
            .saturating_add(now.wrapping_sub(self.lineage_mark))
    }

    pub fn synced_now(&self, now: u32) -> u32 {
        self.local_to_synced(now)
    }

    pub fn is_adjusting(&self, now: u32) -> bool {
        match &self.adjustment {
            Some(adj) => {
                !time_is_after(adj.start, now) && now.wrapping_sub(adj.start) <= adj.window()
            }
            None => false,
        }
    }

    /// Number of times a peer's clock has been adopted.
    pub fn adoptions(&self) -> u32 {
        self.adoptions
    }

    /// Drop a finished window. Conversions are unaffected.
    fn settle(&mut self, now: u32) {
        if let Some(adj) = &self.adjustment {
            if !time_is_after(adj.start, now) && now.wrapping_sub(adj.start) > adj.window() {
                self.adjustment = None;
            }
        }
    }

    fn adopt(&mut self, now: u32, peer: ClockSyncData) {
        let current = self.local_to_synced(now);
        let jump = peer.synced_millis().wrapping_sub(current) as i32;
        let smoothed = jump != 0 && jump.unsigned_abs() < self.config.smooth_threshold_ms;

        if smoothed {
            let base_offset = current.wrapping_sub(now);
            self.adjustment = Some(Adjustment {
                start: now,
                base_offset,
                jump,
            });
            self.offset = base_offset.wrapping_add(jump as u32);
        } else {
            self.adjustment = None;
            self.offset = peer.synced_millis().wrapping_sub(now);
        }

        self.lineage_duration = peer.synced_duration();
        self.lineage_mark = now;
        self.adoptions += 1;
        self.next_transmit = deadline_in(&mut self.rng, now, REBROADCAST_MIN_MS, REBROADCAST_MAX_MS);

        tracing::info!(
            jump,
            smoothed,
            peer_duration = peer.synced_duration(),
            "adopted peer clock"
        );
    }
}

impl TimeSource for ClockSync {
    fn local_to_synced(&self, local: u32) -> u32 {
        let Some(adj) = &self.adjustment else {
            return local.wrapping_add(self.offset);
        };
        if time_is_after(adj.start, local) {
            return local.wrapping_add(adj.base_offset);
        }
        let e = local.wrapping_sub(adj.start);
        if e >= adj.window() {
            return local.wrapping_add(self.offset);
        }
        local
            .wrapping_add(adj.base_offset)
            .wrapping_add(adj.progress(e))
    }

    fn synced_to_local(&self, synced: u32) -> u32 {
        let Some(adj) = &self.adjustment else {
            return synced.wrapping_sub(self.offset);
        };
        let window_start = adj.start.wrapping_add(adj.base_offset);
        let d = synced.wrapping_sub(window_start) as i32;
        if d <= 0 {
            return synced.wrapping_sub(adj.base_offset);
        }
        let d = d as u32;

        let into_window = if adj.jump >= 0 {
            let j = adj.jump as u32;
            // synced(e) = start + 2e
            (d < j.saturating_mul(2)).then(|| d.div_ceil(2))
        } else {
            let m = adj.jump.unsigned_abs();
            // synced(e) = start + ceil(e/2); earliest e reaching d is 2d - 1
            (d <= m).then(|| 2 * d - 1)
        };

        match into_window {
            Some(e) => adj.start.wrapping_add(e),
            None => synced.wrapping_sub(self.offset),
        }
    }
}

impl ProtocolHandler for ClockSync {
    fn on_packet(&mut self, now: u32, header: &PacketHeader, payload: &[u8]) {
        self.settle(now);
        let peer = match ClockSyncData::decode(payload) {
            Ok(data) => data,
            Err(e) => {
                tracing::trace!(src = %header.src, error = %e, "malformed clock sync packet");
                return;
            }
        };

        let own = self.synced_duration(now);
        if peer.synced_duration() <= own {
            tracing::trace!(
                src = %header.src,
                peer_duration = peer.synced_duration(),
                own_duration = own,
                "peer clock not more stable, ignoring"
            );
            return;
        }
        self.adopt(now, peer);
    }

    fn poll_transmit(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        self.settle(now);
        if !deadline_reached(now, self.next_transmit) {
            return None;
        }
        if buf.len() < CLOCK_SYNC_LEN {
            panic!(
                "clock sync needs {CLOCK_SYNC_LEN} bytes per packet, budget is {}",
                buf.len()
            );
        }
        self.next_transmit = jittered_interval(&mut self.rng, now, self.config.transmit_interval_ms);

        let data = ClockSyncData::new(self.local_to_synced(now), self.synced_duration(now));
        buf[..CLOCK_SYNC_LEN].copy_from_slice(data.as_bytes());
        Some(Transmit::broadcast(CLOCK_SYNC_LEN))
    }
}
