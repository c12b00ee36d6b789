//! Periodic work aligned to the synced clock.
//!
//! [`SyncedPeriodic`] runs a closure once per period of synced time.
//! [`LocalPeriodic`] is a protocol handler that broadcasts once per slot of
//! synced time, at a random point inside the slot, so that nodes sharing a
//! clock spread their broadcasts instead of colliding on slot boundaries.

use std::mem::size_of;
use std::rc::Rc;

use rand::rngs::StdRng;
use zerocopy::{AsBytes, FromBytes};

use meshsync_core::{deadline_reached, PacketHeader};

use crate::clock_sync::TimeSource;
use crate::handler::{ProtocolHandler, Transmit};
use crate::jitter::{deadline_in, entropy_rng};

/// Runs a closure once per `every_ms` of synced time, on multiples of
/// `every_ms` (shifted by `offset`).
#[derive(Debug, Default, Clone)]
pub struct SyncedPeriodic {
    every_ms: u32,
    offset: u32,
    last_run: u32,
    aligned: bool,
}

impl SyncedPeriodic {
    pub fn new(every_ms: u32, offset: u32) -> Self {
        Self {
            every_ms,
            offset,
            last_run: 0,
            aligned: false,
        }
    }

    pub fn begin(&mut self, every_ms: u32, offset: u32) {
        *self = Self::new(every_ms, offset);
    }

    /// Stop running until the next `begin`.
    pub fn end(&mut self) {
        self.every_ms = 0;
        self.aligned = false;
    }

    /// Call `f` if a period boundary has passed. Returns whether it ran.
    ///
    /// The first call runs immediately. Falling more than two periods behind
    /// skips the missed runs; a backward jump realigns without running.
    pub fn run(&mut self, synced: u32, f: impl FnOnce()) -> bool {
        if self.every_ms == 0 {
            return false;
        }
        let synced = synced.wrapping_sub(self.offset);

        if !self.aligned {
            self.align(synced);
            f();
            return true;
        }

        let since = synced.wrapping_sub(self.last_run);
        if (since as i32) < 0 {
            self.align(synced);
            return false;
        }
        if since < self.every_ms {
            return false;
        }
        if since > self.every_ms.saturating_mul(2) {
            self.align(synced);
        } else {
            self.last_run = self.last_run.wrapping_add(self.every_ms);
        }
        f();
        true
    }

    fn align(&mut self, synced: u32) {
        self.last_run = synced - synced % self.every_ms;
        self.aligned = true;
    }
}

/// Application side of a [`LocalPeriodic`] handler.
pub trait PeriodicApp {
    /// A slot boundary passed.
    fn on_time_step(&mut self) {}

    fn on_received(&mut self, header: &PacketHeader, payload: &[u8]);

    /// Write this slot's broadcast into `buf` and return its length, or
    /// `None` to stay quiet this slot.
    fn fill_transmit(&mut self, buf: &mut [u8]) -> Option<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Schedule {
    /// Local time of this slot's broadcast.
    next_broadcast: u32,
    /// Local time of the next slot boundary.
    next_step: u32,
}

/// One broadcast per slot of synced time.
pub struct LocalPeriodic<A> {
    app: A,
    time: Rc<dyn TimeSource>,
    every_ms: u32,
    rng: StdRng,
    schedule: Option<Schedule>,
}

impl<A: PeriodicApp> LocalPeriodic<A> {
    pub fn new(app: A, time: Rc<dyn TimeSource>, every_ms: u32) -> Self {
        Self {
            app,
            time,
            every_ms,
            rng: entropy_rng(),
            schedule: None,
        }
    }

    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Start scheduling. Nothing is sent before this.
    pub fn begin(&mut self, now: u32) {
        if self.every_ms == 0 {
            tracing::warn!("periodic broadcast with a zero period, not starting");
            return;
        }
        self.reschedule(now);
    }

    /// Fire the time-step hook if a slot boundary has passed. Returns
    /// whether it fired.
    pub fn run(&mut self, now: u32) -> bool {
        let Some(schedule) = self.schedule else {
            return false;
        };
        if !deadline_reached(now, schedule.next_step) {
            return false;
        }
        self.app.on_time_step();
        self.reschedule(now);
        true
    }

    pub fn next_time_step(&self) -> Option<u32> {
        self.schedule.map(|s| s.next_step)
    }

    pub fn next_broadcast(&self) -> Option<u32> {
        self.schedule.map(|s| s.next_broadcast)
    }

    fn reschedule(&mut self, now: u32) {
        let every = self.every_ms;
        let synced = self.time.local_to_synced(now);

        // Too late in the current slot to broadcast: use the next one.
        let mut slot = synced.wrapping_add(every / 5 * 4);
        slot -= slot % every;

        let broadcast_at = deadline_in(&mut self.rng, slot, every / 5, every / 5 * 4);
        self.schedule = Some(Schedule {
            next_broadcast: self.time.synced_to_local(broadcast_at),
            next_step: self.time.synced_to_local(slot.wrapping_add(every)),
        });
    }
}

impl<A: PeriodicApp> ProtocolHandler for LocalPeriodic<A> {
    fn on_packet(&mut self, _now: u32, header: &PacketHeader, payload: &[u8]) {
        self.app.on_received(header, payload);
    }

    fn poll_transmit(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        let schedule = self.schedule.as_mut()?;
        if !deadline_reached(now, schedule.next_broadcast) {
            return None;
        }
        // At most once per slot; the next time step picks the real time.
        schedule.next_broadcast = schedule.next_broadcast.wrapping_add(self.every_ms);

        let len = self.app.fill_transmit(buf)?;
        if len > buf.len() {
            panic!("periodic broadcast of {len} bytes exceeds budget of {}", buf.len());
        }
        Some(Transmit::broadcast(len))
    }
}

type StepHook = Box<dyn FnMut()>;
type ReceivedHook<T> = Box<dyn FnMut(&PacketHeader, T)>;
type FillHook<T> = Box<dyn FnMut() -> Option<T>>;

/// [`PeriodicApp`] for a fixed-layout record, driven by closures.
pub struct PeriodicRecord<T> {
    on_step: Option<StepHook>,
    on_received: Option<ReceivedHook<T>>,
    fill: Option<FillHook<T>>,
}

impl<T> Default for PeriodicRecord<T> {
    fn default() -> Self {
        Self {
            on_step: None,
            on_received: None,
            fill: None,
        }
    }
}

impl<T: AsBytes + FromBytes> PeriodicRecord<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time_step_hook(&mut self, f: impl FnMut() + 'static) {
        self.on_step = Some(Box::new(f));
    }

    pub fn set_received_hook(&mut self, f: impl FnMut(&PacketHeader, T) + 'static) {
        self.on_received = Some(Box::new(f));
    }

    /// `f` returns the record to broadcast this slot, if any.
    pub fn set_fill_hook(&mut self, f: impl FnMut() -> Option<T> + 'static) {
        self.fill = Some(Box::new(f));
    }
}

impl<T: AsBytes + FromBytes> PeriodicApp for PeriodicRecord<T> {
    fn on_time_step(&mut self) {
        if let Some(f) = self.on_step.as_mut() {
            f();
        }
    }

    fn on_received(&mut self, header: &PacketHeader, payload: &[u8]) {
        let Some(f) = self.on_received.as_mut() else {
            return;
        };
        match T::read_from(payload) {
            Some(value) => f(header, value),
            None => tracing::trace!(
                src = %header.src,
                len = payload.len(),
                want = size_of::<T>(),
                "periodic record of wrong size"
            ),
        }
    }

    fn fill_transmit(&mut self, buf: &mut [u8]) -> Option<usize> {
        let f = self.fill.as_mut()?;
        let value = f()?;
        let bytes = value.as_bytes();
        if bytes.len() > buf.len() {
            panic!(
                "periodic record of {} bytes does not fit budget of {}",
                bytes.len(),
                buf.len()
            );
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(bytes.len())
    }
}
