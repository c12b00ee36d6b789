//! Status beacon: once per slot of synced time each node broadcasts what
//! blob version it holds and whether it believes that version is current.

use std::cell::RefCell;
use std::rc::Rc;

use zerocopy::byteorder::{LittleEndian, I32, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use meshsync_core::LocalClock;
use meshsync_protocols::{
    BlobSync, ClockSync, FileStorage, LocalPeriodic, PeriodicRecord, TimeSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct StatusRecord {
    pub blob_version: I32<LittleEndian>,
    pub blob_length: U32<LittleEndian>,
    /// Synced clock duration of the sender, in ms.
    pub clock_duration: U32<LittleEndian>,
    pub up_to_date: u8,
    pub updating: u8,
}

pub type StatusBeacon = LocalPeriodic<PeriodicRecord<StatusRecord>>;

/// Build the beacon. It reads the blob and clock handlers at send time, so
/// it must be polled while neither is borrowed.
pub fn status_beacon(
    blob: Rc<RefCell<BlobSync<FileStorage>>>,
    clock_sync: Rc<RefCell<ClockSync>>,
    clock: Rc<dyn LocalClock>,
    period_ms: u32,
) -> StatusBeacon {
    let mut record = PeriodicRecord::new();

    {
        let blob = blob.clone();
        let clock_sync = clock_sync.clone();
        let clock = clock.clone();
        record.set_fill_hook(move || {
            let now = clock.now_millis();
            let blob = blob.try_borrow().ok()?;
            let clock_sync = clock_sync.try_borrow().ok()?;
            Some(StatusRecord {
                blob_version: I32::new(blob.local_version()),
                blob_length: U32::new(blob.local_length()),
                clock_duration: U32::new(clock_sync.synced_duration(now)),
                up_to_date: blob.up_to_date(now) as u8,
                updating: blob.is_updating() as u8,
            })
        });
    }

    record.set_received_hook(|hdr, status| {
        tracing::debug!(
            src = %hdr.src,
            version = status.blob_version.get(),
            length = status.blob_length.get(),
            up_to_date = status.up_to_date != 0,
            updating = status.updating != 0,
            clock_duration = status.clock_duration.get(),
            "peer status"
        );
    });

    record.set_time_step_hook(move || {
        if let Ok(blob) = blob.try_borrow() {
            tracing::debug!(
                version = blob.local_version(),
                up_to_date = blob.up_to_date(clock.now_millis()),
                state = ?blob.state(),
                "status"
            );
        }
    });

    let time: Rc<dyn TimeSource> = clock_sync;
    LocalPeriodic::new(record, time, period_ms)
}
