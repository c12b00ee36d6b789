//! Blob sync — gossip propagation of the newest version of a blob.
//!
//! Every node periodically ADVERTISEs `(version, length, metadata)`. A node
//! that hears a strictly newer version switches to updating and pulls the
//! blob with broadcast REQUESTs; any node holding that version answers with
//! a PROVIDE chunk. All traffic is broadcast so that one PROVIDE serves
//! every node waiting on the same offset.
//!
//! Serving policy: the pending-serve watermark only moves up, so the most
//! advanced requester is served first and the others catch up from the same
//! chunks later (last request wins).
//!
//! Nothing here blocks. Timers are deadlines compared against `now` each
//! time the dispatcher calls in.

use rand::rngs::StdRng;
use zerocopy::AsBytes;

use meshsync_core::config::BlobSyncConfig;
use meshsync_core::wire::{
    write_blob_header, BlobOp, BlobPacket, ProvideDescriptor, RequestDescriptor,
    VersionDescriptor,
};
use meshsync_core::{deadline_reached, time_is_after, EthAddr, PacketHeader};

use crate::handler::{ProtocolHandler, Transmit};
use crate::jitter::{deadline_in, entropy_rng, jittered_interval};
use crate::storage::{BlobStorage, StorageError};

/// A blob version and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobVersion {
    pub version: i32,
    pub length: u32,
}

impl BlobVersion {
    /// Nothing held yet. Any real version is newer.
    pub const EMPTY: BlobVersion = BlobVersion {
        version: -1,
        length: 0,
    };

    pub fn new(version: i32, length: u32) -> Self {
        Self { version, length }
    }
}

/// Why an in-flight update ended without adopting the new version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StopReason {
    #[error("retries exceeded")]
    RetriesExceeded,

    #[error("receiving chunk failed: {0}")]
    ChunkRejected(String),

    #[error("different newer version encountered (version {newer})")]
    Superseded { newer: i32 },

    #[error("finalizing update failed: {0}")]
    FinalizeFailed(String),
}

/// Progress notifications for whoever embeds the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ReceiveProgress { offset: u32, total: u32 },
    TransmitProgress { offset: u32, total: u32 },
    UpdateComplete { version: i32, length: u32 },
    UpdateStopped(StopReason),
}

/// Externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Updating { version: i32, offset: u32, length: u32 },
}

/// An inbound update in progress.
#[derive(Debug, Clone, Copy)]
struct InboundUpdate {
    target: BlobVersion,
    /// Advertiser we learned of the update from. Requests still go to
    /// broadcast so that any holder can answer.
    source: EthAddr,
    /// Next byte we need.
    offset: u32,
    next_retry: u32,
    retries: u8,
    /// A competing flow was seen since our last request.
    seen_other: bool,
}

type EventHook = Box<dyn FnMut(&SyncEvent)>;

/// The blob sync protocol handler.
pub struct BlobSync<S: BlobStorage> {
    storage: S,
    pub(crate) config: BlobSyncConfig,
    rng: StdRng,

    local: BlobVersion,
    /// Set on the first call that carries a timestamp.
    start_time: Option<u32>,
    next_advertise: u32,
    advertise_asap: bool,

    update: Option<InboundUpdate>,

    /// Highest offset requested of our local version since the last serve.
    serve: Option<u32>,
    next_provide: u32,

    seen_newer: bool,
    seen_same_or_older: bool,

    last_stop: Option<StopReason>,
    hook: Option<EventHook>,
}

impl<S: BlobStorage> BlobSync<S> {
    /// `local` must describe what `storage` currently holds.
    pub fn new(storage: S, local: BlobVersion, config: &BlobSyncConfig) -> Self {
        Self {
            storage,
            config: config.clone(),
            rng: entropy_rng(),
            local,
            start_time: None,
            next_advertise: 0,
            advertise_asap: true,
            update: None,
            serve: None,
            next_provide: 0,
            seen_newer: false,
            seen_same_or_older: false,
            last_stop: None,
            hook: None,
        }
    }

    /// Replace the entropy-seeded RNG (deterministic tests and simulations).
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn set_event_hook(&mut self, hook: impl FnMut(&SyncEvent) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    pub fn local(&self) -> BlobVersion {
        self.local
    }

    pub fn local_version(&self) -> i32 {
        self.local.version
    }

    pub fn local_length(&self) -> u32 {
        self.local.length
    }

    pub fn is_updating(&self) -> bool {
        self.update.is_some()
    }

    pub fn state(&self) -> SyncState {
        match &self.update {
            None => SyncState::Idle,
            Some(u) => SyncState::Updating {
                version: u.target.version,
                offset: u.offset,
                length: u.target.length,
            },
        }
    }

    /// Advertiser of the update in progress.
    pub fn update_source(&self) -> Option<EthAddr> {
        self.update.as_ref().map(|u| u.source)
    }

    pub fn last_stop_reason(&self) -> Option<&StopReason> {
        self.last_stop.as_ref()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Whether it is safe to assume no newer version exists.
    ///
    /// False while updating or after hearing of a newer version. True once a
    /// peer at or below our version has been heard. Otherwise false until
    /// the startup grace period has passed.
    pub fn up_to_date(&self, now: u32) -> bool {
        if self.update.is_some() || self.seen_newer {
            return false;
        }
        if self.seen_same_or_older {
            return true;
        }
        match self.start_time {
            Some(start) => now.wrapping_sub(start) >= self.config.startup_grace_ms,
            None => false,
        }
    }

    /// Adopt a locally produced version. Storage must already hold it.
    ///
    /// Aborts any inbound update, drops pending serves of the old data, and
    /// advertises on the next transmit turn.
    pub fn set_local_version(&mut self, version: i32, length: u32) {
        if self.update.is_some() {
            self.stop_update(StopReason::Superseded { newer: version });
        }
        self.serve = None;
        self.local = BlobVersion::new(version, length);
        self.advertise_asap = true;
        tracing::info!(version, length, "local blob version updated");
    }

    // ── Receive path ─────────────────────────────────────────────────────────

    fn ensure_started(&mut self, now: u32) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
            self.next_advertise = now;
            self.next_provide = now;
        }
    }

    fn on_advertise(&mut self, now: u32, src: EthAddr, desc: VersionDescriptor, metadata: &[u8]) {
        let version = desc.version();

        if let Some(update) = &self.update {
            if version <= update.target.version {
                return;
            }
            // Never merge two versions: drop what we have and start over.
            self.stop_update(StopReason::Superseded { newer: version });
        }

        if version <= self.local.version {
            self.seen_same_or_older = true;
            if version < self.local.version {
                self.nudge_advertise(now);
            }
            return;
        }

        self.seen_newer = true;

        let target = BlobVersion::new(version, desc.length());
        if let Err(e) = self.storage.start_update(target.length, version, metadata) {
            tracing::debug!(version, error = %e, "storage declined update");
            return;
        }

        tracing::info!(
            version,
            length = target.length,
            local_version = self.local.version,
            src = %src,
            "update starting"
        );
        self.update = Some(InboundUpdate {
            target,
            source: src,
            offset: 0,
            next_retry: now,
            retries: 0,
            seen_other: false,
        });
        // Whatever we were about to serve is no longer the newest data.
        self.serve = None;
        self.emit(SyncEvent::ReceiveProgress {
            offset: 0,
            total: target.length,
        });
        self.check_complete();
    }

    /// A straggler showed up: advertise soon instead of at the regular time.
    fn nudge_advertise(&mut self, now: u32) {
        let window = self.config.startup_grace_ms / 2;
        if time_is_after(self.next_advertise, now.wrapping_add(window)) {
            self.next_advertise = deadline_in(&mut self.rng, now, 0, window);
        }
    }

    fn on_request(&mut self, now: u32, req: RequestDescriptor) {
        if let Some(update) = self.update.as_mut() {
            if req.version() != update.target.version {
                return;
            }
            // Someone at or past our offset is being served; let that flow
            // run and pick up its chunks instead of requesting our own.
            if req.offset() >= update.offset {
                update.next_retry =
                    jittered_interval(&mut self.rng, now, self.config.retry_interval_ms);
                update.seen_other = true;
            }
            return;
        }

        if req.version() != self.local.version {
            return;
        }
        if req.offset() >= self.local.length {
            tracing::debug!(offset = req.offset(), length = self.local.length, "request past end");
            return;
        }

        let offset = match self.serve {
            Some(current) => current.max(req.offset()),
            None => req.offset(),
        };
        self.serve = Some(offset);
    }

    fn on_provide(&mut self, now: u32, desc: ProvideDescriptor, chunk: &[u8]) {
        let Some(update) = self.update.as_mut() else {
            if desc.version() == self.local.version {
                // Another provider is serving this version; back off.
                let r = self.config.retry_interval_ms;
                self.next_provide =
                    deadline_in(&mut self.rng, now, r.saturating_mul(2), r.saturating_mul(4));
                self.serve = None;
            }
            return;
        };

        if desc.version() != update.target.version {
            return;
        }
        if desc.offset() != update.offset {
            tracing::trace!(offset = desc.offset(), want = update.offset, "out-of-order chunk");
            update.next_retry = jittered_interval(&mut self.rng, now, self.config.retry_interval_ms);
            update.seen_other = true;
            return;
        }

        let end = u64::from(update.offset) + chunk.len() as u64;
        if end > u64::from(update.target.length) {
            tracing::debug!(
                offset = update.offset,
                chunk_len = chunk.len(),
                length = update.target.length,
                "chunk overruns announced length, discarding"
            );
            return;
        }

        if let Err(e) = self.storage.receive_chunk(chunk) {
            self.stop_update(StopReason::ChunkRejected(e.to_string()));
            return;
        }

        let Some(update) = self.update.as_mut() else {
            return;
        };
        update.offset += chunk.len() as u32;
        update.retries = 0;
        update.next_retry = if update.seen_other {
            jittered_interval(&mut self.rng, now, self.config.retry_interval_ms)
        } else {
            now
        };
        let (offset, total) = (update.offset, update.target.length);

        tracing::trace!(offset, total, "chunk accepted");
        self.emit(SyncEvent::ReceiveProgress { offset, total });
        self.check_complete();
    }

    fn check_complete(&mut self) {
        let Some(update) = &self.update else {
            return;
        };
        debug_assert!(update.offset <= update.target.length);
        if update.offset < update.target.length {
            return;
        }
        let target = update.target;

        if let Err(e) = self.storage.on_complete() {
            self.stop_update(StopReason::FinalizeFailed(e.to_string()));
            return;
        }

        self.update = None;
        self.local = target;
        self.seen_newer = false;
        self.seen_same_or_older = true;
        self.serve = None;
        self.advertise_asap = true;

        tracing::info!(version = target.version, length = target.length, "update complete");
        self.emit(SyncEvent::UpdateComplete {
            version: target.version,
            length: target.length,
        });
    }

    fn stop_update(&mut self, reason: StopReason) {
        let Some(update) = self.update.take() else {
            return;
        };
        self.storage.on_abort();
        tracing::warn!(
            version = update.target.version,
            offset = update.offset,
            length = update.target.length,
            reason = %reason,
            "update aborted"
        );
        self.emit(SyncEvent::UpdateStopped(reason.clone()));
        self.last_stop = Some(reason);
    }

    fn emit(&mut self, event: SyncEvent) {
        if let Some(hook) = self.hook.as_mut() {
            hook(&event);
        }
    }

    // ── Transmit path ────────────────────────────────────────────────────────

    fn send_request(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        let update = self.update.as_mut()?;
        if !deadline_reached(now, update.next_retry) {
            return None;
        }

        update.retries = update.retries.saturating_add(1);
        if update.retries > self.config.max_retries {
            self.stop_update(StopReason::RetriesExceeded);
            return None;
        }
        update.next_retry = jittered_interval(&mut self.rng, now, self.config.retry_interval_ms);
        update.seen_other = false;

        let req = RequestDescriptor::new(update.target.version, update.offset);
        tracing::debug!(
            version = req.version(),
            offset = req.offset(),
            attempt = update.retries,
            "requesting chunk"
        );
        let n = write_header(buf, BlobOp::Request, &req);
        Some(Transmit::broadcast(n))
    }

    fn send_provide(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        let offset = self.serve?;
        if !deadline_reached(now, self.next_provide) {
            return None;
        }
        self.serve = None;
        if offset >= self.local.length {
            return None;
        }
        self.next_provide = now.wrapping_add(self.config.provide_interval_ms);

        let n = write_header(
            buf,
            BlobOp::Provide,
            &ProvideDescriptor::new(self.local.version, offset),
        );
        let room = buf.len() - n;
        if room == 0 {
            panic!("blob sync packet budget of {} bytes leaves no room for chunk data", buf.len());
        }
        let chunk_len = room.min((self.local.length - offset) as usize);

        if let Err(e) = self.storage.provide_chunk(offset, &mut buf[n..n + chunk_len]) {
            tracing::warn!(offset, error = %e, "unable to gather chunk");
            return None;
        }

        tracing::trace!(offset, chunk_len, total = self.local.length, "providing chunk");
        self.emit(SyncEvent::TransmitProgress {
            offset,
            total: self.local.length,
        });
        Some(Transmit::broadcast(n + chunk_len))
    }

    fn send_advertise(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        if !self.advertise_asap && !deadline_reached(now, self.next_advertise) {
            return None;
        }
        self.advertise_asap = false;
        self.next_advertise =
            jittered_interval(&mut self.rng, now, self.config.advertise_interval_ms);

        let n = write_header(
            buf,
            BlobOp::Advertise,
            &VersionDescriptor::new(self.local.version, self.local.length),
        );
        let metadata_len = match self.storage.provide_metadata(&mut buf[n..]) {
            Ok(len) => len,
            Err(e @ StorageError::Capacity { .. }) => {
                // Truncating would corrupt the metadata undetectably.
                panic!("advertise metadata does not fit the packet budget: {e}");
            }
            Err(e) => {
                tracing::warn!(error = %e, "unable to gather advertise metadata");
                return None;
            }
        };

        tracing::trace!(
            version = self.local.version,
            length = self.local.length,
            metadata_len,
            "advertising"
        );
        Some(Transmit::broadcast(n + metadata_len))
    }
}

/// Header writes only fail when the transport MTU cannot hold a descriptor,
/// which is a deployment error rather than a runtime condition.
fn write_header<T: AsBytes>(buf: &mut [u8], op: BlobOp, desc: &T) -> usize {
    match write_blob_header(buf, op, desc) {
        Ok(n) => n,
        Err(e) => panic!("blob sync packet budget misconfigured: {e}"),
    }
}

impl<S: BlobStorage> ProtocolHandler for BlobSync<S> {
    fn on_packet(&mut self, now: u32, header: &PacketHeader, payload: &[u8]) {
        self.ensure_started(now);
        let packet = match BlobPacket::decode(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::trace!(src = %header.src, error = %e, "malformed blob sync packet");
                return;
            }
        };
        match packet {
            BlobPacket::Advertise { desc, metadata } => {
                self.on_advertise(now, header.src, desc, metadata)
            }
            BlobPacket::Request(req) => self.on_request(now, req),
            BlobPacket::Provide { desc, chunk } => self.on_provide(now, desc, chunk),
        }
    }

    fn poll_transmit(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        self.ensure_started(now);
        if self.update.is_some() {
            return self.send_request(now, buf);
        }
        if let Some(t) = self.send_provide(now, buf) {
            return Some(t);
        }
        self.send_advertise(now, buf)
    }
}
