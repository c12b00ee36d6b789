//! meshsync integration test harness.
//!
//! Every scenario runs several complete nodes (dispatcher plus protocol
//! handlers) against each other over the in-process simulated link. Time
//! is a shared manual clock, so nothing here sleeps and every run with the
//! same seeds behaves the same.
//!
//!   cargo test --test integration

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;

use meshsync_core::config::{BlobSyncConfig, ClockSyncConfig};
use meshsync_core::EthAddr;
use meshsync_protocols::{
    shared, BlobStorage, BlobSync, BlobVersion, ClockSync, MemStorage, SimNetwork, SyncEvent,
};

mod blob;
mod clock;
mod files;
mod mux;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const BLOB_PROTO: u8 = 2;
pub const CLOCK_PROTO: u8 = 1;

/// Scheduler tick used by every scenario.
pub const STEP_MS: u32 = 5;

pub type Shared<T> = Rc<RefCell<T>>;

/// Blob timings shortened so scenarios finish in a few simulated seconds.
pub fn fast_blob_config() -> BlobSyncConfig {
    BlobSyncConfig {
        protocol_id: BLOB_PROTO,
        advertise_interval_ms: 200,
        retry_interval_ms: 50,
        provide_interval_ms: 0,
        max_retries: 5,
        startup_grace_ms: 1_000,
        ..BlobSyncConfig::default()
    }
}

pub fn fast_clock_config() -> ClockSyncConfig {
    ClockSyncConfig {
        protocol_id: CLOCK_PROTO,
        transmit_interval_ms: 100,
        ..ClockSyncConfig::default()
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Deterministic test payload.
pub fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt)).collect()
}

/// Register a blob sync handler over `storage` on a fresh node.
pub fn add_blob_node<S: BlobStorage + 'static>(
    net: &mut SimNetwork,
    addr: u64,
    storage: S,
    local: BlobVersion,
    config: &BlobSyncConfig,
) -> Shared<BlobSync<S>> {
    let node = net.add_node(EthAddr::from(addr));
    let sync = shared(BlobSync::new(storage, local, config).with_rng(rng(addr)));
    net.dispatcher_mut(node)
        .add_protocol(config.protocol_id, sync.clone())
        .expect("fresh dispatcher");
    sync
}

/// A node holding `data` as `version` in memory. An empty `data` with a
/// negative version is a node that holds nothing yet.
pub fn add_mem_node(
    net: &mut SimNetwork,
    addr: u64,
    version: i32,
    data: &[u8],
) -> Shared<BlobSync<MemStorage>> {
    let storage = MemStorage::with_contents(
        Bytes::copy_from_slice(&blake3::hash(data).as_bytes()[..8]),
        Bytes::copy_from_slice(data),
    );
    let local = BlobVersion::new(version, data.len() as u32);
    add_blob_node(net, addr, storage, local, &fast_blob_config())
}

pub fn add_clock_node(net: &mut SimNetwork, addr: u64) -> Shared<ClockSync> {
    let node = net.add_node(EthAddr::from(addr));
    let clock = shared(ClockSync::new(net.now(), &fast_clock_config()).with_rng(rng(addr)));
    net.dispatcher_mut(node)
        .add_protocol(CLOCK_PROTO, clock.clone())
        .expect("fresh dispatcher");
    clock
}

/// Collect every event a blob sync handler emits.
pub fn record_events<S: BlobStorage>(sync: &Shared<BlobSync<S>>) -> Shared<Vec<SyncEvent>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    sync.borrow_mut()
        .set_event_hook(move |e| sink.borrow_mut().push(e.clone()));
    events
}

pub fn all_at<S: BlobStorage>(nodes: &[Shared<BlobSync<S>>], version: i32) -> bool {
    nodes.iter().all(|n| {
        let n = n.borrow();
        n.local_version() == version && !n.is_updating()
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The harness itself: nodes are addressable and the clock is shared.
#[test]
fn test_harness_builds_nodes() {
    let mut net = SimNetwork::new(1_000);
    let a = add_mem_node(&mut net, 1, 1, b"abc");
    let _b = add_clock_node(&mut net, 2);
    net.begin().expect("both nodes have protocols");

    assert_eq!(net.len(), 2);
    assert_eq!(net.addr(1), EthAddr::from(2));
    assert_eq!(a.borrow().local(), BlobVersion::new(1, 3));

    net.run_for(100, STEP_MS);
    assert_eq!(net.now(), 1_100);
}
