//! Blob propagation between nodes holding their blob in memory.

use std::cell::RefCell;
use std::rc::Rc;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use meshsync_core::EthAddr;
use meshsync_protocols::{
    shared, BlobSync, BlobVersion, RecordStorage, SimNetwork, StopReason, SyncEvent,
};

use crate::*;

/// Node A at version 1 learns of version 2 from B and pulls it chunk by
/// chunk until its copy matches.
#[test]
fn test_newer_version_is_pulled_chunk_by_chunk() {
    // 30-byte frames leave 20 bytes of chunk per PROVIDE: five exchanges.
    // Progress is reported once at the start and after every chunk.
    let mut net = SimNetwork::new(0).with_mtu(30);
    let old = pattern(100, 1);
    let new = pattern(100, 2);
    let a = add_mem_node(&mut net, 1, 1, &old);
    let b = add_mem_node(&mut net, 2, 2, &new);
    let events = record_events(&a);
    net.begin().unwrap();

    let done = net.run_until(10_000, STEP_MS, || a.borrow().local_version() == 2);
    assert!(done, "A never adopted version 2");

    let a = a.borrow();
    assert!(!a.is_updating());
    assert_eq!(a.local(), BlobVersion::new(2, 100));
    assert_eq!(&a.storage().data()[..], &new[..]);
    assert_eq!(a.storage().metadata(), b.borrow().storage().metadata());

    let events = events.borrow();
    let progress: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::ReceiveProgress { offset, .. } => Some(*offset),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 20, 40, 60, 80, 100]);
    assert_eq!(
        events.last(),
        Some(&SyncEvent::UpdateComplete { version: 2, length: 100 })
    );
    assert_eq!(b.borrow().local_version(), 2);
}

/// Two nodes at the same version gossip forever without ever updating.
#[test]
fn test_peers_at_same_version_stay_idle() {
    let mut net = SimNetwork::new(0);
    let data = pattern(64, 9);
    let a = add_mem_node(&mut net, 1, 1, &data);
    let b = add_mem_node(&mut net, 2, 1, &data);
    let a_events = record_events(&a);
    let b_events = record_events(&b);
    net.begin().unwrap();

    let updated = net.run_until(5_000, STEP_MS, || {
        a.borrow().is_updating() || b.borrow().is_updating()
    });
    assert!(!updated);
    assert!(a_events.borrow().is_empty());
    assert!(b_events.borrow().is_empty());

    // Each heard the other at the same version, so both know they are current.
    assert!(a.borrow().up_to_date(net.now()));
    assert!(b.borrow().up_to_date(net.now()));
    assert!(net.stats(0).sent > 5);
}

#[test]
fn test_update_reaches_every_node() {
    let mut net = SimNetwork::new(0);
    let data = pattern(2_000, 3);
    let mut nodes = vec![add_mem_node(&mut net, 1, 3, &data)];
    for addr in 2..=6 {
        nodes.push(add_mem_node(&mut net, addr, -1, &[]));
    }
    net.begin().unwrap();

    let done = net.run_until(30_000, STEP_MS, || all_at(&nodes, 3));
    assert!(done, "not every node reached version 3");
    for node in &nodes {
        assert_eq!(&node.borrow().storage().data()[..], &data[..]);
    }
}

/// Dropped packets only slow things down: retries, aborts and fresh
/// advertises still get every node there.
#[test]
fn test_lossy_link_still_converges() {
    let mut net = SimNetwork::new(0);
    let data = pattern(1_500, 4);
    let mut nodes = vec![add_mem_node(&mut net, 1, 5, &data)];
    for addr in 2..=4 {
        nodes.push(add_mem_node(&mut net, addr, 1, b"stale"));
    }
    net.set_loss(0, 0.3);
    net.set_loss(1, 0.2);
    net.set_loss(2, 0.5);
    net.begin().unwrap();

    let done = net.run_until(120_000, STEP_MS, || all_at(&nodes, 5));
    assert!(done, "lossy network did not converge");
    for node in &nodes[1..] {
        assert_eq!(&node.borrow().storage().data()[..], &data[..]);
    }
    assert!(net.stats(0).dropped > 0);
}

/// A provider that publishes again mid-transfer supersedes the version the
/// receiver was pulling; the receiver restarts on the newest one.
#[test]
fn test_publish_mid_transfer_supersedes_update() {
    let mut net = SimNetwork::new(0).with_mtu(64);
    let a = add_mem_node(&mut net, 1, -1, &[]);
    let b = add_mem_node(&mut net, 2, 2, &pattern(3_000, 5));
    let events = record_events(&a);
    net.begin().unwrap();

    let started = net.run_until(5_000, STEP_MS, || match a.borrow().state() {
        meshsync_protocols::SyncState::Updating { offset, .. } => offset > 0,
        _ => false,
    });
    assert!(started);

    let newest = pattern(500, 6);
    b.borrow_mut()
        .publish(3, bytes::Bytes::from_static(b"v3"), bytes::Bytes::from(newest.clone()))
        .unwrap();

    let done = net.run_until(20_000, STEP_MS, || a.borrow().local_version() == 3);
    assert!(done, "A never reached version 3");
    assert_eq!(&a.borrow().storage().data()[..], &newest[..]);
    assert!(events
        .borrow()
        .contains(&SyncEvent::UpdateStopped(StopReason::Superseded { newer: 3 })));
}

/// A node that hears nothing for its whole update gives up and keeps what
/// it had.
#[test]
fn test_vanished_provider_aborts_update() {
    let mut net = SimNetwork::new(0).with_mtu(40);
    let a = add_mem_node(&mut net, 1, 1, b"kept");
    let _b = add_mem_node(&mut net, 2, 2, &pattern(4_000, 7));
    let events = record_events(&a);
    net.begin().unwrap();

    let started = net.run_until(5_000, STEP_MS, || a.borrow().is_updating());
    assert!(started);

    // B falls silent after at most one more frame.
    net.set_loss(1, 1.0);
    let stopped = net.run_until(10_000, STEP_MS, || !a.borrow().is_updating());
    assert!(stopped);

    let a = a.borrow();
    assert_eq!(a.local(), BlobVersion::new(1, 4));
    assert_eq!(&a.storage().data()[..], b"kept");
    assert_eq!(a.last_stop_reason(), Some(&StopReason::RetriesExceeded));
    assert!(events
        .borrow()
        .contains(&SyncEvent::UpdateStopped(StopReason::RetriesExceeded)));
}

#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct Settings {
    interval_s: u32,
    channel: u16,
    flags: u16,
}

/// Small records ride entirely in the advertise: no request or provide.
#[test]
fn test_record_spreads_through_advertises() {
    let mut net = SimNetwork::new(0);
    let initial = Settings { interval_s: 60, channel: 1, flags: 0 };
    let nodes: Vec<_> = (1..=3)
        .map(|addr| {
            add_blob_node(
                &mut net,
                addr,
                RecordStorage::new(initial),
                BlobVersion::EMPTY,
                &fast_blob_config(),
            )
        })
        .collect();
    net.begin().unwrap();

    let updated = Settings { interval_s: 15, channel: 6, flags: 3 };
    nodes[1].borrow_mut().push(updated);
    let version = nodes[1].borrow().local_version();

    let done = net.run_until(5_000, STEP_MS, || {
        nodes.iter().all(|n| n.borrow().value() == updated)
    });
    assert!(done, "record did not reach every node");
    for node in &nodes {
        assert_eq!(node.borrow().local(), BlobVersion::new(version, 0));
    }
}

/// Handlers of different storage types can share one node's dispatcher
/// under different protocol ids without seeing each other's traffic.
#[test]
fn test_two_blob_protocols_on_one_link() {
    let mut net = SimNetwork::new(0);
    let mut records = fast_blob_config();
    records.protocol_id = 9;

    let mut blobs = Vec::new();
    let mut settings = Vec::new();
    for addr in 1..=2u64 {
        let node = net.add_node(EthAddr::from(addr));
        let data = if addr == 1 { pattern(300, 8) } else { Vec::new() };
        let version = if addr == 1 { 4 } else { -1 };
        let blob = shared(
            BlobSync::new(
                meshsync_protocols::MemStorage::with_contents(
                    bytes::Bytes::new(),
                    bytes::Bytes::from(data.clone()),
                ),
                BlobVersion::new(version, data.len() as u32),
                &fast_blob_config(),
            )
            .with_rng(rng(addr)),
        );
        let record = shared(
            BlobSync::new(
                RecordStorage::new(Settings { interval_s: 0, channel: 0, flags: 0 }),
                BlobVersion::EMPTY,
                &records,
            )
            .with_rng(rng(addr + 100)),
        );
        let dispatcher = net.dispatcher_mut(node);
        dispatcher.add_protocol(BLOB_PROTO, blob.clone()).unwrap();
        dispatcher.add_protocol(9, record.clone()).unwrap();
        blobs.push(blob);
        settings.push(record);
    }
    net.begin().unwrap();

    let pushed = Settings { interval_s: 30, channel: 11, flags: 1 };
    settings[1].borrow_mut().push(pushed);

    let seen: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
    let done = net.run_until(10_000, STEP_MS, || {
        *seen.borrow_mut() |= blobs[1].borrow().is_updating();
        all_at(&blobs, 4) && settings[0].borrow().value() == pushed
    });
    assert!(done);
    assert!(*seen.borrow());
    assert_eq!(blobs[1].borrow().storage().data(), blobs[0].borrow().storage().data());
    assert_eq!(settings[1].borrow().local_version(), settings[0].borrow().local_version());
}
