//! Blob propagation between on-disk stores.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use meshsync_protocols::storage::file::DIGEST_LEN;
use meshsync_protocols::{BlobVersion, FileStorage, MemStorage, SimNetwork, StopReason};

use crate::*;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Scratch directory, removed when dropped.
struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir()
            .join(format!("meshsync-it-{tag}-{}-{}", std::process::id(), id));
        let _ = std::fs::remove_dir_all(&dir);
        Self(dir)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn add_file_node(net: &mut SimNetwork, addr: u64, dir: &TempDir) -> Shared<BlobSync<FileStorage>> {
    let storage = FileStorage::open(&dir.0).expect("open storage");
    let local = storage.local();
    add_blob_node(net, addr, storage, local, &fast_blob_config())
}

#[test]
fn test_published_file_reaches_every_store() {
    let dirs: Vec<_> = (0..3).map(|_| TempDir::new("spread")).collect();
    let data = pattern(5_000, 11);
    FileStorage::publish(&dirs[0].0, 7, &data).unwrap();

    let mut net = SimNetwork::new(0);
    let nodes: Vec<_> = dirs
        .iter()
        .enumerate()
        .map(|(i, dir)| add_file_node(&mut net, i as u64 + 1, dir))
        .collect();
    net.begin().unwrap();

    let done = net.run_until(30_000, STEP_MS, || all_at(&nodes, 7));
    assert!(done, "file blob did not spread");

    let expected = FileStorage::stored_manifest(&dirs[0].0).unwrap();
    for (node, dir) in nodes.iter().zip(&dirs) {
        assert_eq!(node.borrow().storage().contents(), &data[..]);
        assert_eq!(FileStorage::stored_manifest(&dir.0).unwrap(), expected);

        // What was committed survives a restart.
        let reopened = FileStorage::open(&dir.0).unwrap();
        assert_eq!(reopened.local(), BlobVersion::new(7, 5_000));
        assert_eq!(reopened.contents(), &data[..]);
    }
}

/// An advertise whose digest does not match the bytes served is fetched in
/// full, rejected at commit, and never replaces the stored blob.
#[test]
fn test_digest_mismatch_never_commits() {
    let dir = TempDir::new("mismatch");
    FileStorage::publish(&dir.0, 1, b"trusted").unwrap();

    let mut net = SimNetwork::new(0);
    let receiver = add_file_node(&mut net, 1, &dir);
    let events = record_events(&receiver);

    let bogus = MemStorage::with_contents(
        Bytes::from(vec![0u8; DIGEST_LEN]),
        Bytes::from_static(b"tampered contents"),
    );
    let _liar = add_blob_node(&mut net, 2, bogus, BlobVersion::new(2, 17), &fast_blob_config());
    net.begin().unwrap();

    let failed = net.run_until(10_000, STEP_MS, || {
        matches!(
            receiver.borrow().last_stop_reason(),
            Some(StopReason::FinalizeFailed(_))
        )
    });
    assert!(failed, "mismatch was not reported");

    let receiver = receiver.borrow();
    assert_eq!(receiver.local(), BlobVersion::new(1, 7));
    assert_eq!(receiver.storage().contents(), b"trusted");
    assert!(events
        .borrow()
        .iter()
        .any(|e| matches!(e, SyncEvent::UpdateStopped(StopReason::FinalizeFailed(_)))));
    assert_eq!(FileStorage::stored_manifest(&dir.0).unwrap().version, 1);
}

/// A version published into a running node's directory is picked up and
/// spread to its peers.
#[test]
fn test_reloaded_publish_spreads() {
    let a_dir = TempDir::new("reload-a");
    let b_dir = TempDir::new("reload-b");
    FileStorage::publish(&a_dir.0, 1, b"first").unwrap();

    let mut net = SimNetwork::new(0);
    let a = add_file_node(&mut net, 1, &a_dir);
    let b = add_file_node(&mut net, 2, &b_dir);
    net.begin().unwrap();
    assert!(net.run_until(10_000, STEP_MS, || all_at(&[a.clone(), b.clone()], 1)));

    let second = pattern(900, 12);
    FileStorage::publish(&a_dir.0, 2, &second).unwrap();
    {
        let mut a = a.borrow_mut();
        let local = a.storage_mut().reload().unwrap();
        a.set_local_version(local.version, local.length);
    }

    assert!(net.run_until(10_000, STEP_MS, || b.borrow().local_version() == 2));
    assert_eq!(b.borrow().storage().contents(), &second[..]);
}
