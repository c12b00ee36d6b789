//! meshsyncd — runs the meshsync protocols over a UDP multicast link.
//!
//!   meshsyncd [interface]               run a node
//!   meshsyncd publish <file> <version>  commit a new blob for the node to spread

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;

use meshsync_core::config::MeshSyncConfig;
use meshsync_core::{EthAddr, LocalClock, SystemClock};
use meshsync_protocols::{shared, BlobSync, ClockSync, Dispatcher, FileStorage, SyncEvent};

mod beacon;
mod link;

use link::UdpLink;

/// How often the blob directory is checked for a locally published version.
const RESCAN_INTERVAL: Duration = Duration::from_secs(2);

const DEFAULT_INTERFACE: &str = "veth-a";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeshSyncConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshSyncConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshSyncConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("publish") => publish(&config, &args[1..]),
        interface => run(&config, interface).await,
    }
}

fn publish(config: &MeshSyncConfig, args: &[String]) -> Result<()> {
    let [file, version] = args else {
        anyhow::bail!("usage: meshsyncd publish <file> <version>");
    };
    let version: i32 = version
        .parse()
        .with_context(|| format!("version must be an integer, got {version:?}"))?;

    let dir = &config.storage.blob_dir;
    let current = FileStorage::stored_manifest(dir)?;
    if version <= current.version {
        anyhow::bail!(
            "version {version} is not newer than the stored version {}",
            current.version
        );
    }

    let data = std::fs::read(file).with_context(|| format!("failed to read {file}"))?;
    let manifest = FileStorage::publish(dir, version, &data)?;
    println!(
        "published version {} ({} bytes, blake3 {}) to {}",
        manifest.version,
        manifest.length,
        manifest.checksum,
        dir.display()
    );
    Ok(())
}

async fn run(config: &MeshSyncConfig, interface: Option<&str>) -> Result<()> {
    let interface = match interface {
        Some(i) => i.to_string(),
        None if !config.link.interface.is_empty() => config.link.interface.clone(),
        None => DEFAULT_INTERFACE.to_string(),
    };
    tracing::info!(interface, "meshsyncd starting");

    let addr = if config.node.address.is_empty() {
        None
    } else {
        Some(
            config
                .node
                .address
                .parse::<EthAddr>()
                .context("invalid node.address")?,
        )
    };
    let link = UdpLink::open(&interface, config.link.port, addr)?;

    let clock: Rc<dyn LocalClock> = Rc::new(SystemClock::new());
    let now = clock.now_millis();

    // Blob storage
    let blob_dir = &config.storage.blob_dir;
    let storage = FileStorage::open(blob_dir)
        .with_context(|| format!("failed to open blob storage at {}", blob_dir.display()))?;
    let local = storage.local();
    tracing::info!(
        dir = %blob_dir.display(),
        version = local.version,
        length = local.length,
        "blob storage ready"
    );

    let mut blob = BlobSync::new(storage, local, &config.blob);
    blob.set_event_hook(log_sync_event);
    let blob = shared(blob);
    let clock_sync = shared(ClockSync::new(now, &config.clock));

    // Protocols
    let mut dispatcher = Dispatcher::new(clock.clone());
    dispatcher.add_protocol(config.clock.protocol_id, clock_sync.clone())?;
    dispatcher.add_protocol(config.blob.protocol_id, blob.clone())?;

    let status = if config.beacon.period_ms > 0 {
        let status = shared(beacon::status_beacon(
            blob.clone(),
            clock_sync.clone(),
            clock.clone(),
            config.beacon.period_ms,
        ));
        dispatcher.add_protocol(config.beacon.protocol_id, status.clone())?;
        status.borrow_mut().begin(now);
        Some(status)
    } else {
        tracing::info!("status beacon disabled");
        None
    };
    dispatcher.begin()?;

    let mut tick = tokio::time::interval(Duration::from_millis(config.node.tick_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rescan = tokio::time::interval(RESCAN_INTERVAL);
    rescan.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut buf = vec![0u8; u16::MAX as usize];

    // ── Main loop ────────────────────────────────────────────────────────────

    loop {
        tokio::select! {
            received = link.recv(&mut buf) => match received {
                Ok(Some((header, payload))) => dispatcher.receive(&header, payload),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "link receive failed"),
            },
            _ = tick.tick() => {
                if let Some(status) = &status {
                    status.borrow_mut().run(clock.now_millis());
                }
                if let Some(out) = dispatcher.transmit_turn(config.node.mtu) {
                    if let Err(e) = link.send(&out).await {
                        tracing::warn!(error = %e, "link send failed");
                    }
                }
            }
            _ = rescan.tick() => rescan_blob(&blob, blob_dir),
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    let blob = blob.borrow();
    tracing::info!(
        version = blob.local_version(),
        length = blob.local_length(),
        "meshsyncd stopped"
    );
    Ok(())
}

/// Adopt a version published into `dir` by `meshsyncd publish`.
fn rescan_blob(blob: &RefCell<BlobSync<FileStorage>>, dir: &Path) {
    let stored = match FileStorage::stored_manifest(dir) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read blob manifest");
            return;
        }
    };
    let mut blob = blob.borrow_mut();
    if stored.version <= blob.local_version() {
        return;
    }
    match blob.storage_mut().reload() {
        Ok(local) => blob.set_local_version(local.version, local.length),
        Err(e) => tracing::warn!(error = %e, version = stored.version, "failed to load published blob"),
    }
}

fn log_sync_event(event: &SyncEvent) {
    match event {
        SyncEvent::ReceiveProgress { offset, total } => {
            tracing::debug!(offset, total, "receiving blob")
        }
        SyncEvent::TransmitProgress { offset, total } => {
            tracing::trace!(offset, total, "serving blob")
        }
        SyncEvent::UpdateComplete { version, length } => {
            tracing::info!(version, length, "blob update complete")
        }
        SyncEvent::UpdateStopped(reason) => {
            tracing::warn!(reason = %reason, "blob update stopped")
        }
    }
}
