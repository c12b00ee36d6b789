//! meshsync-protocols — the protocol engine: dispatcher, blob sync, clock
//! sync, and periodic broadcast helpers, plus an in-process link for tests.

pub mod blob_sync;
pub mod clock_sync;
pub mod custom;
pub mod dispatch;
pub mod handler;
pub mod periodic;
pub mod sim;
pub mod storage;

mod jitter;

pub use blob_sync::{BlobSync, BlobVersion, StopReason, SyncEvent, SyncState};
pub use clock_sync::{ClockSync, TimeSource};
pub use custom::CustomProtocol;
pub use dispatch::{DispatchError, Dispatcher, Outbound};
pub use handler::{shared, ProtocolHandler, SharedHandler, Transmit};
pub use periodic::{LocalPeriodic, PeriodicApp, PeriodicRecord, SyncedPeriodic};
pub use sim::{LinkStats, SimNetwork};
pub use storage::{BlobStorage, FileStorage, MemStorage, RecordStorage, StorageError};
