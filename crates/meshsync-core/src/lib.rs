//! meshsync-core — shared types, wire format, timing, and configuration.
//! All other meshsync crates depend on this one.

pub mod config;
pub mod link;
pub mod time;
pub mod wire;

pub use link::{EthAddr, PacketHeader};
pub use time::{deadline_reached, time_is_after, LocalClock, ManualClock, SystemClock};
