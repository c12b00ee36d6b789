//! Blob storage backends for [`BlobSync`](crate::BlobSync).
//!
//! The sync engine never touches blob bytes directly. It drives a backend
//! through this contract: one inbound update at a time, written strictly in
//! order, and swapped into place only when the last byte has arrived.

pub mod file;
pub mod mem;
pub mod record;

pub use file::FileStorage;
pub use mem::MemStorage;
pub use record::RecordStorage;

/// Contract between the blob sync engine and whatever holds the blob.
pub trait BlobStorage {
    /// Prepare to receive `total_len` bytes of `version`. `metadata` is the
    /// advertiser's trailing metadata. An error declines the update.
    fn start_update(&mut self, total_len: u32, version: i32, metadata: &[u8])
        -> Result<(), StorageError>;

    /// Append the next chunk of the update in progress.
    fn receive_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError>;

    /// Discard the update in progress. The committed blob is untouched.
    fn on_abort(&mut self);

    /// Every byte has arrived: atomically replace the committed blob. An
    /// error leaves the old blob committed.
    fn on_complete(&mut self) -> Result<(), StorageError>;

    /// Fill `buf` with committed blob bytes starting at `offset`. The caller
    /// never asks past the committed length.
    fn provide_chunk(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write advertise metadata into `buf`, returning its length.
    fn provide_metadata(&self, buf: &mut [u8]) -> Result<usize, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{what} needs {needed} bytes but only {available} fit")]
    Capacity {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("range {offset}+{len} is outside the committed blob of {committed} bytes")]
    OutOfRange { offset: u32, len: usize, committed: u32 },

    #[error("chunk would overrun the announced length of {0} bytes")]
    Overrun(u32),

    #[error("no update in progress")]
    NoUpdate,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("update rejected: {0}")]
    Rejected(String),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),
}
