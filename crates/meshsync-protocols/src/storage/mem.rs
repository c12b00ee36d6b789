//! In-memory blob backend.

use bytes::{Bytes, BytesMut};

use super::{BlobStorage, StorageError};
use crate::blob_sync::BlobSync;

/// Holds the committed blob in memory and stages updates in a second buffer.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    metadata: Bytes,
    data: Bytes,
    incoming: Option<Incoming>,
}

#[derive(Debug, Clone)]
struct Incoming {
    total: u32,
    metadata: Bytes,
    data: BytesMut,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(metadata: Bytes, data: Bytes) -> Self {
        Self {
            metadata,
            data,
            incoming: None,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> &Bytes {
        &self.metadata
    }

    /// Cheap copy of the committed `(metadata, data)`.
    pub fn snapshot(&self) -> (Bytes, Bytes) {
        (self.metadata.clone(), self.data.clone())
    }

    /// Replace the committed contents. Any staged update is discarded.
    pub fn set_contents(&mut self, metadata: Bytes, data: Bytes) {
        self.incoming = None;
        self.metadata = metadata;
        self.data = data;
    }
}

impl BlobStorage for MemStorage {
    fn start_update(
        &mut self,
        total_len: u32,
        _version: i32,
        metadata: &[u8],
    ) -> Result<(), StorageError> {
        self.incoming = Some(Incoming {
            total: total_len,
            metadata: Bytes::copy_from_slice(metadata),
            data: BytesMut::with_capacity(total_len as usize),
        });
        Ok(())
    }

    fn receive_chunk(&mut self, chunk: &[u8]) -> Result<(), StorageError> {
        let incoming = self.incoming.as_mut().ok_or(StorageError::NoUpdate)?;
        if incoming.data.len() + chunk.len() > incoming.total as usize {
            return Err(StorageError::Overrun(incoming.total));
        }
        incoming.data.extend_from_slice(chunk);
        Ok(())
    }

    fn on_abort(&mut self) {
        self.incoming = None;
    }

    fn on_complete(&mut self) -> Result<(), StorageError> {
        let incoming = self.incoming.take().ok_or(StorageError::NoUpdate)?;
        if incoming.data.len() != incoming.total as usize {
            return Err(StorageError::Rejected(format!(
                "received {} of {} bytes",
                incoming.data.len(),
                incoming.total
            )));
        }
        self.metadata = incoming.metadata;
        self.data = incoming.data.freeze();
        Ok(())
    }

    fn provide_chunk(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            return Err(StorageError::OutOfRange {
                offset,
                len: buf.len(),
                committed: self.data.len() as u32,
            });
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn provide_metadata(&self, buf: &mut [u8]) -> Result<usize, StorageError> {
        if self.metadata.len() > buf.len() {
            return Err(StorageError::Capacity {
                what: "metadata",
                needed: self.metadata.len(),
                available: buf.len(),
            });
        }
        buf[..self.metadata.len()].copy_from_slice(&self.metadata);
        Ok(self.metadata.len())
    }
}

impl BlobSync<MemStorage> {
    /// Commit new local contents and announce them as `version`.
    ///
    /// Metadata longer than the configured limit is refused up front, since
    /// it could never be advertised.
    pub fn publish(&mut self, version: i32, metadata: Bytes, data: Bytes) -> Result<(), StorageError> {
        if metadata.len() > self.config.max_metadata_len {
            return Err(StorageError::Capacity {
                what: "metadata",
                needed: metadata.len(),
                available: self.config.max_metadata_len,
            });
        }
        let length = u32::try_from(data.len()).map_err(|_| StorageError::Capacity {
            what: "blob",
            needed: data.len(),
            available: u32::MAX as usize,
        })?;
        self.storage_mut().set_contents(metadata, data);
        self.set_local_version(version, length);
        Ok(())
    }
}
