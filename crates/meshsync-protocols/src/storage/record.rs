//! Small fixed-layout record carried entirely in advertise metadata.
//!
//! The blob itself is always zero bytes long, so an advertise is the whole
//! transfer: a node adopts the record the moment it hears a newer version.

use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes};

use super::{BlobStorage, StorageError};
use crate::blob_sync::BlobSync;

pub struct RecordStorage<T> {
    value: T,
    pending: Option<T>,
}

impl<T: AsBytes + FromBytes + Copy> RecordStorage<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            pending: None,
        }
    }

    pub fn get(&self) -> T {
        self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
    }
}

impl<T: AsBytes + FromBytes + Copy> BlobStorage for RecordStorage<T> {
    fn start_update(
        &mut self,
        total_len: u32,
        _version: i32,
        metadata: &[u8],
    ) -> Result<(), StorageError> {
        if total_len != 0 {
            return Err(StorageError::Rejected(format!(
                "record blobs carry no data, got length {total_len}"
            )));
        }
        let value = T::read_from(metadata).ok_or_else(|| {
            StorageError::Rejected(format!(
                "record is {} bytes, metadata is {}",
                size_of::<T>(),
                metadata.len()
            ))
        })?;
        self.pending = Some(value);
        Ok(())
    }

    fn receive_chunk(&mut self, _chunk: &[u8]) -> Result<(), StorageError> {
        Err(StorageError::Overrun(0))
    }

    fn on_abort(&mut self) {
        self.pending = None;
    }

    fn on_complete(&mut self) -> Result<(), StorageError> {
        self.value = self.pending.take().ok_or(StorageError::NoUpdate)?;
        Ok(())
    }

    fn provide_chunk(&self, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        Err(StorageError::OutOfRange {
            offset,
            len: buf.len(),
            committed: 0,
        })
    }

    fn provide_metadata(&self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let bytes = self.value.as_bytes();
        if bytes.len() > buf.len() {
            return Err(StorageError::Capacity {
                what: "record",
                needed: bytes.len(),
                available: buf.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}

impl<T: AsBytes + FromBytes + Copy> BlobSync<RecordStorage<T>> {
    pub fn value(&self) -> T {
        self.storage().get()
    }

    /// Replace the record and announce it under the next version.
    pub fn push(&mut self, value: T) {
        self.storage_mut().set(value);
        let next = self.local_version().wrapping_add(1);
        self.set_local_version(next, 0);
    }
}
