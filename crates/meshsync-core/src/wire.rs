//! meshsync wire format — on-wire types for every protocol carried by the
//! dispatcher.
//!
//! These types ARE the protocol. Every field width and the byte order are
//! part of the wire format; peers running different builds must agree on
//! them byte for byte.
//!
//! All multi-byte integers are little-endian. Structs are `#[repr(C)]` and
//! built only from zerocopy's byte-order-aware integer types, so they have
//! alignment 1, no padding, and an identical layout on every target. There
//! is no unsafe code in this module.

use std::mem::size_of;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Blob sync descriptors ─────────────────────────────────────────────────────

/// Version and total length of a blob.
///
/// Carried at the head of every ADVERTISE, followed by free-form metadata
/// (typically a checksum) filling the rest of the packet.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct VersionDescriptor {
    /// Monotonic blob version. -1 means "no data".
    pub version: I32<LittleEndian>,
    /// Total blob length in bytes.
    pub length: U32<LittleEndian>,
}

assert_eq_size!(VersionDescriptor, [u8; 8]);

impl VersionDescriptor {
    pub fn new(version: i32, length: u32) -> Self {
        Self {
            version: I32::new(version),
            length: U32::new(length),
        }
    }

    pub fn version(&self) -> i32 {
        self.version.get()
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }
}

/// The next byte offset a peer still needs for a given version.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct RequestDescriptor {
    pub version: I32<LittleEndian>,
    pub offset: U32<LittleEndian>,
}

assert_eq_size!(RequestDescriptor, [u8; 8]);

impl RequestDescriptor {
    pub fn new(version: i32, offset: u32) -> Self {
        Self {
            version: I32::new(version),
            offset: U32::new(offset),
        }
    }

    pub fn version(&self) -> i32 {
        self.version.get()
    }

    pub fn offset(&self) -> u32 {
        self.offset.get()
    }
}

/// Head of a PROVIDE packet. The chunk bytes follow and run to the end of
/// the packet.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ProvideDescriptor {
    pub version: I32<LittleEndian>,
    pub offset: U32<LittleEndian>,
}

assert_eq_size!(ProvideDescriptor, [u8; 8]);

impl ProvideDescriptor {
    pub fn new(version: i32, offset: u32) -> Self {
        Self {
            version: I32::new(version),
            offset: U32::new(offset),
        }
    }

    pub fn version(&self) -> i32 {
        self.version.get()
    }

    pub fn offset(&self) -> u32 {
        self.offset.get()
    }
}

// ── Clock sync ────────────────────────────────────────────────────────────────

/// The only clock sync packet. No opcode; the packet is exactly this struct.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ClockSyncData {
    /// Sender's synchronized clock at transmit time.
    pub synced_millis: U32<LittleEndian>,
    /// How long (sender's local ms) the sender's clock has been continuously
    /// synchronized. Longer wins.
    pub synced_duration: U32<LittleEndian>,
}

assert_eq_size!(ClockSyncData, [u8; 8]);

impl ClockSyncData {
    pub fn new(synced_millis: u32, synced_duration: u32) -> Self {
        Self {
            synced_millis: U32::new(synced_millis),
            synced_duration: U32::new(synced_duration),
        }
    }

    /// Decode a clock sync packet. Anything but exactly 8 bytes is rejected.
    pub fn decode(pkt: &[u8]) -> Result<Self, WireError> {
        Self::read_from(pkt).ok_or(WireError::Truncated {
            kind: "clock sync",
            need: CLOCK_SYNC_LEN,
            got: pkt.len(),
        })
    }

    pub fn synced_millis(&self) -> u32 {
        self.synced_millis.get()
    }

    pub fn synced_duration(&self) -> u32 {
        self.synced_duration.get()
    }
}

// ── Blob sync opcodes ─────────────────────────────────────────────────────────

/// First byte of every blob sync packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobOp {
    /// "I hold version V of length L" + metadata.
    Advertise = 0,
    /// "Send me version V starting at offset O."
    Request = 1,
    /// "Here is version V starting at offset O" + chunk.
    Provide = 2,
}

impl TryFrom<u8> for BlobOp {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BlobOp::Advertise),
            1 => Ok(BlobOp::Request),
            2 => Ok(BlobOp::Provide),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl From<BlobOp> for u8 {
    fn from(op: BlobOp) -> u8 {
        op as u8
    }
}

/// A decoded blob sync packet, borrowing its trailing bytes from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPacket<'a> {
    Advertise {
        desc: VersionDescriptor,
        metadata: &'a [u8],
    },
    Request(RequestDescriptor),
    Provide {
        desc: ProvideDescriptor,
        chunk: &'a [u8],
    },
}

impl<'a> BlobPacket<'a> {
    /// Decode a blob sync packet (protocol id already stripped).
    pub fn decode(pkt: &'a [u8]) -> Result<Self, WireError> {
        let (&op, body) = pkt.split_first().ok_or(WireError::Empty)?;
        match BlobOp::try_from(op)? {
            BlobOp::Advertise => {
                let desc: VersionDescriptor = read_prefix(body, "advertise")?;
                Ok(BlobPacket::Advertise {
                    desc,
                    metadata: &body[DESCRIPTOR_LEN..],
                })
            }
            BlobOp::Request => Ok(BlobPacket::Request(read_prefix(body, "request")?)),
            BlobOp::Provide => {
                let desc: ProvideDescriptor = read_prefix(body, "provide")?;
                let chunk = &body[DESCRIPTOR_LEN..];
                if chunk.is_empty() {
                    return Err(WireError::EmptyChunk);
                }
                Ok(BlobPacket::Provide { desc, chunk })
            }
        }
    }
}

fn read_prefix<T: FromBytes>(body: &[u8], kind: &'static str) -> Result<T, WireError> {
    T::read_from_prefix(body).ok_or(WireError::Truncated {
        kind,
        need: size_of::<T>(),
        got: body.len(),
    })
}

/// Write `[op][descriptor]` at the start of `buf`. Returns bytes written.
/// Trailing metadata or chunk bytes go at `buf[BLOB_HEADER_LEN..]`.
pub fn write_blob_header<T: AsBytes>(
    buf: &mut [u8],
    op: BlobOp,
    desc: &T,
) -> Result<usize, WireError> {
    let need = 1 + size_of::<T>();
    if buf.len() < need {
        return Err(WireError::BufferTooSmall {
            need,
            got: buf.len(),
        });
    }
    buf[0] = op.into();
    buf[1..need].copy_from_slice(desc.as_bytes());
    Ok(need)
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of every blob sync descriptor.
pub const DESCRIPTOR_LEN: usize = 8;

/// Opcode byte plus descriptor.
pub const BLOB_HEADER_LEN: usize = 1 + DESCRIPTOR_LEN;

/// Size of a clock sync packet.
pub const CLOCK_SYNC_LEN: usize = size_of::<ClockSyncData>();

/// Size of the dispatcher envelope (the protocol id byte).
pub const PROTOCOL_ID_LEN: usize = 1;

/// Largest frame the reference radio link carries (ESP-NOW payload limit).
pub const DEFAULT_MTU: usize = 250;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
///
/// Receivers never surface these to peers; a packet that fails to decode is
/// dropped and the sender retries on its own schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("empty packet")]
    Empty,

    #[error("unknown blob sync opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("{kind} packet truncated: need {need} bytes, got {got}")]
    Truncated {
        kind: &'static str,
        need: usize,
        got: usize,
    },

    #[error("provide packet carries no chunk bytes")]
    EmptyChunk,

    #[error("buffer of {got} bytes cannot hold {need} bytes")]
    BufferTooSmall { need: usize, got: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
