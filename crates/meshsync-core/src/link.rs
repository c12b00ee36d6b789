//! Link-layer value types shared by the transport and every protocol.

use std::fmt;
use std::str::FromStr;

/// 6-byte hardware address of a node on the broadcast link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct EthAddr(pub [u8; 6]);

impl EthAddr {
    /// All-ones: deliver to every node in range.
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    pub const LEN: usize = 6;

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Read an address from the first six bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.get(..Self::LEN)?.try_into().ok()?;
        Some(EthAddr(arr))
    }
}

/// Low 48 bits, most significant byte first. Handy for numbering test nodes.
impl From<u64> for EthAddr {
    fn from(val: u64) -> Self {
        let mut addr = [0u8; 6];
        for (i, byte) in addr.iter_mut().enumerate() {
            *byte = (val >> ((5 - i) * 8)) as u8;
        }
        EthAddr(addr)
    }
}

impl fmt::Display for EthAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hardware address: {0:?}")]
pub struct AddrParseError(pub String);

impl FromStr for EthAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.split(':');
        for byte in addr.iter_mut() {
            let part = parts.next().ok_or_else(|| AddrParseError(s.to_string()))?;
            if part.len() != 2 {
                return Err(AddrParseError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddrParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrParseError(s.to_string()));
        }
        Ok(EthAddr(addr))
    }
}

/// Per-packet metadata produced by the transport. Not on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Sender's hardware address.
    pub src: EthAddr,
    /// Received signal strength, if the transport reports one.
    pub rssi: Option<i8>,
}

impl PacketHeader {
    pub fn from_src(src: EthAddr) -> Self {
        Self { src, rssi: None }
    }
}
