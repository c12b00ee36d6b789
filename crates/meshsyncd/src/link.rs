//! Broadcast link emulated over IPv6 link-local multicast.
//!
//! Every frame goes to ff02::1 on one interface and carries a small
//! hardware-style header so the engine sees a radio-like link:
//!
//!   [dst:6][src:6][payload]
//!
//! Receivers drop their own frames and unicast frames for other nodes.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use meshsync_core::{EthAddr, PacketHeader};
use meshsync_protocols::Outbound;

pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
}

pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();
const _: () = assert!(FRAME_HEADER_LEN == 12);

/// Build a frame for `out` sent by `src`.
pub fn encode_frame(src: EthAddr, out: &Outbound) -> Vec<u8> {
    let header = FrameHeader {
        dst: out.dst.0,
        src: src.0,
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + out.payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&out.payload);
    frame
}

/// Split a received frame. `None` for short frames, our own frames, and
/// unicast frames addressed elsewhere.
pub fn decode_frame(local: EthAddr, frame: &[u8]) -> Option<(PacketHeader, &[u8])> {
    let header = FrameHeader::read_from_prefix(frame)?;
    let src = EthAddr(header.src);
    let dst = EthAddr(header.dst);
    if src == local {
        return None;
    }
    if !dst.is_broadcast() && dst != local {
        return None;
    }
    Some((PacketHeader::from_src(src), &frame[FRAME_HEADER_LEN..]))
}

/// Locally administered unicast address derived from the interface and its
/// link-local IP, stable across restarts.
pub fn derive_addr(interface: &str, ip: &Ipv6Addr) -> EthAddr {
    let mut hasher = blake3::Hasher::new();
    hasher.update(interface.as_bytes());
    hasher.update(&ip.octets());
    let hash = hasher.finalize();
    let mut addr = [0u8; 6];
    addr.copy_from_slice(&hash.as_bytes()[..6]);
    addr[0] = (addr[0] & 0xfc) | 0x02;
    EthAddr(addr)
}

pub struct UdpLink {
    socket: UdpSocket,
    dest: SocketAddrV6,
    addr: EthAddr,
}

impl UdpLink {
    /// Join the multicast group on `interface`. `addr` overrides the derived
    /// link address.
    pub fn open(interface: &str, port: u16, addr: Option<EthAddr>) -> Result<Self> {
        let index = if_index(interface)?;
        let addr = match addr {
            Some(a) => a,
            None => derive_addr(interface, &link_local_addr(index, port)?),
        };

        let socket = make_link_socket(index, port).context("failed to create multicast link socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

        tracing::info!(interface, index, port, addr = %addr, "link up");
        Ok(Self {
            socket,
            dest: SocketAddrV6::new(MULTICAST_ADDR, port, 0, index),
            addr,
        })
    }

    pub fn addr(&self) -> EthAddr {
        self.addr
    }

    /// Receive one datagram. `None` when it is not a frame for us.
    pub async fn recv<'a>(&self, buf: &'a mut [u8]) -> Result<Option<(PacketHeader, &'a [u8])>> {
        let (len, peer) = self.socket.recv_from(buf).await.context("recv_from")?;
        if let SocketAddr::V4(_) = peer {
            tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
            return Ok(None);
        }
        let frame: &'a [u8] = &buf[..len];
        let decoded = decode_frame(self.addr, frame);
        if decoded.is_none() {
            tracing::trace!(len, peer = %peer, "frame not for us");
        }
        Ok(decoded)
    }

    pub async fn send(&self, out: &Outbound) -> Result<()> {
        let frame = encode_frame(self.addr, out);
        let n = self
            .socket
            .send_to(&frame, self.dest)
            .await
            .context("send_to")?;
        tracing::trace!(bytes = n, dst = %out.dst, "frame sent");
        Ok(())
    }
}

/// One socket for both directions: bound to the link port, joined to
/// ff02::1, multicast limited to one hop, loopback off.
fn make_link_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    socket.set_multicast_loop_v6(false).context("IPV6_MULTICAST_LOOP")?;

    Ok(socket.into())
}

/// Link-local address the kernel would use to reach ff02::1 on this
/// interface.
fn link_local_addr(interface_index: u32, port: u16) -> Result<Ipv6Addr> {
    let probe = std::net::UdpSocket::bind("[::]:0")?;
    probe.connect(SocketAddrV6::new(MULTICAST_ADDR, port, 0, interface_index))?;
    match probe.local_addr()? {
        SocketAddr::V6(v6) => Ok(*v6.ip()),
        _ => anyhow::bail!("expected IPv6 local address"),
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}
