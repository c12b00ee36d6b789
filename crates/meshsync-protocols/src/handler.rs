//! Handler trait for protocols carried by the dispatcher.
//!
//! Every meshsync protocol receives packets and occasionally produces one.
//! This trait is the contract between the dispatcher (which owns the link
//! schedule) and the protocol logic (which owns its own state).

use std::cell::RefCell;
use std::rc::Rc;

use meshsync_core::{EthAddr, PacketHeader};

/// Trait for protocols multiplexed over one shared link.
///
/// Intentionally minimal: no acknowledgement, no request/response. Both
/// methods must return promptly; waiting is expressed by comparing `now`
/// against a stored deadline on the next call.
pub trait ProtocolHandler {
    /// Handle a packet addressed to this protocol. The protocol id byte is
    /// already stripped. Malformed input must be dropped, never panic.
    fn on_packet(&mut self, now: u32, header: &PacketHeader, payload: &[u8]);

    /// Fill `buf` with a packet if this protocol wants to send one now.
    ///
    /// `buf.len()` is the full budget for this turn. Return `None` to pass.
    fn poll_transmit(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit>;
}

/// A packet a handler wrote into the dispatcher's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmit {
    pub dst: EthAddr,
    /// Bytes written at the start of the buffer.
    pub len: usize,
}

impl Transmit {
    pub fn broadcast(len: usize) -> Self {
        Self {
            dst: EthAddr::BROADCAST,
            len,
        }
    }
}

/// How handlers are registered. The dispatcher holds a clone; the caller
/// keeps its own to inspect or drive the handler.
pub type SharedHandler = Rc<RefCell<dyn ProtocolHandler>>;

/// Wrap a handler for registration while keeping a typed handle.
pub fn shared<H: ProtocolHandler + 'static>(handler: H) -> Rc<RefCell<H>> {
    Rc::new(RefCell::new(handler))
}
