//! Routes incoming packets to protocol handlers by a one-byte protocol id,
//! and shares outbound transmit opportunities between them round-robin.
//!
//! Wire envelope: `[protocol_id:1][handler payload]`.

use std::rc::Rc;

use bytes::Bytes;
use meshsync_core::wire::PROTOCOL_ID_LEN;
use meshsync_core::{EthAddr, LocalClock, PacketHeader};

use crate::handler::SharedHandler;

/// A packet ready for the transport. `payload` starts with the protocol id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub dst: EthAddr,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("protocol id {0} is already registered")]
    DuplicateProtocol(u8),

    #[error("no protocols registered")]
    NoProtocols,
}

/// Maps protocol ids to handlers and schedules their transmissions.
///
/// Registration order is round-robin order. Entries live as long as the
/// dispatcher; there is no removal.
pub struct Dispatcher {
    protocols: Vec<(u8, SharedHandler)>,
    /// Index of the next handler to offer a transmit turn.
    cursor: usize,
    clock: Rc<dyn LocalClock>,
    scratch: Vec<u8>,
}

impl Dispatcher {
    pub fn new(clock: Rc<dyn LocalClock>) -> Self {
        Self {
            protocols: Vec::new(),
            cursor: 0,
            clock,
            scratch: Vec::new(),
        }
    }

    /// Register a handler under a unique protocol id.
    ///
    /// A duplicate id is rejected and the registry is left unchanged.
    pub fn add_protocol(&mut self, id: u8, handler: SharedHandler) -> Result<(), DispatchError> {
        if self.protocols.iter().any(|(existing, _)| *existing == id) {
            return Err(DispatchError::DuplicateProtocol(id));
        }
        self.protocols.push((id, handler));
        Ok(())
    }

    /// Called by the transport once before scheduling starts.
    pub fn begin(&mut self) -> Result<(), DispatchError> {
        if self.protocols.is_empty() {
            return Err(DispatchError::NoProtocols);
        }
        self.cursor = 0;
        tracing::info!(
            protocols = ?self.protocols.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            "dispatcher starting"
        );
        Ok(())
    }

    pub fn now(&self) -> u32 {
        self.clock.now_millis()
    }

    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Deliver one received frame. The first byte selects the protocol.
    ///
    /// Empty frames and unknown ids are dropped silently.
    pub fn receive(&self, header: &PacketHeader, data: &[u8]) {
        let Some((&proto_id, payload)) = data.split_first() else {
            tracing::trace!(src = %header.src, "empty frame, discarding");
            return;
        };

        let now = self.now();
        let mut matched = false;
        for (id, handler) in &self.protocols {
            if *id != proto_id {
                continue;
            }
            matched = true;
            match handler.try_borrow_mut() {
                Ok(mut h) => h.on_packet(now, header, payload),
                Err(_) => tracing::warn!(proto_id, "handler busy, dropping packet"),
            }
        }

        if !matched {
            tracing::trace!(proto_id, src = %header.src, "no handler for protocol, discarding");
        }
    }

    /// Offer one transmit opportunity to the next handler in turn.
    ///
    /// Exactly one handler is asked per call, whether or not it sends, so
    /// with N handlers every handler is asked once per N calls. The handler
    /// gets `max_len - 1` bytes; the id byte is prefixed here.
    pub fn transmit_turn(&mut self, max_len: usize) -> Option<Outbound> {
        if self.protocols.is_empty() {
            return None;
        }
        if self.cursor >= self.protocols.len() {
            self.cursor = 0;
        }
        let (id, handler) = &self.protocols[self.cursor];
        let (id, handler) = (*id, handler.clone());
        self.cursor += 1;

        if max_len <= PROTOCOL_ID_LEN {
            return None;
        }

        let now = self.now();
        self.scratch.clear();
        self.scratch.resize(max_len, 0);

        let transmit = match handler.try_borrow_mut() {
            Ok(mut h) => h.poll_transmit(now, &mut self.scratch[PROTOCOL_ID_LEN..])?,
            Err(_) => {
                tracing::warn!(proto_id = id, "handler busy, skipping transmit turn");
                return None;
            }
        };

        if transmit.len == 0 {
            return None;
        }
        if transmit.len > max_len - PROTOCOL_ID_LEN {
            tracing::error!(
                proto_id = id,
                len = transmit.len,
                budget = max_len - PROTOCOL_ID_LEN,
                "handler overran its transmit budget, dropping packet"
            );
            return None;
        }

        self.scratch[0] = id;
        let payload = Bytes::copy_from_slice(&self.scratch[..PROTOCOL_ID_LEN + transmit.len]);
        tracing::trace!(proto_id = id, dst = %transmit.dst, len = payload.len(), "transmit");
        Some(Outbound {
            dst: transmit.dst,
            payload,
        })
    }
}
