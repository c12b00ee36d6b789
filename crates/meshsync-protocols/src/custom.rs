//! Ad-hoc protocols built from closures.

use meshsync_core::PacketHeader;

use crate::handler::{ProtocolHandler, Transmit};

type ReceiveFn = Box<dyn FnMut(u32, &PacketHeader, &[u8])>;
type TransmitFn = Box<dyn FnMut(u32, &mut [u8]) -> Option<Transmit>>;

/// A handler whose behavior is supplied as closures. Missing closures
/// ignore packets and never transmit.
#[derive(Default)]
pub struct CustomProtocol {
    receive: Option<ReceiveFn>,
    transmit: Option<TransmitFn>,
}

impl CustomProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_receive(mut self, f: impl FnMut(u32, &PacketHeader, &[u8]) + 'static) -> Self {
        self.receive = Some(Box::new(f));
        self
    }

    pub fn on_transmit(mut self, f: impl FnMut(u32, &mut [u8]) -> Option<Transmit> + 'static) -> Self {
        self.transmit = Some(Box::new(f));
        self
    }
}

impl ProtocolHandler for CustomProtocol {
    fn on_packet(&mut self, now: u32, header: &PacketHeader, payload: &[u8]) {
        if let Some(f) = self.receive.as_mut() {
            f(now, header, payload);
        }
    }

    fn poll_transmit(&mut self, now: u32, buf: &mut [u8]) -> Option<Transmit> {
        let f = self.transmit.as_mut()?;
        let transmit = f(now, buf)?;
        if transmit.len > buf.len() {
            tracing::error!(len = transmit.len, budget = buf.len(), "custom protocol overran its buffer");
            return None;
        }
        Some(transmit)
    }
}
