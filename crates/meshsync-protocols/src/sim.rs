//! In-process broadcast link for driving several dispatchers against each
//! other. Every node shares one [`ManualClock`]; time only moves when the
//! caller advances it.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use meshsync_core::wire::DEFAULT_MTU;
use meshsync_core::{EthAddr, LocalClock, ManualClock, PacketHeader};

use crate::dispatch::{DispatchError, Dispatcher};

/// Per-node link counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub dropped: u64,
    pub received: u64,
}

struct SimNode {
    addr: EthAddr,
    dispatcher: Dispatcher,
    inbox: VecDeque<(EthAddr, Bytes)>,
    /// Fraction of transmissions to drop, accumulated deterministically.
    loss: f64,
    loss_acc: f64,
    stats: LinkStats,
}

pub struct SimNetwork {
    clock: ManualClock,
    mtu: usize,
    nodes: Vec<SimNode>,
}

impl SimNetwork {
    pub fn new(start: u32) -> Self {
        Self {
            clock: ManualClock::new(start),
            mtu: DEFAULT_MTU,
            nodes: Vec::new(),
        }
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// A handle on the shared clock.
    pub fn clock(&self) -> ManualClock {
        self.clock.clone()
    }

    pub fn now(&self) -> u32 {
        self.clock.now_millis()
    }

    /// Add a node and return its index.
    pub fn add_node(&mut self, addr: EthAddr) -> usize {
        self.nodes.push(SimNode {
            addr,
            dispatcher: Dispatcher::new(Rc::new(self.clock.clone())),
            inbox: VecDeque::new(),
            loss: 0.0,
            loss_acc: 0.0,
            stats: LinkStats::default(),
        });
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn addr(&self, node: usize) -> EthAddr {
        self.nodes[node].addr
    }

    pub fn dispatcher_mut(&mut self, node: usize) -> &mut Dispatcher {
        &mut self.nodes[node].dispatcher
    }

    /// Drop this fraction of the node's transmissions. The loss accumulates
    /// per send, so `0.5` drops every other packet after the first two.
    pub fn set_loss(&mut self, node: usize, loss: f64) {
        self.nodes[node].loss = loss;
    }

    pub fn stats(&self, node: usize) -> LinkStats {
        self.nodes[node].stats
    }

    /// Start every dispatcher.
    pub fn begin(&mut self) -> Result<(), DispatchError> {
        for node in &mut self.nodes {
            node.dispatcher.begin()?;
        }
        Ok(())
    }

    /// One scheduling tick for every node, in order: drain its inbox, then
    /// take one transmit turn and queue the result at its receivers.
    pub fn step(&mut self) {
        for i in 0..self.nodes.len() {
            let node = &mut self.nodes[i];
            while let Some((src, data)) = node.inbox.pop_front() {
                node.stats.received += 1;
                node.dispatcher.receive(&PacketHeader::from_src(src), &data);
            }

            let Some(out) = node.dispatcher.transmit_turn(self.mtu) else {
                continue;
            };
            let src = node.addr;

            node.loss_acc += node.loss;
            if node.loss_acc > 1.0 {
                node.loss_acc -= 1.0;
                node.stats.dropped += 1;
                tracing::trace!(src = %src, len = out.payload.len(), "simulated loss");
                continue;
            }
            node.stats.sent += 1;

            for (j, peer) in self.nodes.iter_mut().enumerate() {
                if j == i {
                    continue;
                }
                if !out.dst.is_broadcast() && out.dst != peer.addr {
                    continue;
                }
                peer.inbox.push_back((src, out.payload.clone()));
            }
        }
    }

    /// Step and advance the clock by `step_ms` until `ms` have elapsed.
    pub fn run_for(&mut self, ms: u32, step_ms: u32) {
        let step_ms = step_ms.max(1);
        let mut elapsed = 0;
        while elapsed < ms {
            self.step();
            self.clock.advance(step_ms);
            elapsed += step_ms;
        }
    }

    /// Like [`run_for`](Self::run_for) but stops as soon as `done` holds.
    /// Returns whether it did.
    pub fn run_until(&mut self, limit_ms: u32, step_ms: u32, mut done: impl FnMut() -> bool) -> bool {
        let step_ms = step_ms.max(1);
        let mut elapsed = 0;
        while elapsed < limit_ms {
            if done() {
                return true;
            }
            self.step();
            self.clock.advance(step_ms);
            elapsed += step_ms;
        }
        done()
    }
}
