//! Several protocols sharing one link: turn taking, routing by id, and
//! periodic broadcasts placed on the shared synced clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use meshsync_core::EthAddr;
use meshsync_protocols::{
    shared, CustomProtocol, LocalPeriodic, PeriodicRecord, SimNetwork, TimeSource, Transmit,
};

use crate::*;

/// A protocol that wants to send a one-byte tag on every turn.
fn chatty(tag: u8) -> CustomProtocol {
    CustomProtocol::new().on_transmit(move |_, buf| {
        buf[0] = tag;
        Some(Transmit::broadcast(1))
    })
}

fn counter(count: Rc<Cell<u32>>) -> CustomProtocol {
    CustomProtocol::new().on_receive(move |_, _, _| count.set(count.get() + 1))
}

#[test]
fn test_transmit_turns_rotate_between_protocols() {
    let mut net = SimNetwork::new(0);
    let a = net.add_node(EthAddr::from(1));
    let b = net.add_node(EthAddr::from(2));

    // Protocol 3 never sends but still costs a turn.
    net.dispatcher_mut(a).add_protocol(1, shared(chatty(0x11))).unwrap();
    net.dispatcher_mut(a).add_protocol(2, shared(chatty(0x22))).unwrap();
    net.dispatcher_mut(a).add_protocol(3, shared(CustomProtocol::new())).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    for id in 1..=3u8 {
        let seen = seen.clone();
        let handler = CustomProtocol::new()
            .on_receive(move |_, _, payload| seen.borrow_mut().push((id, payload[0])));
        net.dispatcher_mut(b).add_protocol(id, shared(handler)).unwrap();
    }
    net.begin().unwrap();

    for _ in 0..10 {
        net.step();
    }

    let seen = seen.borrow();
    assert_eq!(
        seen[..6],
        [(1, 0x11), (2, 0x22), (1, 0x11), (2, 0x22), (1, 0x11), (2, 0x22)]
    );
    assert_eq!(net.stats(a).sent, 7);
}

#[test]
fn test_unknown_protocol_ids_are_dropped() {
    let mut net = SimNetwork::new(0);
    let a = net.add_node(EthAddr::from(1));
    let b = net.add_node(EthAddr::from(2));
    net.dispatcher_mut(a).add_protocol(7, shared(chatty(0x77))).unwrap();

    let hits = Rc::new(Cell::new(0));
    net.dispatcher_mut(b).add_protocol(1, shared(counter(hits.clone()))).unwrap();
    net.begin().unwrap();

    net.run_for(100, STEP_MS);
    assert_eq!(hits.get(), 0);
    assert!(net.stats(b).received > 0);
}

#[test]
fn test_duplicate_protocol_id_is_rejected() {
    let mut net = SimNetwork::new(0);
    let a = net.add_node(EthAddr::from(1));
    let first = Rc::new(Cell::new(0));
    let second = Rc::new(Cell::new(0));
    net.dispatcher_mut(a).add_protocol(4, shared(counter(first.clone()))).unwrap();
    assert!(net
        .dispatcher_mut(a)
        .add_protocol(4, shared(counter(second.clone())))
        .is_err());
    assert_eq!(net.dispatcher_mut(a).len(), 1);

    let b = net.add_node(EthAddr::from(2));
    net.dispatcher_mut(b).add_protocol(4, shared(chatty(1))).unwrap();
    net.begin().unwrap();
    net.run_for(20, STEP_MS);
    assert!(first.get() > 0);
    assert_eq!(second.get(), 0);
}

#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
struct Hello {
    node: u32,
}

const HELLO_PROTO: u8 = 5;
const SLOT_MS: u32 = 1_000;

/// Once clocks agree, every node broadcasts exactly once per slot of
/// synced time, so each node hears each peer once per slot.
#[test]
fn test_periodic_broadcasts_follow_synced_slots() {
    let mut net = SimNetwork::new(0);
    let mut periodics = Vec::new();
    let mut heard = Vec::new();

    for addr in 1..=3u32 {
        let clock = add_clock_node(&mut net, u64::from(addr));
        let count = Rc::new(Cell::new(0u32));

        let mut record = PeriodicRecord::new();
        record.set_fill_hook(move || Some(Hello { node: addr }));
        {
            let count = count.clone();
            record.set_received_hook(move |_, hello: Hello| {
                assert_ne!(hello.node, addr);
                count.set(count.get() + 1);
            });
        }
        let time: Rc<dyn TimeSource> = clock.clone();
        let periodic = shared(
            LocalPeriodic::new(record, time, SLOT_MS).with_rng(rng(u64::from(addr) + 50)),
        );
        let node = (addr - 1) as usize;
        net.dispatcher_mut(node)
            .add_protocol(HELLO_PROTO, periodic.clone())
            .unwrap();
        periodic.borrow_mut().begin(net.now());

        periodics.push(periodic);
        heard.push(count);
    }
    net.begin().unwrap();

    let drive = |net: &mut SimNetwork, ms: u32| {
        for _ in 0..ms / STEP_MS {
            for p in &periodics {
                p.borrow_mut().run(net.now());
            }
            net.step();
            net.clock().advance(STEP_MS);
        }
    };

    // Let the clocks settle, then count over whole slots.
    drive(&mut net, 5_000);
    let before: Vec<u32> = heard.iter().map(|c| c.get()).collect();
    drive(&mut net, 10 * SLOT_MS);

    for (count, start) in heard.iter().zip(before) {
        let got = count.get() - start;
        assert!((18..=22).contains(&got), "heard {got} broadcasts over ten slots");
    }
}
