//! Clock agreement across nodes.

use meshsync_protocols::{ClockSync, SimNetwork, TimeSource};

use crate::*;

/// Worst disagreement with `reference`, in ms, across `clocks` at `now`.
fn max_skew(clocks: &[Shared<ClockSync>], reference: &Shared<ClockSync>, now: u32) -> u32 {
    let expected = reference.borrow().synced_now(now);
    clocks
        .iter()
        .map(|c| (c.borrow().synced_now(now).wrapping_sub(expected) as i32).unsigned_abs())
        .max()
        .unwrap_or(0)
}

/// Every node ends up on the clock of the node with the longest lineage.
#[test]
fn test_clocks_converge_on_longest_lineage() {
    let mut net = SimNetwork::new(0);
    let clocks: Vec<_> = (1..=4).map(|addr| add_clock_node(&mut net, addr)).collect();
    net.begin().unwrap();

    let root = clocks
        .iter()
        .max_by_key(|c| c.borrow().synced_duration(0))
        .cloned()
        .unwrap();
    let root_synced = root.borrow().synced_now(0);

    net.run_for(10_000, STEP_MS);
    let now = net.now();

    // The root never moves: it has heard nobody older.
    assert_eq!(root.borrow().adoptions(), 0);
    assert_eq!(root.borrow().synced_now(now), root_synced.wrapping_add(now));

    for clock in &clocks {
        if Rc::ptr_eq(clock, &root) {
            continue;
        }
        assert!(clock.borrow().adoptions() >= 1);
    }
    let skew = max_skew(&clocks, &root, now);
    assert!(skew <= 2 * STEP_MS, "skew {skew} ms");
}

#[test]
fn test_late_joiner_adopts_established_clock() {
    let mut net = SimNetwork::new(0);
    let mut clocks: Vec<_> = (1..=3).map(|addr| add_clock_node(&mut net, addr)).collect();
    net.begin().unwrap();
    net.run_for(5_000, STEP_MS);

    let settled: Vec<u32> = clocks.iter().map(|c| c.borrow().adoptions()).collect();
    let reference = clocks[0].clone();

    let joiner = add_clock_node(&mut net, 4);
    net.begin().unwrap();
    assert!(max_skew(&[joiner.clone()], &reference, net.now()) > 2 * STEP_MS);

    net.run_for(3_000, STEP_MS);
    let now = net.now();
    assert!(joiner.borrow().adoptions() >= 1);

    // Its lineage is younger, so nobody already synced follows it.
    let after: Vec<u32> = clocks.iter().map(|c| c.borrow().adoptions()).collect();
    assert_eq!(settled, after);

    clocks.push(joiner);
    assert!(max_skew(&clocks, &reference, now) <= 2 * STEP_MS);
}

/// A lineage carried over the link keeps counting up at local speed.
#[test]
fn test_synced_duration_tracks_root() {
    let mut net = SimNetwork::new(50_000);
    let clocks: Vec<_> = (10..=12).map(|addr| add_clock_node(&mut net, addr)).collect();
    net.begin().unwrap();
    net.run_for(4_000, STEP_MS);

    let now = net.now();
    let durations: Vec<u32> = clocks.iter().map(|c| c.borrow().synced_duration(now)).collect();
    let max = *durations.iter().max().unwrap();
    let min = *durations.iter().min().unwrap();
    assert!(max >= 4_000);
    assert!(max - min <= 2 * STEP_MS, "{durations:?}");

    // Conversions agree with each other on every node.
    for clock in &clocks {
        let c = clock.borrow();
        let s = c.local_to_synced(now);
        assert!(c.local_to_synced(c.synced_to_local(s)) >= s);
    }
}
