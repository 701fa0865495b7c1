//! Scenario-driven coverage for the IPHB client table, layered on top
//! of the inline unit tests in `src/iphb/client.rs`: a full connect ->
//! wait -> coalesce -> reconnect sequence rather than single-call
//! assertions.

use dsmed::iphb::ClientTable;

#[test]
fn three_clients_coalesce_around_the_earliest_maxtime() {
    // A wakes everyone once its own maxtime elapses even though B and C
    // asked for a longer window, as long as B/C's mintime has elapsed too.
    let mut table = ClientTable::new();
    let a = table.register(10);
    let b = table.register(20);
    let c = table.register(30);

    table.get_mut(a).unwrap().wait_started = Some(0);
    table.get_mut(a).unwrap().mintime = 2;
    table.get_mut(a).unwrap().maxtime = 10;

    table.get_mut(b).unwrap().wait_started = Some(0);
    table.get_mut(b).unwrap().mintime = 3;
    table.get_mut(b).unwrap().maxtime = 30;

    table.get_mut(c).unwrap().wait_started = Some(0);
    table.get_mut(c).unwrap().mintime = 30;
    table.get_mut(c).unwrap().maxtime = 40;

    // t=10: A's maxtime elapses (pass 1). B's mintime (3) has also
    // elapsed, so pass 2 wakes it alongside A. C's mintime (30) has not,
    // so it keeps waiting.
    let woken = table.run_wake_passes(10);
    let ids: Vec<u64> = woken.iter().map(|(id, _)| *id).collect();
    assert!(ids.contains(&a));
    assert!(ids.contains(&b));
    assert!(!ids.contains(&c));
    assert_eq!(table.waiting_count(), 1);

    // C is re-armed with a fresh wait; A and B reconnect and ask again.
    table.get_mut(a).unwrap().wait_started = Some(10);
    table.get_mut(a).unwrap().mintime = 5;
    table.get_mut(a).unwrap().maxtime = 15;
    table.get_mut(b).unwrap().wait_started = Some(10);
    table.get_mut(b).unwrap().mintime = 5;
    table.get_mut(b).unwrap().maxtime = 15;

    // t=25: C's maxtime (20 since t=10 -> deadline 30) has not elapsed
    // yet, but A and B's have (deadline 25).
    let woken2 = table.run_wake_passes(25);
    let ids2: Vec<u64> = woken2.iter().map(|(id, _)| *id).collect();
    assert!(ids2.contains(&a));
    assert!(ids2.contains(&b));
    assert!(!ids2.contains(&c));
    assert!(!table.get_mut(a).unwrap().is_waiting());
    assert!(table.get_mut(c).unwrap().is_waiting());
}

#[test]
fn lone_waiter_never_wakes_before_its_own_maxtime() {
    let mut table = ClientTable::new();
    let a = table.register(1);
    table.get_mut(a).unwrap().wait_started = Some(0);
    table.get_mut(a).unwrap().mintime = 1;
    table.get_mut(a).unwrap().maxtime = 5;

    for t in 0..5 {
        assert!(table.run_wake_passes(t).is_empty(), "woke early at t={t}");
    }
    let woken = table.run_wake_passes(5);
    assert_eq!(woken, vec![(a, 5)]);
}

#[test]
fn disconnect_removes_client_and_stops_it_counting_toward_next_sleep() {
    let mut table = ClientTable::new();
    let a = table.register(1);
    let b = table.register(2);
    table.get_mut(a).unwrap().wait_started = Some(0);
    table.get_mut(a).unwrap().maxtime = 5;
    table.get_mut(b).unwrap().wait_started = Some(0);
    table.get_mut(b).unwrap().maxtime = 500;

    assert_eq!(table.next_sleep(0, 3600), std::time::Duration::from_secs(5));

    table.remove(a);
    assert_eq!(table.len(), 1);
    assert_eq!(table.next_sleep(0, 3600), std::time::Duration::from_secs(500));

    table.remove(b);
    assert!(table.is_empty());
    assert_eq!(table.next_sleep(0, 3600), std::time::Duration::from_secs(3600));
}

#[test]
fn idle_client_with_no_wait_registered_never_blocks_the_sleep_calc() {
    let mut table = ClientTable::new();
    let idle = table.register(1);
    let waiting = table.register(2);
    table.get_mut(waiting).unwrap().wait_started = Some(0);
    table.get_mut(waiting).unwrap().maxtime = 30;

    assert!(!table.get_mut(idle).unwrap().is_waiting());
    assert_eq!(table.waiting_count(), 1);
    assert_eq!(table.next_sleep(0, 3600), std::time::Duration::from_secs(30));

    // An idle client's maxtime never elapsed since it never started
    // waiting, so a wake pass leaves it alone.
    let woken = table.run_wake_passes(30);
    assert_eq!(woken, vec![(waiting, 30)]);
    assert!(!table.get_mut(idle).unwrap().is_waiting());
}
