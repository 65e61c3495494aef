use std::time::Duration;

use ats_env::{NetworkScope, PeerId, PreferenceKind, Quotas, Solver};
use ats_sim::Event;
use ats_solver::{
    ril::{Algorithm, Selection, TraceMode, Welfare},
    RilOptions, RilSolver,
};
use tokio_stream::StreamExt;

use crate::helpers::{add, book, request};

const MIN_BW: u32 = 5 * 1024;

fn options() -> RilOptions {
    RilOptions::default().with_seed(42).with_min_bw(MIN_BW)
}

#[test]
fn request_starts_at_minimum_bandwidth() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let mut solver =
        RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let peer = PeerId(1);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    let selected = request(&book, &mut solver, peer).expect("an address");

    assert_eq!(selected.id, address.id);
    assert_eq!(selected.assignment(), (true, MIN_BW, MIN_BW));
    assert_eq!(book.notification_count(), 0);

    let state = solver.agent_state(peer).unwrap();
    assert!(state.active);
    assert!(!state.blocked);
    assert_eq!(state.address, Some(address.id));
    assert_eq!(state.step_count, 0);
}

#[test]
fn simulated_steps_keep_invariants() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let options = options().with_simulate(true).with_exploration(0.5, 0.99);
    let mut solver = RilSolver::new(book.clone(), quotas, options).unwrap();

    let peers: Vec<_> = (1..=4).map(PeerId).collect();
    for peer in &peers {
        add(&book, &mut solver, *peer, "tcp", NetworkScope::Wan);
        add(&book, &mut solver, *peer, "udp", NetworkScope::Lan);
        book.set_preference(*peer, PreferenceKind::Bandwidth, peer.0 as f64 / 4.0);
        request(&book, &mut solver, *peer);
    }
    let before = solver.step_count();

    for _ in 0..50 {
        solver.solve().unwrap();
        assert!(book.violations(false).is_empty());
        for peer in &peers {
            assert_eq!(book.active_addresses(*peer).len(), 1);
        }
    }

    assert_eq!(solver.step_count(), before + 50);
    for peer in &peers {
        let state = solver.agent_state(*peer).unwrap();
        assert_eq!(state.addresses, 2);
        assert!(state.bw_in >= MIN_BW && state.bw_out >= MIN_BW);
        assert!(state.step_count >= 50);
    }
    assert!(!solver.is_scheduled());
}

#[test]
fn learning_variants_run() {
    let _ = tracing_subscriber::fmt::try_init();

    let variants = [
        options().with_algorithm(Algorithm::Q).with_trace_mode(TraceMode::Replace),
        options().with_selection(Selection::Softmax).with_temperature(0.5, 0.9),
        options().with_welfare(Welfare::Egalitarian).with_inc_dec_step(4),
    ];

    for options in variants {
        let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
        let book = book(&quotas);
        let mut solver = RilSolver::new(book.clone(), quotas, options.with_simulate(true)).unwrap();

        for peer in (1..=3).map(PeerId) {
            add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
            add(&book, &mut solver, peer, "udp", NetworkScope::Wlan);
            request(&book, &mut solver, peer);
        }
        for _ in 0..20 {
            solver.solve().unwrap();
        }
        assert!(book.violations(false).is_empty());
    }
}

#[test]
fn usage_returns_below_quota_after_admissions() {
    let _ = tracing_subscriber::fmt::try_init();

    // room for eight agents at the minimum bandwidth
    let quota = 8 * MIN_BW as u64;
    let quotas = Quotas::uniform(64 * 1024, 64 * 1024).with_quota(NetworkScope::Wan, quota, quota);
    let book = book(&quotas);
    let options = options().with_seed(3).with_simulate(true).with_exploration(0.5, 0.999);
    let mut solver = RilSolver::new(book.clone(), quotas, options).unwrap();
    let within_quota = || {
        let (used_in, used_out) = book.scope_usage(NetworkScope::Wan);
        used_in <= quota && used_out <= quota
    };

    for peer in (1..=4).map(PeerId) {
        add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
        book.set_preference(peer, PreferenceKind::Bandwidth, 1.0);
        request(&book, &mut solver, peer).expect("an address");
    }
    for _ in 0..300 {
        solver.solve().unwrap();
        assert!(book.violations(true).is_empty());
    }

    // four more agents arrive at the minimum while the others hold what they grabbed
    for peer in (5..=8).map(PeerId) {
        add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
        request(&book, &mut solver, peer).expect("still room for the minimum");
    }

    let mut steps = 0;
    while !within_quota() {
        assert!(steps < 10, "usage {:?} still above {quota}", book.scope_usage(NetworkScope::Wan));
        solver.solve().unwrap();
        steps += 1;
    }

    for _ in 0..300 {
        solver.solve().unwrap();
        assert!(book.violations(true).is_empty());
    }
    for peer in (1..=8).map(PeerId) {
        assert_eq!(book.active_addresses(peer).len(), 1);
    }
}

#[test]
fn blocked_agent_waits_for_capacity() {
    let _ = tracing_subscriber::fmt::try_init();

    // room for a single agent at the minimum bandwidth
    let quotas = Quotas::uniform(64 * 1024, 64 * 1024)
        .with_quota(NetworkScope::Wan, MIN_BW as u64, MIN_BW as u64);
    let book = book(&quotas);
    let mut solver = RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let (a, b) = (PeerId(1), PeerId(2));
    add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    add(&book, &mut solver, b, "tcp", NetworkScope::Wan);

    assert!(request(&book, &mut solver, a).is_some());
    assert!(request(&book, &mut solver, b).is_none());
    assert!(solver.agent_state(b).unwrap().blocked);

    for _ in 0..5 {
        solver.solve().unwrap();
    }
    let blocked = solver.agent_state(b).unwrap();
    assert!(blocked.blocked);
    assert_eq!(blocked.step_count, 0);
    assert!(book.active_addresses(b).is_empty());
    assert!(solver.agent_state(a).unwrap().step_count >= 5);

    solver.stop_get_preferred_address(a).unwrap();
    book.release_peer(a);

    let state = solver.agent_state(b).unwrap();
    assert!(!state.blocked);
    assert!(state.step_count >= 1);
    assert_eq!(book.active_addresses(b).len(), 1);
    assert!(book.violations(false).is_empty());
}

#[test]
fn scope_below_minimum_is_unused() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024).with_quota(NetworkScope::Wan, 1024, 1024);
    let book = book(&quotas);
    let mut solver = RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let peer = PeerId(1);
    let unusable = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    assert!(solver.agent_state(peer).is_none());
    assert!(request(&book, &mut solver, peer).is_none());

    let usable = add(&book, &mut solver, peer, "udp", NetworkScope::Lan);
    let state = solver.agent_state(peer).unwrap();
    assert_eq!(state.addresses, 1);
    assert_eq!(state.address, Some(usable.id));

    solver.address_delete(unusable.id, false).unwrap();
    assert_eq!(solver.agent_state(peer).unwrap().addresses, 1);
}

#[test]
fn deleting_the_only_address_disconnects() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let mut solver = RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let peer = PeerId(1);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    book.take_notifications();

    solver.address_delete(address.id, false).unwrap();
    let notifications = book.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].id, address.id);
    assert_eq!(notifications[0].assignment(), (false, 0, 0));

    let state = solver.agent_state(peer).unwrap();
    assert!(state.blocked);
    assert_eq!(state.addresses, 0);

    // a new address unblocks the waiting agent
    let fresh = add(&book, &mut solver, peer, "udp", NetworkScope::Wan);
    assert_eq!(solver.agent_state(peer).unwrap().address, Some(fresh.id));
    assert!(book.active_addresses(peer).iter().any(|a| a.id == fresh.id));
}

#[test]
fn network_change_is_one_step() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let mut solver = RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let peer = PeerId(1);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    let before = solver.step_count();

    book.set_scope(address.id, NetworkScope::Lan);
    solver.address_change_network(address.id, NetworkScope::Lan).unwrap();

    assert_eq!(solver.step_count(), before + 1);
    let state = solver.agent_state(peer).unwrap();
    assert_eq!(state.address, Some(address.id));
    assert!(book.violations(false).is_empty());
}

#[tokio::test(start_paused = true)]
async fn timer_drives_steps() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let options = options().with_step_times(Duration::from_millis(200), Duration::from_secs(2));
    let mut solver = RilSolver::new(book.clone(), quotas, options).unwrap();
    let mut events = book.subscribe();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    assert!(solver.is_scheduled());
    let before = solver.step_count();

    // low utilization, so the next step is close to the maximum interval
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(solver.step_count(), before + 1);

    let started = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.next().await {
            if let Event::Info(info) = event {
                if info.op == ats_env::Operation::SolveStart {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(started);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(solver.step_count() >= before + 5);
    assert!(book.violations(false).is_empty());

    solver.shutdown();
    let stopped_at = solver.step_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(solver.step_count(), stopped_at);
    assert!(!solver.is_scheduled());
}

#[tokio::test(start_paused = true)]
async fn idle_solver_stops_its_timer() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let options = options().with_step_times(Duration::from_millis(200), Duration::from_secs(2));
    let mut solver = RilSolver::new(book.clone(), quotas, options).unwrap();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    assert!(solver.is_scheduled());

    solver.stop_get_preferred_address(peer).unwrap();
    book.release_peer(peer);
    assert!(!solver.is_scheduled());

    let stopped_at = solver.step_count();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(solver.step_count(), stopped_at);
    assert!(!solver.is_scheduled());

    // a new request resumes the periodic steps
    request(&book, &mut solver, peer).expect("an address");
    assert!(solver.is_scheduled());
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(solver.step_count() > stopped_at);
}

#[tokio::test(start_paused = true)]
async fn simulate_mode_has_no_timer() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(64 * 1024, 64 * 1024);
    let book = book(&quotas);
    let mut solver = RilSolver::new(book.clone(), quotas, options().with_simulate(true)).unwrap();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    let before = solver.step_count();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(solver.step_count(), before);
    assert!(!solver.is_scheduled());
}
