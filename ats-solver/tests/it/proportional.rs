use std::time::Duration;

use ats_env::{
    ConfigError, InfoDetail, NetworkScope, Operation, PeerId, PreferenceKind, PropertyKind,
    Quotas, Solver, SolverError,
};
use ats_solver::{ProportionalOptions, ProportionalSolver};

use crate::helpers::{add, book, request, solve_starts};

fn options() -> ProportionalOptions {
    ProportionalOptions::default().with_min_bw(1024).with_proportionality_factor(2.0)
}

#[test]
fn splits_quota_by_preference() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let (a, b) = (PeerId(1), PeerId(2));
    let addr_a = add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    let addr_b = add(&book, &mut solver, b, "tcp", NetworkScope::Wan);
    book.set_preference(a, PreferenceKind::Bandwidth, 0.0);
    book.set_preference(b, PreferenceKind::Bandwidth, 1.0);

    request(&book, &mut solver, a).expect("an address for a");
    assert_eq!(book.address(addr_a.id).unwrap().assigned_bw_in, 100_000);

    request(&book, &mut solver, b).expect("an address for b");

    let a = book.address(addr_a.id).unwrap();
    let b = book.address(addr_b.id).unwrap();
    assert_eq!((a.assigned_bw_in, a.assigned_bw_out), (25_512, 25_512));
    assert_eq!((b.assigned_bw_in, b.assigned_bw_out), (74_488, 74_488));
    assert!(book.violations(true).is_empty());

    let info = book.take_info();
    assert!(info
        .iter()
        .any(|e| e.op == Operation::SolveStart && e.detail == InfoDetail::PropSingle));
}

#[test]
fn redistribution_is_idempotent() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    for peer in (1..=3).map(PeerId) {
        add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
        request(&book, &mut solver, peer);
    }
    book.take_notifications();
    book.take_info();

    solver.solve().unwrap();
    let info = book.take_info();
    assert_eq!(solve_starts(&info), 1);
    assert!(info.iter().all(|e| e.detail == InfoDetail::PropAll));
    assert!(book.take_notifications().is_empty());
    assert_eq!(solver.address_counts(), (3, 3));
}

#[tokio::test(start_paused = true)]
async fn recently_activated_address_is_kept() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    let current = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    let other = add(&book, &mut solver, peer, "udp", NetworkScope::Wan);
    book.set_property(current.id, PropertyKind::Distance, 1.3);
    book.set_property(other.id, PropertyKind::Distance, 2.0);

    let selected = request(&book, &mut solver, peer).expect("an address");
    assert_eq!(selected.id, current.id);
    book.take_notifications();

    // better, but the active address is still young
    let value = book.set_property(other.id, PropertyKind::Distance, 1.1);
    solver.address_property_changed(other.id, PropertyKind::Distance, 11, value).unwrap();
    assert!(book.take_notifications().is_empty());

    // old enough, but the improvement stays below the stability factor
    tokio::time::advance(Duration::from_secs(2)).await;
    solver.address_property_changed(other.id, PropertyKind::Distance, 11, value).unwrap();
    assert!(book.take_notifications().is_empty());
    assert_eq!(book.active_addresses(peer)[0].id, current.id);

    let value = book.set_property(other.id, PropertyKind::Distance, 1.0);
    solver.address_property_changed(other.id, PropertyKind::Distance, 10, value).unwrap();

    let notifications = book.take_notifications();
    assert_eq!(notifications.len(), 2);
    assert_eq!(notifications[0].id, current.id);
    assert!(!notifications[0].active);
    assert_eq!(notifications[1].id, other.id);
    assert_eq!(notifications[1].assignment(), (true, 100_000, 100_000));
    assert!(book.violations(true).is_empty());
}

#[test]
fn higher_connectivity_displaces() {
    let _ = tracing_subscriber::fmt::try_init();

    // room for exactly two active addresses
    let quotas = Quotas::uniform(100_000, 100_000).with_quota(NetworkScope::Wan, 2048, 2048);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let (a, b, c) = (PeerId(1), PeerId(2), PeerId(3));
    let addr_a = add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    let addr_b = add(&book, &mut solver, b, "tcp", NetworkScope::Wan);
    let addr_c = add(&book, &mut solver, c, "tcp", NetworkScope::Wan);

    request(&book, &mut solver, a).expect("a fits");
    request(&book, &mut solver, b).expect("b fits");
    assert_eq!(book.address(addr_b.id).unwrap().assigned_bw_in, 1024);

    book.request_peer(c);
    book.set_connectivity(c, 5);
    let selected = solver.get_preferred_address(c).unwrap().expect("c displaces a");
    book.apply(&selected);
    assert_eq!(selected.id, addr_c.id);

    assert!(book.active_addresses(a).is_empty());
    assert!(!book.address(addr_a.id).unwrap().active);
    assert!(book.address(addr_b.id).unwrap().active);
    assert!(book.violations(true).is_empty());
    assert_eq!(book.scope_usage(NetworkScope::Wan), (2048, 2048));

    // same connectivity, nobody to displace
    let d = PeerId(4);
    add(&book, &mut solver, d, "tcp", NetworkScope::Wan);
    assert!(request(&book, &mut solver, d).is_none());
    assert!(book.violations(true).is_empty());
}

#[test]
fn delete_switches_or_disconnects() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    let first = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    let second = add(&book, &mut solver, peer, "udp", NetworkScope::Lan);
    assert_eq!(request(&book, &mut solver, peer).unwrap().id, first.id);
    book.take_notifications();

    solver.address_delete(first.id, false).unwrap();
    book.remove_address(first.id);
    let notifications = book.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].id, second.id);
    assert!(notifications[0].active);

    solver.address_delete(second.id, false).unwrap();
    let notifications = book.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].assignment(), (false, 0, 0));
    book.remove_address(second.id);

    assert!(solver.get_preferred_address(peer).unwrap().is_none());
    assert_eq!(solver.address_counts(), (0, 0));
}

#[test]
fn session_loss_keeps_candidate() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");
    book.take_notifications();

    solver.address_delete(address.id, true).unwrap();
    let notifications = book.take_notifications();
    // deactivated, then picked again as the only candidate
    assert_eq!(notifications.first().map(|a| a.active), Some(false));
    assert_eq!(notifications.last().map(|a| a.assignment()), Some((true, 100_000, 100_000)));
    assert_eq!(solver.address_counts(), (1, 1));
}

#[test]
fn network_change_moves_bandwidth() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000).with_quota(NetworkScope::Lan, 50_000, 50_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let (a, b) = (PeerId(1), PeerId(2));
    let moving = add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    let staying = add(&book, &mut solver, b, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, a);
    request(&book, &mut solver, b);
    book.take_info();

    book.set_scope(moving.id, NetworkScope::Lan);
    solver.address_change_network(moving.id, NetworkScope::Lan).unwrap();

    let moved = book.address(moving.id).unwrap();
    assert_eq!(moved.scope, NetworkScope::Lan);
    assert_eq!(moved.assignment(), (true, 50_000, 50_000));
    assert_eq!(book.address(staying.id).unwrap().assigned_bw_in, 100_000);
    assert!(book.violations(true).is_empty());

    // the whole move is one bulk operation ending in a full redistribution
    let info = book.take_info();
    assert_eq!(solve_starts(&info), 1);
    assert!(info
        .iter()
        .any(|e| e.op == Operation::SolveStart && e.detail == InfoDetail::PropAll));
}

#[test]
fn stop_releases_bandwidth() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);
    let mut solver = ProportionalSolver::new(book.clone(), quotas, options()).unwrap();

    let (a, b) = (PeerId(1), PeerId(2));
    add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    let addr_b = add(&book, &mut solver, b, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, a);
    request(&book, &mut solver, b);
    book.take_notifications();

    solver.stop_get_preferred_address(a).unwrap();
    book.release_peer(a);

    // no notification for the stopped peer, the other one gets the whole quota
    let notifications = book.take_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].id, addr_b.id);
    assert_eq!(notifications[0].assigned_bw_in, 100_000);
    assert!(book.violations(true).is_empty());

    assert!(matches!(
        solver.stop_get_preferred_address(a),
        Err(SolverError::NoPendingRequest(_))
    ));
}

#[test]
fn invalid_options() {
    let quotas = Quotas::uniform(100_000, 100_000);
    let book = book(&quotas);

    let err = ProportionalSolver::new(
        book.clone(),
        quotas.clone(),
        options().with_stability_factor(2.5),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::OutOfRange { name: "stability_factor", .. }));

    let err = ProportionalSolver::new(
        book.clone(),
        quotas.clone(),
        options().with_proportionality_factor(0.5),
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::OutOfRange { name: "proportionality_factor", .. }));

    let err = ProportionalSolver::new(book, quotas, options().with_min_bw(200_000)).unwrap_err();
    assert!(matches!(err, ConfigError::QuotaTooSmall { required: 200_000, .. }));
}
