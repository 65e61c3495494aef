use std::time::Duration;

use ats_env::{InfoDetail, NetworkScope, PeerId, PropertyKind, Quotas, Solver, SolverError, Status};
use ats_solver::{
    mlp::{DumpFormat, DumpOptions},
    MlpOptions, MlpSolver,
};

use crate::helpers::{add, book, last_stop, request, solve_starts};

fn options() -> MlpOptions {
    MlpOptions::default().with_b_min(1024).with_n_min(1)
}

#[test]
fn single_address_is_selected() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    let selected = request(&book, &mut solver, peer).expect("an address");

    assert_eq!(selected.id, address.id);
    assert!(selected.active);
    assert!((1024..=10_000).contains(&selected.assigned_bw_in));
    assert_eq!(selected.assigned_bw_in, selected.assigned_bw_out);
    assert_eq!(last_stop(&book.take_info()), Some((Status::Success, InfoDetail::Full)));

    // the requesting peer learns its address from the return value only
    assert_eq!(book.notification_count(), 0);
    assert!(book.violations(true).is_empty());

    let report = solver.last_report().expect("a report");
    assert!(report.rebuilt);
    assert!(report.rows > 0 && report.columns > 0);
    assert_eq!(solver.stats().solves(), 1);
}

#[test]
fn unchanged_problem_is_not_solved_again() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer);
    book.take_info();
    book.take_notifications();

    solver.solve().unwrap();
    let info = book.take_info();
    assert_eq!(solve_starts(&info), 1);
    assert_eq!(last_stop(&info), Some((Status::Success, InfoDetail::None)));
    assert!(book.take_notifications().is_empty());
}

#[test]
fn peers_share_a_scope() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let (a, b) = (PeerId(1), PeerId(2));
    add(&book, &mut solver, a, "tcp", NetworkScope::Wan);
    add(&book, &mut solver, b, "tcp", NetworkScope::Wan);

    request(&book, &mut solver, a);
    request(&book, &mut solver, b);

    assert_eq!(book.active_addresses(a).len(), 1);
    assert_eq!(book.active_addresses(b).len(), 1);
    let (used_in, used_out) = book.scope_usage(NetworkScope::Wan);
    assert!(used_in <= 10_000 && used_out <= 10_000);
    assert!(used_in >= 2 * 1024);
    assert!(book.violations(true).is_empty());
}

#[test]
fn deleting_the_only_address_disconnects() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(3);
    let address = add(&book, &mut solver, peer, "tcp", NetworkScope::Lan);
    request(&book, &mut solver, peer).expect("an address");

    solver.address_delete(address.id, false).unwrap();
    let notifications = book.take_notifications();
    let last = notifications.last().expect("a disconnect");
    assert_eq!(last.id, address.id);
    assert!(!last.active);
    assert_eq!(last.assignment(), (false, 0, 0));
    assert!(book.violations(true).is_empty());
}

#[test]
fn quality_update_patches_the_problem() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let peer = PeerId(1);
    let first = add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    add(&book, &mut solver, peer, "udp", NetworkScope::Lan);
    request(&book, &mut solver, peer);
    assert_eq!(solver.stats().rebuilds(), 1);

    let value = book.set_property(first.id, PropertyKind::Delay, 0.25);
    solver.address_property_changed(first.id, PropertyKind::Delay, 25, value).unwrap();

    assert_eq!(solver.stats().updates(), 1);
    assert_eq!(solver.stats().rebuilds(), 1);
    let report = solver.last_report().expect("a report");
    assert!(!report.rebuilt);
    assert_eq!(last_stop(&book.take_info()), Some((Status::Success, InfoDetail::Updated)));
    assert!(book.violations(true).is_empty());
}

#[test]
fn failed_solve_keeps_addresses_inactive() {
    let _ = tracing_subscriber::fmt::try_init();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let mut solver =
        MlpSolver::new(book.clone(), quotas, options().with_max_duration(Duration::ZERO)).unwrap();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);

    // an implicit solve only logs the failure
    assert!(request(&book, &mut solver, peer).is_none());
    assert_eq!(last_stop(&book.take_info()), Some((Status::Fail, InfoDetail::Full)));

    // the problem stays marked as updated, so an explicit solve retries and reports
    let err = solver.solve().unwrap_err();
    assert!(matches!(err, SolverError::SolveFailed(_)));
    assert!(err.to_string().contains("Time limit"), "{err}");
    assert_eq!(last_stop(&book.take_info()), Some((Status::Fail, InfoDetail::Updated)));

    assert_eq!(solver.stats().solves_failed(), 2);
    assert!(book.active_addresses(peer).is_empty());
    assert!(book.take_notifications().is_empty());
}

#[test]
fn infeasible_request_keeps_previous_assignment() {
    let _ = tracing_subscriber::fmt::try_init();

    // four peers fit with the minimum bandwidth, a fifth does not
    let quotas = Quotas::uniform(5_000, 5_000);
    let book = book(&quotas);
    let mut solver = MlpSolver::new(book.clone(), quotas, options()).unwrap();

    let peers: Vec<_> = (1..=4).map(PeerId).collect();
    let addresses: Vec<_> =
        peers.iter().map(|peer| add(&book, &mut solver, *peer, "tcp", NetworkScope::Wan)).collect();
    for peer in &peers {
        request(&book, &mut solver, *peer).expect("room for the minimum");
    }
    book.take_notifications();
    book.take_info();

    let before: Vec<_> =
        addresses.iter().map(|a| book.address(a.id).unwrap().assignment()).collect();
    assert!(before.iter().all(|(active, bw_in, _)| *active && *bw_in >= 1024));

    let late = PeerId(5);
    let late_address = add(&book, &mut solver, late, "tcp", NetworkScope::Wan);
    assert!(request(&book, &mut solver, late).is_none());
    assert_eq!(last_stop(&book.take_info()), Some((Status::Fail, InfoDetail::Full)));

    let after: Vec<_> =
        addresses.iter().map(|a| book.address(a.id).unwrap().assignment()).collect();
    assert_eq!(after, before);
    assert!(!book.address(late_address.id).unwrap().active);
    assert!(book.take_notifications().is_empty());
    assert!(book.violations(true).is_empty());
    assert_eq!(solver.stats().solves_failed(), 1);
}

#[test]
fn dumps_problem_and_solution() {
    let _ = tracing_subscriber::fmt::try_init();

    let dir = std::env::temp_dir().join(format!("ats-mlp-dump-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let quotas = Quotas::uniform(10_000, 10_000);
    let book = book(&quotas);
    let dump = DumpOptions {
        problem_all: true,
        solution_all: true,
        format: DumpFormat::Mps,
        dir: dir.clone(),
        ..Default::default()
    };
    let mut solver = MlpSolver::new(book.clone(), quotas, options().with_dump(dump)).unwrap();

    let peer = PeerId(1);
    add(&book, &mut solver, peer, "tcp", NetworkScope::Wan);
    request(&book, &mut solver, peer).expect("an address");

    let files: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(files.iter().any(|p| p.extension().is_some_and(|e| e == "mps")));
    let solution = files
        .iter()
        .find(|p| p.extension().is_some_and(|e| e == "sol"))
        .expect("a solution file");
    let text = std::fs::read_to_string(solution).unwrap();
    assert!(text.starts_with("status "));
    assert!(text.contains("n_1_tcp_"));

    std::fs::remove_dir_all(&dir).unwrap();
}
