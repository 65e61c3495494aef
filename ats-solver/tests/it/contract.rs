use ats_env::{NetworkScope, PeerId, PreferenceKind, PropertyKind, Quotas, SolverError};
use ats_solver::{build_solver, MlpOptions, ProportionalOptions, RilOptions, SolverConfig, SolverKind};

use crate::helpers::{add, book, request, solve_starts};

fn quotas() -> Quotas {
    Quotas::uniform(64 * 1024, 64 * 1024)
}

fn config(kind: SolverKind) -> SolverConfig {
    match kind {
        SolverKind::Mlp => MlpOptions::default().with_n_min(1).into(),
        SolverKind::Proportional => ProportionalOptions::default().into(),
        SolverKind::Ril => RilOptions::default().with_seed(1).with_simulate(true).into(),
    }
}

#[test]
fn nested_bulk_solves_once() {
    let _ = tracing_subscriber::fmt::try_init();

    for kind in SolverKind::ALL {
        let quotas = quotas();
        let book = book(&quotas);
        let mut solver = build_solver(book.clone(), quotas, config(kind)).unwrap();

        let peer = PeerId(1);
        add(&book, solver.as_mut(), peer, "tcp", NetworkScope::Wan);
        request(&book, solver.as_mut(), peer);
        book.take_info();

        solver.bulk_start();
        solver.bulk_start();
        solver.bulk_start();

        add(&book, solver.as_mut(), peer, "udp", NetworkScope::Lan);
        book.set_preference(peer, PreferenceKind::Bandwidth, 0.5);
        solver.change_preference(peer, PreferenceKind::Bandwidth, 0.5).unwrap();
        solver.solve().unwrap();

        solver.bulk_stop().unwrap();
        solver.bulk_stop().unwrap();
        assert_eq!(solve_starts(&book.take_info()), 0, "{kind} solved inside a bulk operation");

        solver.bulk_stop().unwrap();
        assert_eq!(solve_starts(&book.take_info()), 1, "{kind} did not solve exactly once");

        assert!(
            matches!(solver.bulk_stop(), Err(SolverError::BulkUnderflow)),
            "{kind} accepted an unmatched bulk stop"
        );
    }
}

#[test]
fn bulk_without_changes_is_quiet() {
    let _ = tracing_subscriber::fmt::try_init();

    for kind in SolverKind::ALL {
        let quotas = quotas();
        let book = book(&quotas);
        let mut solver = build_solver(book.clone(), quotas, config(kind)).unwrap();

        solver.bulk_start();
        solver.bulk_stop().unwrap();
        assert_eq!(solve_starts(&book.take_info()), 0, "{kind}");
    }
}

#[test]
fn usage_errors() {
    let _ = tracing_subscriber::fmt::try_init();

    for kind in SolverKind::ALL {
        let quotas = quotas();
        let book = book(&quotas);
        let mut solver = build_solver(book.clone(), quotas, config(kind)).unwrap();

        let peer = PeerId(7);
        assert!(matches!(
            solver.stop_get_preferred_address(peer),
            Err(SolverError::NoPendingRequest(p)) if p == peer
        ));

        let address = add(&book, solver.as_mut(), peer, "tcp", NetworkScope::Wan);
        assert!(matches!(
            solver.address_add(&address, NetworkScope::Wan),
            Err(SolverError::DuplicateAddress(id)) if id == address.id
        ));

        let unknown = book.create_address(peer, "udp", NetworkScope::Wan);
        assert!(matches!(
            solver.address_delete(unknown.id, false),
            Err(SolverError::UnknownAddress(_))
        ));
        assert!(matches!(
            solver.address_property_changed(unknown.id, PropertyKind::Delay, 10, 0.5),
            Err(SolverError::UnknownAddress(_))
        ));
        assert!(matches!(
            solver.address_change_network(unknown.id, NetworkScope::Lan),
            Err(SolverError::UnknownAddress(_))
        ));

        request(&book, solver.as_mut(), peer);
        solver.stop_get_preferred_address(peer).unwrap();
        book.release_peer(peer);
        assert!(matches!(
            solver.stop_get_preferred_address(peer),
            Err(SolverError::NoPendingRequest(_))
        ));
    }
}

#[test]
fn allocations_stay_consistent() {
    let _ = tracing_subscriber::fmt::try_init();

    for kind in SolverKind::ALL {
        let quotas = quotas();
        let book = book(&quotas);
        let mut solver = build_solver(book.clone(), quotas, config(kind)).unwrap();
        // the learning strategy may overshoot after an admission until its next steps
        let check_quota = kind != SolverKind::Ril;

        let peers: Vec<_> = (1..=6).map(PeerId).collect();
        let mut addresses = Vec::new();
        for peer in &peers {
            addresses.push(add(&book, solver.as_mut(), *peer, "tcp", NetworkScope::Wan));
            addresses.push(add(&book, solver.as_mut(), *peer, "udp", NetworkScope::Wlan));
        }

        for peer in &peers {
            request(&book, solver.as_mut(), *peer);
            assert_eq!(book.violations(check_quota), vec![], "{kind} after request of {peer}");
        }

        for _ in 0..5 {
            solver.solve().unwrap();
            assert_eq!(book.violations(check_quota), vec![], "{kind} after solve");
        }

        // unrequested peers are never notified
        let idle = PeerId(99);
        add(&book, solver.as_mut(), idle, "tcp", NetworkScope::Wan);
        solver.solve().unwrap();

        let released = peers[0];
        solver.stop_get_preferred_address(released).unwrap();
        book.release_peer(released);
        solver.solve().unwrap();
        assert_eq!(book.violations(check_quota), vec![], "{kind} after release");
        assert!(book.active_addresses(released).is_empty());

        for address in book.addresses_of(peers[1]) {
            solver.address_delete(address.id, false).unwrap();
            book.remove_address(address.id);
        }
        assert_eq!(book.violations(check_quota), vec![], "{kind} after delete");
        assert!(book.active_addresses(peers[1]).is_empty());
    }
}
