mod contract;
mod mlp;
mod proportional;
mod ril;

/// Helper functions.
mod helpers {
    use std::sync::Arc;

    use ats_env::{Address, InfoDetail, NetworkScope, Operation, PeerId, Quotas, Solver, Status};
    use ats_sim::{AddressBook, InfoEvent};

    pub fn book(quotas: &Quotas) -> Arc<AddressBook> {
        Arc::new(AddressBook::new(quotas.clone()))
    }

    /// Creates an address in the book and registers it with the solver.
    pub fn add(
        book: &AddressBook,
        solver: &mut dyn Solver,
        peer: PeerId,
        plugin: &str,
        scope: NetworkScope,
    ) -> Address {
        let address = book.create_address(peer, plugin, scope);
        solver.address_add(&address, scope).unwrap();
        address
    }

    /// Marks `peer` as requested, asks the solver for an address and stores the answer.
    pub fn request(book: &AddressBook, solver: &mut dyn Solver, peer: PeerId) -> Option<Address> {
        book.request_peer(peer);
        let address = solver.get_preferred_address(peer).unwrap();
        if let Some(address) = &address {
            book.apply(address);
        }
        address
    }

    pub fn solve_starts(events: &[InfoEvent]) -> usize {
        events.iter().filter(|e| e.op == Operation::SolveStart).count()
    }

    /// The status and detail of the last solve stop event.
    pub fn last_stop(events: &[InfoEvent]) -> Option<(Status, InfoDetail)> {
        events.iter().rev().find(|e| e.op == Operation::SolveStop).map(|e| (e.status, e.detail))
    }
}
