//! The contract between an address bookkeeping service and a bandwidth allocation solver.
//!
//! The bookkeeping service owns [`Address`] records and drives a [`Solver`] through the
//! operations below. The solver reads preferences and quality values through an
//! [`Environment`] and reports every assignment change back through it.

use std::{sync::Arc, time::Duration};

mod address;
mod bulk;
mod error;
mod info;
mod kinds;
mod quota;

pub use address::*;
pub use bulk::BulkLock;
pub use error::*;
pub use info::*;
pub use kinds::*;
pub use quota::*;

/// Callbacks and read-only accessors a solver uses to talk to its surroundings.
///
/// Implementations must not call back into the solver from any of these methods.
pub trait Environment: Send + Sync + 'static {
    /// Called at most once per actual change of `(active, bw_in, bw_out)` of an address
    /// belonging to a peer with a pending request.
    fn bandwidth_changed(&self, address: &Address);

    /// Observability hook around solve phases.
    fn info(&self, _op: Operation, _status: Status, _detail: InfoDetail) {}

    /// Normalized preferences of `peer`.
    fn preferences(&self, peer: &PeerId) -> Preferences;

    /// Normalized quality values of `address`.
    fn properties(&self, address: AddressId) -> Properties;

    /// Connectivity requirement of `peer`, 0 if no address is desired.
    fn connectivity(&self, peer: &PeerId) -> u32;
}

impl<E: Environment> Environment for Arc<E> {
    fn bandwidth_changed(&self, address: &Address) {
        (**self).bandwidth_changed(address)
    }

    fn info(&self, op: Operation, status: Status, detail: InfoDetail) {
        (**self).info(op, status, detail)
    }

    fn preferences(&self, peer: &PeerId) -> Preferences {
        (**self).preferences(peer)
    }

    fn properties(&self, address: AddressId) -> Properties {
        (**self).properties(address)
    }

    fn connectivity(&self, peer: &PeerId) -> u32 {
        (**self).connectivity(peer)
    }
}

/// A bandwidth allocation strategy.
///
/// All operations run to completion on the calling context. Implementations keep their own
/// copy of every registered address and only ever notify about peers with a pending request.
pub trait Solver: std::fmt::Debug + Send {
    /// Short name of the strategy.
    fn name(&self) -> &'static str;

    /// Registers a new address. May solve if the peer has a pending request.
    fn address_add(&mut self, address: &Address, scope: NetworkScope) -> Result<(), SolverError>;

    /// Removes an address. With `session_only` the address stays a candidate but loses its
    /// session, so it is deactivated if it was in use.
    fn address_delete(&mut self, address: AddressId, session_only: bool)
        -> Result<(), SolverError>;

    /// A property of an address changed.
    fn address_property_changed(
        &mut self,
        address: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) -> Result<(), SolverError>;

    /// An address moved to another network scope.
    fn address_change_network(
        &mut self,
        address: AddressId,
        scope: NetworkScope,
    ) -> Result<(), SolverError>;

    /// Registers a pending request for `peer` and returns the address currently suggested.
    /// Future changes are reported through [`Environment::bandwidth_changed`].
    fn get_preferred_address(&mut self, peer: PeerId) -> Result<Option<Address>, SolverError>;

    /// Removes the pending request for `peer` and deactivates whatever served it.
    fn stop_get_preferred_address(&mut self, peer: PeerId) -> Result<(), SolverError>;

    /// A preference of `peer` changed.
    fn change_preference(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        rel_value: f64,
    ) -> Result<(), SolverError>;

    /// Application feedback about the quality of the current assignment for `peer`.
    fn feedback(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        scope: Duration,
        score: f64,
    ) -> Result<(), SolverError>;

    fn bulk_start(&mut self);

    fn bulk_stop(&mut self) -> Result<(), SolverError>;

    /// Runs a solve now, unless a bulk operation is in progress.
    fn solve(&mut self) -> Result<(), SolverError>;
}
