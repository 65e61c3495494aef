//! Proportional solver.
//!
//! Per network scope every active address gets the minimum bandwidth, the rest of the quota
//! is split proportionally to `1 + k·preference`. Which address of a peer is active is decided
//! separately, with hysteresis against address flapping.

use std::{fmt, sync::Arc, time::Duration};

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use ats_common::constants::DEFAULT_BW_IN_OUT;
use ats_env::{
    Address, AddressId, BulkLock, ConfigError, Environment, InfoDetail, NetworkScope, Operation,
    PeerId, PreferenceKind, PropertyKind, Quotas, Solver, SolverError, Status,
};

use crate::stats::SolverStats;

mod network;
mod select;

use network::{Network, Overcommitted};
use select::Candidate;

#[derive(Debug, Clone)]
pub struct ProportionalOptions {
    /// Bandwidth every active address gets before the proportional split.
    pub min_bw: u32,
    /// Hysteresis factor in `[1, 2]`: minimum activation time in seconds and the improvement
    /// ratio required to replace an active address.
    pub stability_factor: f64,
    /// Weight `k` of preferences in the split, at least 1.
    pub proportionality_factor: f64,
    /// Cap on the chain of displacements a single activation may cause.
    pub max_reactivations: usize,
}

impl ProportionalOptions {
    pub fn with_min_bw(mut self, min_bw: u32) -> Self {
        self.min_bw = min_bw;
        self
    }

    pub fn with_stability_factor(mut self, stability_factor: f64) -> Self {
        self.stability_factor = stability_factor;
        self
    }

    pub fn with_proportionality_factor(mut self, factor: f64) -> Self {
        self.proportionality_factor = factor;
        self
    }

    pub fn with_max_reactivations(mut self, max_reactivations: usize) -> Self {
        self.max_reactivations = max_reactivations;
        self
    }

    fn validate(&self, quotas: &Quotas) -> Result<(), ConfigError> {
        if !(1.0..=2.0).contains(&self.stability_factor) {
            return Err(ConfigError::OutOfRange {
                name: "stability_factor",
                value: self.stability_factor,
                min: 1.0,
                max: 2.0,
            });
        }
        if !(self.proportionality_factor >= 1.0) {
            return Err(ConfigError::OutOfRange {
                name: "proportionality_factor",
                value: self.proportionality_factor,
                min: 1.0,
                max: f64::INFINITY,
            });
        }
        if self.min_bw == 0 {
            return Err(ConfigError::Zero { name: "min_bw" });
        }

        for (scope, quota) in quotas.iter() {
            if quota.min() < self.min_bw as u64 {
                return Err(ConfigError::QuotaTooSmall {
                    scope,
                    quota: quota.min(),
                    required: self.min_bw as u64,
                });
            }
        }
        Ok(())
    }
}

impl Default for ProportionalOptions {
    fn default() -> Self {
        Self {
            min_bw: DEFAULT_BW_IN_OUT,
            stability_factor: 1.25,
            proportionality_factor: 2.0,
            max_reactivations: 16,
        }
    }
}

#[derive(Debug)]
struct PropAddress {
    address: Address,
    activated: Option<Instant>,
    /// Last `(active, bw_in, bw_out)` reported to the environment.
    reported: (bool, u32, u32),
}

pub struct ProportionalSolver<E> {
    env: Arc<E>,
    options: ProportionalOptions,
    networks: Vec<Network>,
    addresses: FxHashMap<AddressId, PropAddress>,
    peers: FxHashMap<PeerId, Vec<AddressId>>,
    requests: FxHashSet<PeerId>,
    bulk: BulkLock,
    stats: SolverStats,
}

impl<E> fmt::Debug for ProportionalSolver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProportionalSolver")
            .field("options", &self.options)
            .field("networks", &self.networks)
            .field("requests", &self.requests.len())
            .field("bulk", &self.bulk)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> ProportionalSolver<E> {
    pub fn new(
        env: Arc<E>,
        quotas: Quotas,
        options: ProportionalOptions,
    ) -> Result<Self, ConfigError> {
        options.validate(&quotas)?;
        for (scope, quota) in quotas.iter() {
            debug!(%scope, inbound = quota.inbound, outbound = quota.outbound, "scope quota");
        }
        info!(
            min_bw = options.min_bw,
            stability_factor = options.stability_factor,
            proportionality_factor = options.proportionality_factor,
            "proportional solver initialized"
        );

        Ok(Self {
            env,
            networks: quotas.iter().map(|(_, quota)| Network::new(quota)).collect(),
            options,
            addresses: FxHashMap::default(),
            peers: FxHashMap::default(),
            requests: FxHashSet::default(),
            bulk: BulkLock::default(),
            stats: SolverStats::default(),
        })
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    /// Total and active address counts.
    pub fn address_counts(&self) -> (usize, usize) {
        let active = self.networks.iter().map(|n| n.active).sum();
        (self.addresses.len(), active)
    }

    fn network(&mut self, scope: NetworkScope) -> &mut Network {
        &mut self.networks[scope.index()]
    }

    fn active_address(&self, peer: PeerId) -> Option<AddressId> {
        self.peers
            .get(&peer)?
            .iter()
            .copied()
            .find(|id| self.addresses.get(id).is_some_and(|a| a.address.active))
    }

    /// Whether every other peer with an active address in `scope` has at least connectivity
    /// `connectivity`, i.e. nobody could be displaced in favour of `peer`.
    fn all_require_connectivity(&self, scope: NetworkScope, peer: PeerId, connectivity: u32) -> bool {
        self.networks[scope.index()]
            .addresses
            .iter()
            .filter_map(|id| self.addresses.get(id))
            .filter(|a| a.address.active && a.address.peer != peer)
            .all(|a| self.env.connectivity(&a.address.peer) >= connectivity)
    }

    fn find_best_address(&self, peer: PeerId) -> Option<AddressId> {
        let connectivity = self.env.connectivity(&peer);
        let now = Instant::now();

        let candidates: Vec<_> = self
            .peers
            .get(&peer)
            .into_iter()
            .flatten()
            .filter_map(|id| self.addresses.get(id))
            .map(|a| {
                let scope = a.address.scope;
                let need = usize::from(!a.address.active);
                let available =
                    self.networks[scope.index()].is_bandwidth_available(need, self.options.min_bw);
                let eligible =
                    available || !self.all_require_connectivity(scope, peer, connectivity);
                let properties = self.env.properties(a.address.id);
                Candidate {
                    id: a.address.id,
                    active: a.address.active,
                    active_for: a.activated.map(|t| now.saturating_duration_since(t)),
                    eligible,
                    delay: properties[PropertyKind::Delay.quality_index().unwrap_or(0)],
                    distance: properties[PropertyKind::Distance.quality_index().unwrap_or(1)],
                }
            })
            .collect();

        select::find_best(&candidates, self.options.stability_factor)
    }

    /// Reports the current state of an address if it differs from what was reported last.
    fn report(&mut self, id: AddressId) {
        let Some(entry) = self.addresses.get_mut(&id) else {
            return;
        };
        let current = entry.address.assignment();
        if current == entry.reported || !self.requests.contains(&entry.address.peer) {
            return;
        }
        entry.reported = current;
        self.env.bandwidth_changed(&entry.address);
        self.stats.increment_notifications();
    }

    /// Marks an address inactive and updates the scope counter. Returns its scope if it was
    /// active.
    fn deactivate(&mut self, id: AddressId) -> Option<NetworkScope> {
        let entry = self.addresses.get_mut(&id)?;
        if !entry.address.active {
            return None;
        }
        entry.address.deactivate();
        entry.activated = None;
        let scope = entry.address.scope;
        let net = self.network(scope);
        net.active = net.active.saturating_sub(1);
        Some(scope)
    }

    /// Picks the lowest-connectivity active address in `scope` of a peer with connectivity
    /// below `connectivity`, excluding `keep`.
    fn displacement_victim(
        &self,
        scope: NetworkScope,
        keep: AddressId,
        connectivity: u32,
    ) -> Option<AddressId> {
        self.networks[scope.index()]
            .addresses
            .iter()
            .filter(|id| **id != keep)
            .filter_map(|id| self.addresses.get(id))
            .filter(|a| a.address.active)
            .map(|a| (self.env.connectivity(&a.address.peer), a.address.id))
            .filter(|(c, _)| *c < connectivity)
            .min()
            .map(|(_, id)| id)
    }

    /// Switches the active address of `peer` to the best candidate, displacing lower
    /// connectivity peers from a full scope. Returns the new active address.
    fn update_active_address(
        &mut self,
        peer: PeerId,
        depth: usize,
    ) -> Result<Option<AddressId>, SolverError> {
        if depth > self.options.max_reactivations {
            error!(%peer, depth, "address reactivation does not settle");
            return Err(ConfigError::ReactivationLimit(self.options.max_reactivations).into());
        }

        let current = self.active_address(peer);
        let best = self.find_best_address(peer);
        debug!(%peer, ?current, ?best, depth, "updating active address");

        if let Some(current) = current.filter(|c| Some(*c) != best) {
            if let Some(scope) = self.deactivate(current) {
                debug!(%peer, id = %current, "disabling previous address");
                self.report(current);
                self.distribute(scope);
            }
        }

        let Some(best) = best else {
            debug!(%peer, "cannot suggest an address");
            return Ok(None);
        };
        if current == Some(best) {
            return Ok(Some(best));
        }

        let Some(entry) = self.addresses.get_mut(&best) else {
            return Ok(None);
        };
        entry.address.active = true;
        entry.activated = Some(Instant::now());
        let scope = entry.address.scope;
        self.network(scope).active += 1;
        debug!(%peer, id = %best, %scope, "address is now active");

        if !self.networks[scope.index()].is_bandwidth_available(0, self.options.min_bw) {
            let connectivity = self.env.connectivity(&peer);
            if let Some(victim) = self.displacement_victim(scope, best, connectivity) {
                let victim_peer = self.addresses[&victim].address.peer;
                info!(%peer, %victim_peer, %scope, "scope full, displacing lower priority address");
                self.deactivate(victim);
                self.report(victim);
                self.update_active_address(victim_peer, depth + 1)?;
            }
        }

        self.distribute(scope);
        Ok(Some(best))
    }

    /// Recomputes and propagates the bandwidth of one scope.
    fn distribute(&mut self, scope: NetworkScope) {
        if !self.bulk.record_change() {
            return;
        }

        let span = tracing::debug_span!("proportional_distribute", %scope);
        let _enter = span.enter();

        self.stats.increment_solves();
        self.env.info(Operation::SolveStart, Status::Success, InfoDetail::PropSingle);
        let ok = self.compute(scope);
        self.env.info(Operation::SolveStop, Status::from_ok(ok), InfoDetail::PropSingle);

        if !ok {
            self.stats.increment_failed();
            return;
        }

        self.env.info(Operation::UpdateNotifyStart, Status::Success, InfoDetail::PropSingle);
        self.propagate(scope);
        self.env.info(Operation::UpdateNotifyStop, Status::Success, InfoDetail::PropSingle);
    }

    /// Recomputes and propagates the bandwidth of all scopes.
    fn distribute_all(&mut self) {
        let span = tracing::debug_span!("proportional_distribute", scope = "all");
        let _enter = span.enter();

        self.stats.increment_solves();
        self.env.info(Operation::SolveStart, Status::Success, InfoDetail::PropAll);
        let mut ok = true;
        for scope in NetworkScope::ALL {
            ok &= self.compute(scope);
        }
        self.env.info(Operation::SolveStop, Status::from_ok(ok), InfoDetail::PropAll);
        if !ok {
            self.stats.increment_failed();
        }

        self.env.info(Operation::UpdateNotifyStart, Status::Success, InfoDetail::PropAll);
        for scope in NetworkScope::ALL {
            self.propagate(scope);
        }
        self.env.info(Operation::UpdateNotifyStop, Status::Success, InfoDetail::PropAll);
    }

    /// Computes the share of every active address in `scope` and stores it on the address.
    /// Returns `false` if the scope quota cannot hold the minimum bandwidth.
    fn compute(&mut self, scope: NetworkScope) -> bool {
        let net = &self.networks[scope.index()];
        let active: Vec<_> = net
            .addresses
            .iter()
            .filter_map(|id| self.addresses.get(id))
            .filter(|a| a.address.active)
            .map(|a| {
                let preference = self.env.preferences(&a.address.peer)[PreferenceKind::Bandwidth.index()];
                (a.address.id, preference)
            })
            .collect();

        if active.len() != net.active {
            warn!(%scope, counted = active.len(), expected = net.active, "active address count mismatch");
        }
        debug!(%scope, active = active.len(), quota_in = net.quota.inbound, quota_out = net.quota.outbound, "recalculating quota");

        match network::distribute(
            &active,
            net.quota,
            self.options.min_bw,
            self.options.proportionality_factor,
        ) {
            Ok(shares) => {
                for share in shares {
                    if let Some(entry) = self.addresses.get_mut(&share.id) {
                        entry.address.assign(true, share.bw_in, share.bw_out);
                    }
                }
                true
            }
            Err(Overcommitted { active, required }) => {
                error!(%scope, active, required, quota = ?net.quota, "quota below minimum bandwidth of active addresses");
                false
            }
        }
    }

    fn propagate(&mut self, scope: NetworkScope) {
        let ids = self.networks[scope.index()].addresses.clone();
        for id in ids {
            self.report(id);
        }
    }

    /// Keeps or switches the address of a requesting peer; if the address stayed the same its
    /// scope is redistributed.
    fn refresh_peer(&mut self, peer: PeerId) -> Result<(), SolverError> {
        let previous = self.active_address(peer);
        let best = self.update_active_address(peer, 0)?;
        if let Some(best) = best.filter(|b| previous == Some(*b)) {
            let scope = self.addresses[&best].address.scope;
            self.distribute(scope);
        }
        Ok(())
    }

    /// Reports a disconnect for a peer that lost its active address without replacement.
    fn disconnect(&mut self, mut address: Address) {
        address.deactivate();
        debug!(peer = %address.peer, id = %address.id, "no alternative address, disconnecting");
        self.env.bandwidth_changed(&address);
        self.stats.increment_notifications();
    }
}

impl<E: Environment> Solver for ProportionalSolver<E> {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn address_add(&mut self, address: &Address, scope: NetworkScope) -> Result<(), SolverError> {
        if self.addresses.contains_key(&address.id) {
            return Err(SolverError::DuplicateAddress(address.id));
        }

        let mut address = address.clone();
        address.scope = scope;
        address.deactivate();
        let (id, peer) = (address.id, address.peer);

        self.addresses.insert(id, PropAddress { address, activated: None, reported: (false, 0, 0) });
        self.peers.entry(peer).or_default().push(id);
        self.network(scope).addresses.push(id);
        let (total, active) = self.address_counts();
        debug!(%id, %peer, %scope, total, active, "address added");

        if self.requests.contains(&peer) {
            self.update_active_address(peer, 0)?;
        }
        Ok(())
    }

    fn address_delete(&mut self, id: AddressId, session_only: bool) -> Result<(), SolverError> {
        let Some(entry) = self.addresses.get(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let (peer, scope) = (entry.address.peer, entry.address.scope);
        let snapshot = entry.address.clone();
        let was_active = entry.address.active;
        debug!(%id, %peer, session_only, was_active, "deleting address");

        let scope_changed = self.deactivate(id).is_some();

        if session_only {
            self.report(id);
        } else {
            self.addresses.remove(&id);
            self.network(scope).remove(id);
            if let Some(ids) = self.peers.get_mut(&peer) {
                ids.retain(|a| *a != id);
                if ids.is_empty() {
                    self.peers.remove(&peer);
                }
            }
        }

        if scope_changed {
            self.distribute(scope);
        }

        if was_active && self.requests.contains(&peer) {
            let replacement = self.update_active_address(peer, 0)?;
            if replacement.is_none() && !session_only {
                self.disconnect(snapshot);
            }
        }
        Ok(())
    }

    fn address_property_changed(
        &mut self,
        id: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        let Some(entry) = self.addresses.get(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let peer = entry.address.peer;
        debug!(%id, %peer, %kind, abs_value, rel_value, "property changed");

        if kind.quality_index().is_none() || !self.requests.contains(&peer) {
            return Ok(());
        }
        self.refresh_peer(peer)
    }

    fn address_change_network(
        &mut self,
        id: AddressId,
        scope: NetworkScope,
    ) -> Result<(), SolverError> {
        let Some(entry) = self.addresses.get(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let (peer, old) = (entry.address.peer, entry.address.scope);
        if old == scope {
            return Ok(());
        }
        let was_active = entry.address.active;
        debug!(%id, %peer, from = %old, to = %scope, was_active, "address changed network");

        self.bulk.start();
        self.deactivate(id);
        self.report(id);
        self.network(old).remove(id);
        self.network(scope).addresses.push(id);
        if let Some(entry) = self.addresses.get_mut(&id) {
            entry.address.scope = scope;
        }
        self.distribute(old);
        let result = if was_active && self.requests.contains(&peer) {
            self.update_active_address(peer, 0).map(|_| ())
        } else {
            Ok(())
        };
        if self.bulk.stop()? {
            self.distribute_all();
        }
        result
    }

    fn get_preferred_address(&mut self, peer: PeerId) -> Result<Option<Address>, SolverError> {
        if self.requests.insert(peer) {
            debug!(%peer, "new address request");
        }

        let best = self.update_active_address(peer, 0)?;
        Ok(best.and_then(|id| self.addresses.get(&id)).map(|a| a.address.clone()))
    }

    fn stop_get_preferred_address(&mut self, peer: PeerId) -> Result<(), SolverError> {
        if !self.requests.remove(&peer) {
            return Err(SolverError::NoPendingRequest(peer));
        }
        debug!(%peer, "address request stopped");

        let Some(current) = self.active_address(peer) else {
            return Ok(());
        };
        if let Some(scope) = self.deactivate(current) {
            if let Some(entry) = self.addresses.get_mut(&current) {
                entry.reported = (false, 0, 0);
            }
            self.distribute(scope);
        }
        Ok(())
    }

    fn change_preference(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        debug!(%peer, %kind, rel_value, "preference changed");
        if !self.requests.contains(&peer) {
            return Ok(());
        }
        self.refresh_peer(peer)
    }

    fn feedback(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        scope: Duration,
        score: f64,
    ) -> Result<(), SolverError> {
        debug!(%peer, %kind, ?scope, score, "feedback ignored");
        Ok(())
    }

    fn bulk_start(&mut self) {
        self.bulk.start();
        debug!(depth = self.bulk.depth(), "bulk start");
    }

    fn bulk_stop(&mut self) -> Result<(), SolverError> {
        if self.bulk.stop()? {
            self.distribute_all();
        }
        Ok(())
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        if self.bulk.record_change() {
            self.distribute_all();
        }
        Ok(())
    }
}
