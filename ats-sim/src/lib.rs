//! An in-memory stand-in for the address bookkeeping service.
//!
//! [`AddressBook`] owns the authoritative [`Address`] records, answers the read-only
//! accessors of [`Environment`] and records everything a solver tells it. Tests use it to
//! drive solvers and to check the allocation invariants after each step.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ats_env::{
    Address, AddressId, Environment, InfoDetail, NetworkScope, Operation, PeerId, PreferenceKind,
    Preferences, Properties, PropertyKind, Quotas, Status, DEFAULT_REL_PREFERENCE,
    DEFAULT_REL_QUALITY,
};

mod violation;
pub use violation::{Direction, Violation};

/// A phase event reported through [`Environment::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoEvent {
    pub op: Operation,
    pub status: Status,
    pub detail: InfoDetail,
}

/// Everything a solver reports, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BandwidthChanged(Address),
    Info(InfoEvent),
}

#[derive(Debug, Default)]
struct BookState {
    addresses: FxHashMap<AddressId, Address>,
    preferences: FxHashMap<PeerId, Preferences>,
    properties: FxHashMap<AddressId, Properties>,
    connectivity: FxHashMap<PeerId, u32>,
    requested: FxHashSet<PeerId>,
    notifications: Vec<Address>,
    info: Vec<InfoEvent>,
    /// Notifications for peers without a pending request.
    unrequested: Vec<AddressId>,
}

#[derive(Debug)]
pub struct AddressBook {
    quotas: Quotas,
    state: RwLock<BookState>,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl AddressBook {
    /// Creates an empty book. The quotas are only used by [`AddressBook::violations`].
    pub fn new(quotas: Quotas) -> Self {
        Self {
            quotas,
            state: RwLock::new(BookState::default()),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn quotas(&self) -> &Quotas {
        &self.quotas
    }

    /// Creates and stores a new inactive address.
    pub fn create_address(&self, peer: PeerId, plugin: &str, scope: NetworkScope) -> Address {
        let id = AddressId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let address = Address::new(id, peer, plugin, scope)
            .with_properties([DEFAULT_REL_QUALITY; ats_env::QUALITY_PROPERTIES]);

        let mut state = self.state.write();
        state.addresses.insert(id, address.clone());
        state.properties.insert(id, address.properties);
        tracing::debug!(%id, %peer, %scope, "created address");

        address
    }

    /// Removes an address and returns the last known record.
    pub fn remove_address(&self, id: AddressId) -> Option<Address> {
        let mut state = self.state.write();
        state.properties.remove(&id);
        state.addresses.remove(&id)
    }

    /// Moves an address to another scope.
    pub fn set_scope(&self, id: AddressId, scope: NetworkScope) {
        if let Some(address) = self.state.write().addresses.get_mut(&id) {
            address.scope = scope;
        }
    }

    /// Stores the assignment of an address returned by a solver rather than notified, as the
    /// result of an address request.
    pub fn apply(&self, address: &Address) {
        if let Some(stored) = self.state.write().addresses.get_mut(&address.id) {
            stored.assign(address.active, address.assigned_bw_in, address.assigned_bw_out);
        }
    }

    pub fn address(&self, id: AddressId) -> Option<Address> {
        self.state.read().addresses.get(&id).cloned()
    }

    /// All addresses of `peer`, ordered by id.
    pub fn addresses_of(&self, peer: PeerId) -> Vec<Address> {
        let state = self.state.read();
        let mut addresses: Vec<_> =
            state.addresses.values().filter(|a| a.peer == peer).cloned().collect();
        addresses.sort_by_key(|a| a.id);
        addresses
    }

    /// The active addresses of `peer`.
    pub fn active_addresses(&self, peer: PeerId) -> Vec<Address> {
        self.addresses_of(peer).into_iter().filter(|a| a.active).collect()
    }

    /// Sets a normalized quality property of an address. Returns the new relative value.
    pub fn set_property(&self, id: AddressId, kind: PropertyKind, value: f64) -> f64 {
        let Some(index) = kind.quality_index() else {
            return value;
        };

        let mut state = self.state.write();
        let props = state.properties.entry(id).or_insert([DEFAULT_REL_QUALITY; 2]);
        props[index] = value;
        let props = *props;
        if let Some(address) = state.addresses.get_mut(&id) {
            address.properties = props;
        }

        value
    }

    pub fn set_preference(&self, peer: PeerId, kind: PreferenceKind, value: f64) {
        let mut state = self.state.write();
        let prefs = state.preferences.entry(peer).or_insert([DEFAULT_REL_PREFERENCE; 2]);
        prefs[kind.index()] = value;
    }

    pub fn set_connectivity(&self, peer: PeerId, connectivity: u32) {
        self.state.write().connectivity.insert(peer, connectivity);
    }

    /// Marks `peer` as having a pending address request.
    pub fn request_peer(&self, peer: PeerId) {
        let mut state = self.state.write();
        state.requested.insert(peer);
        state.connectivity.entry(peer).or_insert(1);
    }

    /// Clears the pending request of `peer`. Solvers deactivate silently on stop, so the
    /// book resets its own records of that peer.
    pub fn release_peer(&self, peer: PeerId) {
        let mut state = self.state.write();
        state.requested.remove(&peer);
        state.connectivity.insert(peer, 0);
        for address in state.addresses.values_mut().filter(|a| a.peer == peer) {
            address.deactivate();
        }
    }

    /// Drains the recorded bandwidth notifications.
    pub fn take_notifications(&self) -> Vec<Address> {
        std::mem::take(&mut self.state.write().notifications)
    }

    pub fn notification_count(&self) -> usize {
        self.state.read().notifications.len()
    }

    /// Drains the recorded phase events.
    pub fn take_info(&self) -> Vec<InfoEvent> {
        std::mem::take(&mut self.state.write().info)
    }

    /// Returns a stream of all future events.
    pub fn subscribe(&self) -> UnboundedReceiverStream<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    fn publish(&self, event: Event) {
        self.subscribers.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Sum of assigned bandwidth `(in, out)` of the active addresses in `scope`.
    pub fn scope_usage(&self, scope: NetworkScope) -> (u64, u64) {
        self.state
            .read()
            .addresses
            .values()
            .filter(|a| a.active && a.scope == scope)
            .fold((0, 0), |(i, o), a| (i + a.assigned_bw_in as u64, o + a.assigned_bw_out as u64))
    }

    /// Checks the allocation invariants over the current records. Quota checks can be
    /// disabled for strategies that only bound usage statistically.
    pub fn violations(&self, check_quota: bool) -> Vec<Violation> {
        let state = self.state.read();
        let mut violations = Vec::new();

        let mut active_per_peer: FxHashMap<PeerId, usize> = FxHashMap::default();
        for address in state.addresses.values() {
            if address.active {
                *active_per_peer.entry(address.peer).or_default() += 1;
            } else if address.assigned_bw_in != 0 || address.assigned_bw_out != 0 {
                violations.push(Violation::BandwidthWhileInactive(address.id));
            }
        }

        for (peer, count) in active_per_peer {
            if count > 1 {
                violations.push(Violation::MultipleActive { peer, count });
            }
        }

        violations.extend(state.unrequested.iter().map(|id| Violation::Unrequested(*id)));

        if check_quota {
            drop(state);
            for (scope, quota) in self.quotas.iter() {
                let (used_in, used_out) = self.scope_usage(scope);
                if used_in > quota.inbound {
                    violations.push(Violation::QuotaExceeded {
                        scope,
                        direction: Direction::Inbound,
                        used: used_in,
                        quota: quota.inbound,
                    });
                }
                if used_out > quota.outbound {
                    violations.push(Violation::QuotaExceeded {
                        scope,
                        direction: Direction::Outbound,
                        used: used_out,
                        quota: quota.outbound,
                    });
                }
            }
        }

        violations
    }
}

impl Environment for AddressBook {
    fn bandwidth_changed(&self, address: &Address) {
        {
            let mut state = self.state.write();
            if !state.requested.contains(&address.peer) {
                tracing::warn!(id = %address.id, peer = %address.peer, "notification for peer without request");
                state.unrequested.push(address.id);
            }

            if let Some(stored) = state.addresses.get_mut(&address.id) {
                stored.assign(address.active, address.assigned_bw_in, address.assigned_bw_out);
            }
            state.notifications.push(address.clone());
        }

        tracing::trace!(
            id = %address.id,
            active = address.active,
            bw_in = address.assigned_bw_in,
            bw_out = address.assigned_bw_out,
            "bandwidth changed"
        );
        self.publish(Event::BandwidthChanged(address.clone()));
    }

    fn info(&self, op: Operation, status: Status, detail: InfoDetail) {
        let event = InfoEvent { op, status, detail };
        self.state.write().info.push(event);
        self.publish(Event::Info(event));
    }

    fn preferences(&self, peer: &PeerId) -> Preferences {
        self.state
            .read()
            .preferences
            .get(peer)
            .copied()
            .unwrap_or([DEFAULT_REL_PREFERENCE; ats_env::PREFERENCE_KINDS])
    }

    fn properties(&self, address: AddressId) -> Properties {
        self.state
            .read()
            .properties
            .get(&address)
            .copied()
            .unwrap_or([DEFAULT_REL_QUALITY; ats_env::QUALITY_PROPERTIES])
    }

    fn connectivity(&self, peer: &PeerId) -> u32 {
        self.state.read().connectivity.get(peer).copied().unwrap_or_default()
    }
}
