use std::fmt;

use crate::kinds::Properties;

/// Identity of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Identity of an address record. Unique for the lifetime of the address bookkeeping
/// service, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressId(pub u64);

impl fmt::Display for AddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr-{}", self.0)
    }
}

/// A capacity domain with its own inbound/outbound quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkScope {
    Unspecified,
    Loopback,
    Lan,
    Wan,
    Wlan,
    Bluetooth,
}

impl NetworkScope {
    /// Number of network scopes.
    pub const COUNT: usize = 6;

    /// All scopes, in index order.
    pub const ALL: [Self; Self::COUNT] =
        [Self::Unspecified, Self::Loopback, Self::Lan, Self::Wan, Self::Wlan, Self::Bluetooth];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Loopback => "loopback",
            Self::Lan => "lan",
            Self::Wan => "wan",
            Self::Wlan => "wlan",
            Self::Bluetooth => "bluetooth",
        }
    }
}

impl fmt::Display for NetworkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate address for a peer, as owned by the address bookkeeping service.
///
/// Solvers never own the authoritative record. They keep a copy in their own side map,
/// change the assignment fields on that copy and hand it back through
/// [`Environment::bandwidth_changed`](crate::Environment::bandwidth_changed).
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub id: AddressId,
    pub peer: PeerId,
    /// Transport plugin name, opaque to solvers.
    pub plugin: String,
    /// Session identifier, 0 if there is no session.
    pub session_id: u32,
    pub scope: NetworkScope,
    /// Raw quality properties, indexed by [`PropertyKind::quality_index`](crate::PropertyKind::quality_index).
    pub properties: Properties,
    pub active: bool,
    pub assigned_bw_in: u32,
    pub assigned_bw_out: u32,
}

impl Address {
    pub fn new(id: AddressId, peer: PeerId, plugin: impl Into<String>, scope: NetworkScope) -> Self {
        Self {
            id,
            peer,
            plugin: plugin.into(),
            session_id: 0,
            scope,
            properties: Default::default(),
            active: false,
            assigned_bw_in: 0,
            assigned_bw_out: 0,
        }
    }

    /// Sets the session identifier.
    pub fn with_session(mut self, session_id: u32) -> Self {
        self.session_id = session_id;
        self
    }

    /// Sets the raw quality properties.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Applies an assignment. Inactive addresses always get zero bandwidth.
    /// Returns `true` if any of `(active, bw_in, bw_out)` changed.
    pub fn assign(&mut self, active: bool, bw_in: u32, bw_out: u32) -> bool {
        let (bw_in, bw_out) = if active { (bw_in, bw_out) } else { (0, 0) };
        let changed = self.active != active
            || self.assigned_bw_in != bw_in
            || self.assigned_bw_out != bw_out;

        self.active = active;
        self.assigned_bw_in = bw_in;
        self.assigned_bw_out = bw_out;

        changed
    }

    /// Deactivates the address. Returns `true` if it was active or had bandwidth.
    #[inline]
    pub fn deactivate(&mut self) -> bool {
        self.assign(false, 0, 0)
    }

    /// Returns `(active, bw_in, bw_out)`.
    #[inline]
    pub const fn assignment(&self) -> (bool, u32, u32) {
        (self.active, self.assigned_bw_in, self.assigned_bw_out)
    }
}
