use ats_common::constants::{KiB, MiB, MAX_BANDWIDTH};

use crate::NetworkScope;

/// Inbound and outbound quota of a network scope, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeQuota {
    pub inbound: u64,
    pub outbound: u64,
}

impl ScopeQuota {
    pub const fn new(inbound: u64, outbound: u64) -> Self {
        Self { inbound, outbound }
    }

    /// The smaller of both directions.
    #[inline]
    pub fn min(&self) -> u64 {
        self.inbound.min(self.outbound)
    }
}

/// Quotas for all network scopes. Immutable once handed to a solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quotas {
    quotas: [ScopeQuota; NetworkScope::COUNT],
}

impl Quotas {
    /// Creates quotas with the same value for every scope.
    pub fn uniform(inbound: u64, outbound: u64) -> Self {
        Self { quotas: [ScopeQuota::new(inbound, outbound); NetworkScope::COUNT] }
    }

    /// Sets the quota of a single scope.
    pub fn with_quota(mut self, scope: NetworkScope, inbound: u64, outbound: u64) -> Self {
        self.quotas[scope.index()] = ScopeQuota::new(inbound, outbound);
        self
    }

    #[inline]
    pub fn get(&self, scope: NetworkScope) -> ScopeQuota {
        self.quotas[scope.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetworkScope, ScopeQuota)> + '_ {
        NetworkScope::ALL.iter().map(move |s| (*s, self.quotas[s.index()]))
    }

    /// Largest quota of any scope and direction.
    pub fn max(&self) -> u64 {
        self.quotas.iter().map(|q| q.inbound.max(q.outbound)).max().unwrap_or_default()
    }
}

impl Default for Quotas {
    fn default() -> Self {
        let unlimited = MAX_BANDWIDTH as u64;
        Self::uniform(64 * KiB as u64, 64 * KiB as u64)
            .with_quota(NetworkScope::Loopback, unlimited, unlimited)
            .with_quota(NetworkScope::Lan, unlimited, unlimited)
            .with_quota(NetworkScope::Wlan, MiB as u64, MiB as u64)
            .with_quota(NetworkScope::Bluetooth, 128 * KiB as u64, 128 * KiB as u64)
    }
}
