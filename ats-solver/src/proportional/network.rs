use ats_common::bandwidth_from_f64;
use ats_env::{AddressId, ScopeQuota};

/// Bookkeeping of one network scope, stored at the index of its scope.
#[derive(Debug)]
pub(crate) struct Network {
    pub(crate) quota: ScopeQuota,
    /// All addresses in this scope, active or not.
    pub(crate) addresses: Vec<AddressId>,
    pub(crate) active: usize,
}

impl Network {
    pub(crate) const fn new(quota: ScopeQuota) -> Self {
        Self { quota, addresses: Vec::new(), active: 0 }
    }

    /// Whether every active address still gets at least `min_bw` in both directions with
    /// `extra` more active addresses.
    pub(crate) fn is_bandwidth_available(&self, extra: usize, min_bw: u32) -> bool {
        let na = (self.active + extra) as u64;
        if na == 0 {
            return true;
        }
        let needed = na * min_bw as u64;
        self.quota.inbound >= needed && self.quota.outbound >= needed
    }

    pub(crate) fn remove(&mut self, id: AddressId) {
        self.addresses.retain(|a| *a != id);
    }
}

/// Share of one active address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Share {
    pub(crate) id: AddressId,
    pub(crate) bw_in: u32,
    pub(crate) bw_out: u32,
}

/// The minimum bandwidth does not fit the quota of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Overcommitted {
    pub(crate) active: usize,
    pub(crate) required: u64,
}

/// Gives every active address `min_bw` and splits the rest of the quota proportionally to
/// `1 + k·preference`, independently per direction.
pub(crate) fn distribute(
    active: &[(AddressId, f64)],
    quota: ScopeQuota,
    min_bw: u32,
    k: f64,
) -> Result<Vec<Share>, Overcommitted> {
    if active.is_empty() {
        return Ok(Vec::new());
    }

    let count = active.len() as u64;
    let required = count * min_bw as u64;
    if required > quota.inbound || required > quota.outbound {
        return Err(Overcommitted { active: active.len(), required });
    }

    let remaining_in = (quota.inbound - required) as f64;
    let remaining_out = (quota.outbound - required) as f64;
    let total_weight = active.len() as f64 + k * active.iter().map(|(_, p)| p).sum::<f64>();

    Ok(active
        .iter()
        .map(|(id, preference)| {
            let weight = 1.0 + k * preference;
            let ratio = weight / total_weight;
            Share {
                id: *id,
                bw_in: bandwidth_from_f64(min_bw as f64 + ratio * remaining_in),
                bw_out: bandwidth_from_f64(min_bw as f64 + ratio * remaining_out),
            }
        })
        .collect())
}
