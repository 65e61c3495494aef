use std::time::Duration;

use ats_env::AddressId;

/// What address selection needs to know about one candidate.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) id: AddressId,
    pub(crate) active: bool,
    /// Time since activation, `None` if inactive.
    pub(crate) active_for: Option<Duration>,
    /// Whether the scope can admit the address.
    pub(crate) eligible: bool,
    pub(crate) delay: f64,
    pub(crate) distance: f64,
}

/// Whether `cur` beats `best` by more than the multiplicative `threshold`.
#[inline]
fn improves(cur: f64, best: f64, threshold: f64) -> bool {
    cur < best && (cur <= 0.0 || best / cur > threshold)
}

/// Picks the best eligible candidate.
///
/// An active address that was activated less than `stability_factor` seconds ago is kept
/// unconditionally. Otherwise candidates are compared by distance, then by delay. Replacing
/// the active address requires an improvement ratio above `stability_factor`.
pub(crate) fn find_best(candidates: &[Candidate], stability_factor: f64) -> Option<AddressId> {
    let window = Duration::from_secs_f64(stability_factor);

    let mut order: Vec<_> = candidates.iter().filter(|c| c.eligible).collect();
    order.sort_by_key(|c| !c.active);

    let mut best: Option<&Candidate> = None;
    for cur in order {
        if cur.active && cur.active_for.is_some_and(|t| t <= window) {
            return Some(cur.id);
        }

        let Some(b) = best else {
            best = Some(cur);
            continue;
        };

        let threshold = if b.active { stability_factor } else { 1.0 };
        if improves(cur.distance, b.distance, threshold)
            || (cur.distance <= b.distance && improves(cur.delay, b.delay, threshold))
        {
            best = Some(cur);
        }
    }

    best.map(|c| c.id)
}
