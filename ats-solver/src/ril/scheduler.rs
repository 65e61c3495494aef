use std::time::Duration;

/// Discount factors of one global step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Discount {
    /// Discount applied to the estimated future value, `γ(τ)`.
    pub(crate) variable: f64,
    /// Discount applied to the reward collected over the step.
    pub(crate) integrated: f64,
}

impl Discount {
    /// Semi-Markov discount for `elapsed` wall-clock time, measured in units of `unit`.
    pub(crate) fn semi_markov(elapsed: Duration, unit: Duration, beta: f64) -> Self {
        let tau = elapsed.as_secs_f64() / unit.as_secs_f64().max(f64::EPSILON);
        let variable = (-beta * tau).exp();
        Self { variable, integrated: (1.0 - variable) / beta }
    }

    /// Fixed per-step discount.
    pub(crate) const fn fixed(gamma: f64) -> Self {
        Self { variable: gamma, integrated: 1.0 }
    }
}

/// Delay until the next global step. Shrinks from `max` towards `min` as `used_ratio`
/// approaches 1.
pub(crate) fn next_interval(used_ratio: f64, min: Duration, max: Duration, exponent: i32) -> Duration {
    let ratio = if used_ratio.is_finite() { used_ratio.clamp(0.0, 1.0) } else { 1.0 };
    let span = max.saturating_sub(min);
    max.saturating_sub(span.mul_f64(ratio.powi(exponent)))
}

/// Assigned over available bandwidth across all scopes that carry traffic, capped at 1.
pub(crate) fn used_ratio(scopes: impl IntoIterator<Item = ((u64, u64), (u64, u64))>) -> f64 {
    let (assigned, available) = scopes
        .into_iter()
        .filter(|((assigned_in, _), _)| *assigned_in > 0)
        .fold((0u64, 0u64), |(s, a), ((ai, ao), (vi, vo))| {
            (s.saturating_add(ai + ao), a.saturating_add(vi.saturating_add(vo)))
        });
    if available == 0 {
        return 0.0;
    }
    (assigned as f64 / available as f64).min(1.0)
}
