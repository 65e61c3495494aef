use std::time::SystemTime;

/// Returns the current UNIX timestamp in microseconds. Returns 0 if the system clock
/// is set before the epoch.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Converts a solver-internal floating point bandwidth into a representable bandwidth value.
///
/// A small epsilon is added before flooring so that values like `1023.9999999` coming out of
/// the LP do not lose a whole byte. `NaN` maps to 0, values beyond the range saturate.
#[inline]
pub fn bandwidth_from_f64(value: f64) -> u32 {
    if value.is_nan() {
        tracing::warn!("NaN bandwidth value, using 0");
        return 0;
    }

    (value + 1e-6).floor().clamp(0.0, constants::MAX_BANDWIDTH as f64) as u32
}

/// Converts a quota given as `u64` into the `u32` bandwidth domain, saturating.
#[inline]
pub fn clamp_quota(quota: u64) -> u32 {
    quota.min(constants::MAX_BANDWIDTH as u64) as u32
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
    pub const MiB: u32 = 1024 * KiB;
    pub const GiB: u32 = 1024 * MiB;

    /// Default minimum bandwidth granted to an active address, per direction.
    pub const DEFAULT_BW_IN_OUT: u32 = KiB;

    /// Largest bandwidth value an address can be assigned.
    pub const MAX_BANDWIDTH: u32 = u32::MAX;
}
