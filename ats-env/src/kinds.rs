use std::fmt;

/// Number of preference kinds.
pub const PREFERENCE_KINDS: usize = 2;

/// Number of quality properties that solvers take into account.
pub const QUALITY_PROPERTIES: usize = 2;

/// Normalized per-peer preferences, indexed by [`PreferenceKind::index`].
pub type Preferences = [f64; PREFERENCE_KINDS];

/// Normalized per-address quality values, indexed by [`PropertyKind::quality_index`].
/// Smaller is better.
pub type Properties = [f64; QUALITY_PROPERTIES];

/// Relative preference assumed for a peer nobody expressed a preference for.
pub const DEFAULT_REL_PREFERENCE: f64 = 0.0;

/// Relative quality assumed for an address without measurements.
pub const DEFAULT_REL_QUALITY: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceKind {
    Bandwidth,
    Latency,
}

impl PreferenceKind {
    pub const ALL: [Self; PREFERENCE_KINDS] = [Self::Bandwidth, Self::Latency];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PreferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bandwidth => f.write_str("bandwidth"),
            Self::Latency => f.write_str("latency"),
        }
    }
}

/// Kinds of address properties reported by the bookkeeping service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKind {
    Delay,
    Distance,
    UtilizationIn,
    UtilizationOut,
}

impl PropertyKind {
    /// The quality properties, in [`Properties`] index order.
    pub const QUALITY: [Self; QUALITY_PROPERTIES] = [Self::Delay, Self::Distance];

    /// Returns the index into [`Properties`] if this property is a quality metric solvers
    /// optimize for, `None` otherwise.
    #[inline]
    pub const fn quality_index(self) -> Option<usize> {
        match self {
            Self::Delay => Some(0),
            Self::Distance => Some(1),
            Self::UtilizationIn | Self::UtilizationOut => None,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delay => "delay",
            Self::Distance => "distance",
            Self::UtilizationIn => "utilization_in",
            Self::UtilizationOut => "utilization_out",
        };
        f.write_str(s)
    }
}
