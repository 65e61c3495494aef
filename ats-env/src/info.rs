/// Solve phases reported through [`Environment::info`](crate::Environment::info).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SolveStart,
    SolveStop,
    SetupStart,
    SetupStop,
    LpStart,
    LpStop,
    MilpStart,
    MilpStop,
    UpdateNotifyStart,
    UpdateNotifyStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Fail,
}

impl Status {
    #[inline]
    pub const fn from_ok(ok: bool) -> Self {
        if ok {
            Self::Success
        } else {
            Self::Fail
        }
    }
}

/// Extra information attached to a phase event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoDetail {
    /// The problem was rebuilt from scratch.
    Full,
    /// Only coefficients of an existing problem changed.
    Updated,
    /// Nothing to add.
    None,
    /// A single scope was recomputed.
    PropSingle,
    /// All scopes were recomputed.
    PropAll,
}
