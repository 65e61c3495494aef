use std::fmt;

/// Number of actions that exist independently of the address count.
pub(crate) const ACTION_TYPES: usize = 9;

/// Direction a bandwidth action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    In,
    Out,
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::In => "in",
            Self::Out => "out",
        })
    }
}

/// An action of an agent. Index `ACTION_TYPES + i` switches to the agent's address `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Nothing,
    Double(Dir),
    Halve(Dir),
    Increase(Dir),
    Decrease(Dir),
    Switch(usize),
}

impl Action {
    pub(crate) const fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Nothing,
            1 => Self::Double(Dir::In),
            2 => Self::Halve(Dir::In),
            3 => Self::Increase(Dir::In),
            4 => Self::Decrease(Dir::In),
            5 => Self::Double(Dir::Out),
            6 => Self::Halve(Dir::Out),
            7 => Self::Increase(Dir::Out),
            8 => Self::Decrease(Dir::Out),
            i => Self::Switch(i - ACTION_TYPES),
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Nothing => 0,
            Self::Double(Dir::In) => 1,
            Self::Halve(Dir::In) => 2,
            Self::Increase(Dir::In) => 3,
            Self::Decrease(Dir::In) => 4,
            Self::Double(Dir::Out) => 5,
            Self::Halve(Dir::Out) => 6,
            Self::Increase(Dir::Out) => 7,
            Self::Decrease(Dir::Out) => 8,
            Self::Switch(i) => ACTION_TYPES + i,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nothing => f.write_str("nothing"),
            Self::Double(d) => write!(f, "double_{d}"),
            Self::Halve(d) => write!(f, "halve_{d}"),
            Self::Increase(d) => write!(f, "inc_{d}"),
            Self::Decrease(d) => write!(f, "dec_{d}"),
            Self::Switch(i) => write!(f, "switch_{i}"),
        }
    }
}

/// Bandwidth limits an action has to respect.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) min_bw: u32,
    /// Increment of the increase and decrease actions.
    pub(crate) step: u32,
    pub(crate) ceiling_in: u32,
    pub(crate) ceiling_out: u32,
    /// The scope already uses more than its inbound quota.
    pub(crate) over_in: bool,
    /// The scope already uses more than its outbound quota.
    pub(crate) over_out: bool,
}

impl Limits {
    const fn ceiling(&self, dir: Dir) -> u32 {
        match dir {
            Dir::In => self.ceiling_in,
            Dir::Out => self.ceiling_out,
        }
    }

    const fn over(&self, dir: Dir) -> bool {
        match dir {
            Dir::In => self.over_in,
            Dir::Out => self.over_out,
        }
    }
}

/// Whether `action` changes anything from bandwidth `(bw_in, bw_out)` on address `in_use`.
///
/// While the scope is over quota in a direction the agent can still give back, only halving
/// or decreasing that direction is legal.
pub(crate) fn is_legal(
    action: Action,
    in_use: usize,
    addresses: usize,
    (bw_in, bw_out): (u32, u32),
    limits: &Limits,
) -> bool {
    let bw = |dir: Dir| match dir {
        Dir::In => bw_in,
        Dir::Out => bw_out,
    };
    let must_shrink = |dir: Dir| limits.over(dir) && bw(dir) > limits.min_bw;
    if must_shrink(Dir::In) || must_shrink(Dir::Out) {
        return matches!(action, Action::Halve(d) | Action::Decrease(d) if must_shrink(d));
    }

    match action {
        Action::Nothing => true,
        Action::Double(d) | Action::Increase(d) => bw(d) < limits.ceiling(d),
        Action::Halve(d) | Action::Decrease(d) => bw(d) > limits.min_bw,
        Action::Switch(i) => i < addresses && i != in_use,
    }
}

/// Bandwidth after a bandwidth action, clamped to `[min_bw, ceiling]`. Switches keep the
/// bandwidth.
pub(crate) fn apply(action: Action, (bw_in, bw_out): (u32, u32), limits: &Limits) -> (u32, u32) {
    let change = |bw: u32, dir: Dir| -> u32 {
        let ceiling = limits.ceiling(dir).max(limits.min_bw);
        let next = match action {
            Action::Double(_) => bw.saturating_mul(2),
            Action::Halve(_) => bw / 2,
            Action::Increase(_) => bw.saturating_add(limits.step),
            Action::Decrease(_) => bw.saturating_sub(limits.step),
            Action::Nothing | Action::Switch(_) => bw,
        };
        next.clamp(limits.min_bw, ceiling)
    };

    match action {
        Action::Double(Dir::In)
        | Action::Halve(Dir::In)
        | Action::Increase(Dir::In)
        | Action::Decrease(Dir::In) => (change(bw_in, Dir::In), bw_out),
        Action::Double(Dir::Out)
        | Action::Halve(Dir::Out)
        | Action::Increase(Dir::Out)
        | Action::Decrease(Dir::Out) => (bw_in, change(bw_out, Dir::Out)),
        Action::Nothing | Action::Switch(_) => (bw_in, bw_out),
    }
}
