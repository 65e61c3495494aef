use std::{fmt, str::FromStr, sync::Arc};

use thiserror::Error;

use ats_env::{ConfigError, Environment, Quotas, Solver};

pub mod mlp;
pub mod proportional;
pub mod ril;

mod stats;

pub use mlp::{MlpError, MlpOptions, MlpSolver};
pub use proportional::{ProportionalOptions, ProportionalSolver};
pub use ril::{RilOptions, RilSolver};
pub use stats::SolverStats;

/// The available strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverKind {
    Mlp,
    Proportional,
    Ril,
}

impl SolverKind {
    pub const ALL: [Self; 3] = [Self::Mlp, Self::Proportional, Self::Ril];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mlp => "mlp",
            Self::Proportional => "proportional",
            Self::Ril => "ril",
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown solver {0:?}, expected one of mlp, proportional, ril")]
pub struct UnknownSolver(String);

impl FromStr for SolverKind {
    type Err = UnknownSolver;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mlp" | "milp" => Ok(Self::Mlp),
            "proportional" | "prop" => Ok(Self::Proportional),
            "ril" | "rl" => Ok(Self::Ril),
            _ => Err(UnknownSolver(s.to_owned())),
        }
    }
}

/// A strategy together with its options.
#[derive(Debug, Clone)]
pub enum SolverConfig {
    Mlp(MlpOptions),
    Proportional(ProportionalOptions),
    Ril(RilOptions),
}

impl SolverConfig {
    pub const fn kind(&self) -> SolverKind {
        match self {
            Self::Mlp(_) => SolverKind::Mlp,
            Self::Proportional(_) => SolverKind::Proportional,
            Self::Ril(_) => SolverKind::Ril,
        }
    }
}

impl From<SolverKind> for SolverConfig {
    fn from(kind: SolverKind) -> Self {
        match kind {
            SolverKind::Mlp => Self::Mlp(MlpOptions::default()),
            SolverKind::Proportional => Self::Proportional(ProportionalOptions::default()),
            SolverKind::Ril => Self::Ril(RilOptions::default()),
        }
    }
}

impl From<MlpOptions> for SolverConfig {
    fn from(options: MlpOptions) -> Self {
        Self::Mlp(options)
    }
}

impl From<ProportionalOptions> for SolverConfig {
    fn from(options: ProportionalOptions) -> Self {
        Self::Proportional(options)
    }
}

impl From<RilOptions> for SolverConfig {
    fn from(options: RilOptions) -> Self {
        Self::Ril(options)
    }
}

/// Creates the configured strategy behind the [`Solver`] interface.
pub fn build_solver<E: Environment>(
    env: Arc<E>,
    quotas: Quotas,
    config: impl Into<SolverConfig>,
) -> Result<Box<dyn Solver>, ConfigError> {
    let config = config.into();
    tracing::info!(solver = %config.kind(), "building solver");

    Ok(match config {
        SolverConfig::Mlp(options) => Box::new(MlpSolver::new(env, quotas, options)?),
        SolverConfig::Proportional(options) => {
            Box::new(ProportionalSolver::new(env, quotas, options)?)
        }
        SolverConfig::Ril(options) => Box::new(RilSolver::new(env, quotas, options)?),
    })
}
