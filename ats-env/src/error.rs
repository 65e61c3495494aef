use thiserror::Error;

use crate::{AddressId, NetworkScope, PeerId};

/// Invalid solver configuration. A solver refuses to start with one of these.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange { name: &'static str, value: f64, min: f64, max: f64 },
    #[error("{name} must not be negative, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("{name} must not be zero")]
    Zero { name: &'static str },
    #[error("quota of scope {scope} ({quota}) is below the required minimum {required}")]
    QuotaTooSmall { scope: NetworkScope, quota: u64, required: u64 },
    #[error("minimum step time {min:?} exceeds maximum step time {max:?}")]
    StepTimes { min: std::time::Duration, max: std::time::Duration },
    #[error("address reactivation did not settle within {0} iterations")]
    ReactivationLimit(usize),
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Unknown address {0}")]
    UnknownAddress(AddressId),
    #[error("Address {0} already registered")]
    DuplicateAddress(AddressId),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("No pending address request for {0}")]
    NoPendingRequest(PeerId),
    #[error("Bulk stop without matching bulk start")]
    BulkUnderflow,
    #[error("Solve failed: {0}")]
    SolveFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SolverError {
    /// Wraps a strategy specific solve error.
    pub fn solve_failed<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Self::SolveFailed(Box::new(e))
    }
}
