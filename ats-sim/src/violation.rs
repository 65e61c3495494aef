use std::fmt;

use thiserror::Error;

use ats_env::{AddressId, NetworkScope, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

/// A broken allocation invariant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("{peer} has {count} active addresses")]
    MultipleActive { peer: PeerId, count: usize },
    #[error("inactive address {0} has bandwidth assigned")]
    BandwidthWhileInactive(AddressId),
    #[error("{direction} usage {used} of scope {scope} exceeds quota {quota}")]
    QuotaExceeded { scope: NetworkScope, direction: Direction, used: u64, quota: u64 },
    #[error("notification for address {0} of a peer without pending request")]
    Unrequested(AddressId),
}
