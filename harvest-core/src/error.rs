//! Error taxonomy shared across the harvesting layers
//!
//! - [`FetchError`]: everything that can go wrong while acquiring one page or
//!   one lookup response. It is `Clone` so a coalesced gateway call can hand the
//!   same failure to every waiter.
//! - [`StorageError`]: failures of the persistence collaborator.

use thiserror::Error;

use crate::RunStatus;

/// Failure while acquiring data from an upstream service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Request to {service} timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("Rate limited by {service}")]
    RateLimited { service: String },

    #[error("Upstream blocked the request: {0}")]
    UpstreamBlocked(String),

    #[error("Page layout changed: {0}")]
    LayoutChanged(String),

    #[error("Parse invariant violated: {0}")]
    ParseInvariantViolation(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl FetchError {
    /// Errors worth another attempt on a later tick
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FetchError::TransientNetwork(_) | FetchError::Timeout { .. } | FetchError::RateLimited { .. }
        )
    }

    /// Errors that count toward the blocked-failure safety counter
    pub fn counts_as_blocked(&self) -> bool {
        matches!(self, FetchError::UpstreamBlocked(_) | FetchError::RateLimited { .. })
    }

    /// Errors that count toward the network-failure safety counter
    pub fn counts_as_network(&self) -> bool {
        matches!(self, FetchError::TransientNetwork(_) | FetchError::Timeout { .. })
    }

    /// Stable short label used in queue items and events
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::TransientNetwork(_) => "transient_network",
            FetchError::Timeout { .. } => "timeout",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::UpstreamBlocked(_) => "upstream_blocked",
            FetchError::LayoutChanged(_) => "layout_changed",
            FetchError::ParseInvariantViolation(_) => "parse_invariant_violation",
            FetchError::Storage(_) => "storage",
        }
    }
}

impl From<StorageError> for FetchError {
    fn from(err: StorageError) -> Self {
        FetchError::Storage(err.to_string())
    }
}

/// Failure of the storage collaborator
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Domain rule violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("Invalid run transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Invalid configuration: {0}")]
    Config(String),
}
