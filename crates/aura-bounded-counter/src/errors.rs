//! Error types for the bounded-counter coordinator and its effect seams.

use crate::types::{ReplicaId, ResourceKey};
use thiserror::Error;

/// Failure reported by the bounded-counter CRDT when generating a downstream effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// The local replica does not own enough permissions for the operation.
    #[error("insufficient permissions: requested {requested}, available {available}")]
    InsufficientPermissions { requested: u64, available: u64 },

    /// The operation is malformed for this counter.
    #[error("invalid counter operation: {0}")]
    InvalidOperation(String),
}

impl CounterError {
    pub fn code(&self) -> &'static str {
        match self {
            CounterError::InsufficientPermissions { .. } => "counter_insufficient_permissions",
            CounterError::InvalidOperation(_) => "counter_invalid_operation",
        }
    }
}

/// Failure reported by the replicated object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("failed to read {key}: {reason}")]
    ReadFailed { key: ResourceKey, reason: String },

    #[error("failed to append to {key}: {reason}")]
    AppendFailed { key: ResourceKey, reason: String },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::ReadFailed { .. } => "store_read_failed",
            StoreError::AppendFailed { .. } => "store_append_failed",
        }
    }
}

/// Failure delivering a transfer request to a donor replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    PeerUnreachable(ReplicaId),

    #[error("peer {peer} rejected the request: {reason}")]
    Rejected { peer: ReplicaId, reason: String },
}

impl TransportError {
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::PeerUnreachable(_) => "transport_peer_unreachable",
            TransportError::Rejected { .. } => "transport_rejected",
        }
    }
}

/// Errors surfaced to holders of a [`CoordinatorHandle`](crate::CoordinatorHandle).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// The operation needs more permissions than this replica owns.
    ///
    /// The shortfall has already been queued for rebalancing when this is returned.
    #[error("insufficient permissions for {key}: requested {requested}, available {available}")]
    InsufficientPermissions {
        key: ResourceKey,
        requested: u64,
        available: u64,
    },

    #[error("counter error: {0}")]
    Counter(CounterError),

    /// The coordinator task has stopped.
    #[error("coordinator is not running")]
    Stopped,

    /// The coordinator mailbox is full.
    #[error("coordinator mailbox is full")]
    Overloaded,
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::InsufficientPermissions { .. } => "insufficient_permissions",
            CoordinatorError::Counter(err) => err.code(),
            CoordinatorError::Stopped => "coordinator_stopped",
            CoordinatorError::Overloaded => "coordinator_overloaded",
        }
    }

    /// Shortfall between requested and locally available permissions.
    pub fn deficit(&self) -> Option<u64> {
        match self {
            CoordinatorError::InsufficientPermissions {
                requested,
                available,
                ..
            } => Some(requested.saturating_sub(*available)),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InsufficientPermissions { .. } | CoordinatorError::Overloaded
        )
    }
}

impl From<CounterError> for CoordinatorError {
    fn from(err: CounterError) -> Self {
        CoordinatorError::Counter(err)
    }
}

/// Errors loading or validating [`BoundedCounterConfig`](crate::BoundedCounterConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {var} is not a valid value: {value}")]
    InvalidEnv { var: String, value: String },

    #[error("field '{field}' must be at least {min} (got {actual})")]
    OutOfRange {
        field: &'static str,
        min: u64,
        actual: u64,
    },
}
