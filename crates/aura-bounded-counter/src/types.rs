//! Identifiers and value types shared by the coordinator components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a replica (datacenter) that can own permissions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Key of a bounded-counter object in the replicated store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ResourceKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Wall-clock instant in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`.
    ///
    /// Saturates to zero when `earlier` lies in the future.
    pub fn elapsed_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Actor identity attached to effects appended to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorTag {
    /// Effect generated by a client write.
    Client(String),
    /// Effect generated by replicas moving permissions between themselves.
    InterReplica,
}

/// Request to move `amount` permissions from `source` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOperation {
    pub source: ReplicaId,
    pub target: ReplicaId,
    pub amount: u64,
}

impl TransferOperation {
    pub fn new(source: ReplicaId, target: ReplicaId, amount: u64) -> Self {
        Self {
            source,
            target,
            amount,
        }
    }
}

/// Operation on a bounded counter as submitted by the write path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterOperation {
    Increment(u64),
    Decrement(u64),
    Transfer(TransferOperation),
}

impl CounterOperation {
    /// Whether the operation is admitted only against locally owned permissions.
    pub fn requires_permissions(&self) -> bool {
        matches!(self, Self::Increment(_) | Self::Decrement(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Increment(_) => "increment",
            Self::Decrement(_) => "decrement",
            Self::Transfer(_) => "transfer",
        }
    }
}

/// Unmet deficit waiting for a future rebalance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub deficit: u64,
    pub enqueued_at: Timestamp,
}

/// A peer and the permissions it currently has available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceEntry {
    pub replica: ReplicaId,
    pub available: u64,
}

/// Amount asked of a single donor during a rebalance pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub donor: ReplicaId,
    pub amount: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_saturates_when_clock_steps_back() {
        let earlier = Timestamp::from_millis(1_000);
        let later = Timestamp::from_millis(1_250);

        assert_eq!(later.elapsed_since(earlier), Duration::from_millis(250));
        assert_eq!(earlier.elapsed_since(later), Duration::ZERO);
    }

    #[test]
    fn only_increment_and_decrement_need_permissions() {
        let transfer = TransferOperation::new("a".into(), "b".into(), 3);

        assert!(CounterOperation::Increment(1).requires_permissions());
        assert!(CounterOperation::Decrement(1).requires_permissions());
        assert!(!CounterOperation::Transfer(transfer).requires_permissions());
    }

    #[test]
    fn replica_ids_order_lexicographically() {
        let mut ids = vec![ReplicaId::from("dc3"), "dc1".into(), "dc2".into()];
        ids.sort();
        assert_eq!(ids, vec!["dc1".into(), "dc2".into(), ReplicaId::from("dc3")]);
    }
}
