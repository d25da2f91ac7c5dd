//! Grace-period tracking for outbound permission transfers.
//!
//! Many local failures can arrive in quick succession, each asking for the
//! same donor to move permissions before the first transfer has replicated.
//! The tracker remembers when a transfer for `(key, target)` last landed and
//! suppresses further transfers for that pair until the grace period has
//! elapsed.

use crate::types::{ReplicaId, ResourceKey, Timestamp};
use std::collections::BTreeMap;
use std::time::Duration;

/// Last transfer time per `(key, target)` pair.
#[derive(Debug, Clone)]
pub struct GracePeriodTracker {
    local: ReplicaId,
    grace_period: Duration,
    last_transfers: BTreeMap<(ResourceKey, ReplicaId), Timestamp>,
}

impl GracePeriodTracker {
    pub fn new(local: ReplicaId, grace_period: Duration) -> Self {
        Self {
            local,
            grace_period,
            last_transfers: BTreeMap::new(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Whether a transfer to `target` for `key` must be dropped at `now`.
    ///
    /// Transfers to the local replica are always suppressed.
    pub fn should_suppress_transfer(
        &self,
        key: &ResourceKey,
        target: &ReplicaId,
        now: Timestamp,
    ) -> bool {
        if *target == self.local {
            return true;
        }
        self.last_transfers
            .get(&(key.clone(), target.clone()))
            .is_some_and(|recorded| now.elapsed_since(*recorded) < self.grace_period)
    }

    /// Record a transfer, overwriting any earlier record for the pair.
    pub fn record_transfer(&mut self, key: ResourceKey, target: ReplicaId, at: Timestamp) {
        self.last_transfers.insert((key, target), at);
    }

    /// Drop every record whose grace period has fully elapsed at `now`.
    ///
    /// Returns the number of records removed.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let before = self.last_transfers.len();
        let grace_period = self.grace_period;
        self.last_transfers
            .retain(|_, recorded| now.elapsed_since(*recorded) < grace_period);
        before - self.last_transfers.len()
    }

    pub fn last_transfer(&self, key: &ResourceKey, target: &ReplicaId) -> Option<Timestamp> {
        self.last_transfers
            .get(&(key.clone(), target.clone()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.last_transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_transfers.is_empty()
    }
}
