//! Application of permission transfers against the replicated store.

use crate::effects::{BoundedCounterCrdt, CounterStoreEffects};
use crate::grace::GracePeriodTracker;
use crate::types::{
    ActorTag, CounterOperation, ReplicaId, ResourceKey, Timestamp, TransferOperation,
};
use std::sync::Arc;

/// What happened to a transfer handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer effect was appended and the grace period started.
    Applied,
    /// The transfer targeted the local replica.
    SuppressedSelfTarget,
    /// A transfer to the same target landed within the grace period.
    SuppressedGracePeriod,
    /// The transfer was malformed or the counter refused it.
    Rejected(String),
    /// The store could not be read or appended to.
    StoreFailed(String),
}

/// Validates transfers and appends their effects as the inter-replica actor.
///
/// Failures are reported through [`TransferOutcome`] and never retried here:
/// a transfer that does not land stays visible as the requester's deficit and
/// is asked for again on its next rebalance pass.
pub struct TransferExecutor<B: BoundedCounterCrdt> {
    local: ReplicaId,
    store: Arc<dyn CounterStoreEffects<B>>,
}

impl<B: BoundedCounterCrdt> TransferExecutor<B> {
    pub fn new(local: ReplicaId, store: Arc<dyn CounterStoreEffects<B>>) -> Self {
        Self { local, store }
    }

    pub async fn execute(
        &self,
        grace: &mut GracePeriodTracker,
        key: &ResourceKey,
        operation: TransferOperation,
        now: Timestamp,
    ) -> TransferOutcome {
        if operation.target == self.local {
            tracing::debug!(key = %key, "dropping transfer addressed to local replica");
            return TransferOutcome::SuppressedSelfTarget;
        }
        if grace.should_suppress_transfer(key, &operation.target, now) {
            tracing::debug!(
                key = %key,
                target = %operation.target,
                amount = operation.amount,
                "dropping transfer within grace period"
            );
            return TransferOutcome::SuppressedGracePeriod;
        }
        if operation.source != self.local {
            tracing::warn!(
                key = %key,
                source = %operation.source,
                "rejecting transfer whose source is not the local replica"
            );
            return TransferOutcome::Rejected(format!(
                "source {} is not local replica {}",
                operation.source, self.local
            ));
        }
        if operation.amount == 0 {
            tracing::warn!(
                key = %key,
                target = %operation.target,
                "rejecting transfer with zero amount"
            );
            return TransferOutcome::Rejected("zero amount".to_string());
        }

        let snapshot = match self.store.read(key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to read counter for transfer");
                return TransferOutcome::StoreFailed(e.to_string());
            }
        };

        let target = operation.target.clone();
        let amount = operation.amount;
        let effect = match B::generate_downstream(
            &CounterOperation::Transfer(operation),
            &self.local,
            &snapshot,
        ) {
            Ok(effect) => effect,
            Err(e) => {
                tracing::debug!(
                    key = %key,
                    target = %target,
                    error = %e,
                    "counter refused transfer"
                );
                return TransferOutcome::Rejected(e.to_string());
            }
        };

        if let Err(e) = self.store.append(key, effect, ActorTag::InterReplica).await {
            tracing::warn!(
                key = %key,
                target = %target,
                amount,
                error = %e,
                "failed to append transfer effect"
            );
            return TransferOutcome::StoreFailed(e.to_string());
        }

        grace.record_transfer(key.clone(), target.clone(), now);
        tracing::debug!(key = %key, target = %target, amount, "applied transfer");
        TransferOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{LedgerEffect, MemoryCounterStore, PermissionLedgerCounter};
    use std::time::Duration;

    fn setup() -> (
        Arc<MemoryCounterStore>,
        TransferExecutor<PermissionLedgerCounter>,
        GracePeriodTracker,
    ) {
        let store = Arc::new(MemoryCounterStore::new());
        store.set_allocations("stock".into(), [("dc1", 10), ("dc2", 0)]);
        let executor = TransferExecutor::new("dc1".into(), store.clone());
        let grace = GracePeriodTracker::new("dc1".into(), Duration::from_millis(500));
        (store, executor, grace)
    }

    fn give(amount: u64) -> TransferOperation {
        TransferOperation::new("dc1".into(), "dc2".into(), amount)
    }

    #[tokio::test]
    async fn applies_transfer_and_starts_grace_period() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");

        let outcome = executor.execute(&mut grace, &key, give(4), Timestamp(1_000)).await;

        assert_eq!(outcome, TransferOutcome::Applied);
        assert_eq!(store.available(&key, &"dc1".into()), 6);
        assert_eq!(store.available(&key, &"dc2".into()), 4);
        assert_eq!(grace.last_transfer(&key, &"dc2".into()), Some(Timestamp(1_000)));

        let appended = store.appended(&key);
        assert_eq!(appended.len(), 1);
        assert_eq!(appended[0].1, ActorTag::InterReplica);
        assert!(matches!(appended[0].0, LedgerEffect::Transfer { amount: 4, .. }));
    }

    #[tokio::test]
    async fn self_target_is_dropped_without_side_effects() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");
        let op = TransferOperation::new("dc1".into(), "dc1".into(), 4);

        let outcome = executor.execute(&mut grace, &key, op, Timestamp(1_000)).await;

        assert_eq!(outcome, TransferOutcome::SuppressedSelfTarget);
        assert!(store.appended(&key).is_empty());
        assert!(grace.is_empty());
    }

    #[tokio::test]
    async fn second_transfer_within_grace_period_is_dropped() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");

        executor.execute(&mut grace, &key, give(2), Timestamp(1_000)).await;
        let outcome = executor.execute(&mut grace, &key, give(2), Timestamp(1_499)).await;
        assert_eq!(outcome, TransferOutcome::SuppressedGracePeriod);

        let outcome = executor.execute(&mut grace, &key, give(2), Timestamp(1_500)).await;
        assert_eq!(outcome, TransferOutcome::Applied);
        assert_eq!(store.appended(&key).len(), 2);
    }

    #[tokio::test]
    async fn counter_refusal_is_rejected() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");

        let outcome = executor.execute(&mut grace, &key, give(11), Timestamp(1_000)).await;

        assert!(matches!(outcome, TransferOutcome::Rejected(_)));
        assert!(store.appended(&key).is_empty());
        assert!(grace.is_empty());
    }

    #[tokio::test]
    async fn foreign_source_is_rejected() {
        let (_store, executor, mut grace) = setup();
        let op = TransferOperation::new("dc3".into(), "dc2".into(), 1);

        let outcome = executor
            .execute(&mut grace, &"stock".into(), op, Timestamp(1_000))
            .await;

        assert!(matches!(outcome, TransferOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn zero_amount_is_rejected_without_touching_the_store() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");

        let outcome = executor.execute(&mut grace, &key, give(0), Timestamp(1_000)).await;

        assert_eq!(outcome, TransferOutcome::Rejected("zero amount".to_string()));
        assert!(store.appended(&key).is_empty());
        assert!(grace.is_empty());
    }

    #[tokio::test]
    async fn append_failure_does_not_start_grace_period() {
        let (store, executor, mut grace) = setup();
        let key = ResourceKey::from("stock");
        store.fail_appends(true);

        let outcome = executor.execute(&mut grace, &key, give(3), Timestamp(1_000)).await;

        assert!(matches!(outcome, TransferOutcome::StoreFailed(_)));
        assert!(grace.is_empty());
        assert_eq!(store.available(&key, &"dc1".into()), 10);
    }
}
