//! In-memory effect handlers
//!
//! Single-process implementations of every effect seam, for unit tests,
//! simulation and local development. All replicas of a simulated cluster
//! share one [`MemoryCounterStore`], so an appended effect is immediately
//! visible everywhere.

use crate::coordinator::CoordinatorHandle;
use crate::effects::{
    BoundedCounterCrdt, CounterStoreEffects, PhysicalClockEffects, TopologyEffects,
    TransferTransportEffects,
};
use crate::errors::{CounterError, StoreError, TransportError};
use crate::types::{
    ActorTag, CounterOperation, ReplicaId, ResourceKey, Timestamp, TransferOperation,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// =============================================================================
// Permission ledger counter
// =============================================================================

/// Permissions owned by each replica for one counter object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionLedger {
    allocations: BTreeMap<ReplicaId, u64>,
}

impl PermissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_allocations<I, R>(allocations: I) -> Self
    where
        I: IntoIterator<Item = (R, u64)>,
        R: Into<ReplicaId>,
    {
        Self {
            allocations: allocations
                .into_iter()
                .map(|(replica, amount)| (replica.into(), amount))
                .collect(),
        }
    }

    pub fn available(&self, replica: &ReplicaId) -> u64 {
        self.allocations.get(replica).copied().unwrap_or(0)
    }

    /// Sum of permissions over all replicas.
    pub fn total(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// Apply a downstream effect. Effects were validated when generated, so
    /// arithmetic saturates instead of failing.
    pub fn apply(&mut self, effect: &LedgerEffect) {
        match effect {
            LedgerEffect::Increment { replica, amount } => {
                let slot = self.allocations.entry(replica.clone()).or_insert(0);
                *slot = slot.saturating_add(*amount);
            }
            LedgerEffect::Decrement { replica, amount } => {
                let slot = self.allocations.entry(replica.clone()).or_insert(0);
                *slot = slot.saturating_sub(*amount);
            }
            LedgerEffect::Transfer {
                source,
                target,
                amount,
            } => {
                let moved = {
                    let slot = self.allocations.entry(source.clone()).or_insert(0);
                    let moved = (*slot).min(*amount);
                    *slot -= moved;
                    moved
                };
                let slot = self.allocations.entry(target.clone()).or_insert(0);
                *slot = slot.saturating_add(moved);
            }
        }
    }
}

/// Downstream effect of a [`PermissionLedgerCounter`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEffect {
    Increment { replica: ReplicaId, amount: u64 },
    Decrement { replica: ReplicaId, amount: u64 },
    Transfer {
        source: ReplicaId,
        target: ReplicaId,
        amount: u64,
    },
}

/// Bounded counter whose state is the permission ledger itself.
///
/// Increments mint permissions at the issuing replica; decrements and
/// transfers consume permissions the issuing replica owns.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionLedgerCounter;

impl BoundedCounterCrdt for PermissionLedgerCounter {
    type Snapshot = PermissionLedger;
    type Effect = LedgerEffect;

    fn generate_downstream(
        operation: &CounterOperation,
        local: &ReplicaId,
        snapshot: &PermissionLedger,
    ) -> Result<LedgerEffect, CounterError> {
        match operation {
            CounterOperation::Increment(0) | CounterOperation::Decrement(0) => {
                Err(CounterError::InvalidOperation("zero amount".to_string()))
            }
            CounterOperation::Increment(amount) => Ok(LedgerEffect::Increment {
                replica: local.clone(),
                amount: *amount,
            }),
            CounterOperation::Decrement(amount) => {
                let available = snapshot.available(local);
                if available < *amount {
                    return Err(CounterError::InsufficientPermissions {
                        requested: *amount,
                        available,
                    });
                }
                Ok(LedgerEffect::Decrement {
                    replica: local.clone(),
                    amount: *amount,
                })
            }
            CounterOperation::Transfer(transfer) => {
                if transfer.source != *local {
                    return Err(CounterError::InvalidOperation(format!(
                        "transfer source {} is not {}",
                        transfer.source, local
                    )));
                }
                let available = snapshot.available(local);
                if available < transfer.amount {
                    return Err(CounterError::InsufficientPermissions {
                        requested: transfer.amount,
                        available,
                    });
                }
                Ok(LedgerEffect::Transfer {
                    source: transfer.source.clone(),
                    target: transfer.target.clone(),
                    amount: transfer.amount,
                })
            }
        }
    }

    fn available_permissions(replica: &ReplicaId, snapshot: &PermissionLedger) -> u64 {
        snapshot.available(replica)
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<ResourceKey, PermissionLedger>,
    log: BTreeMap<ResourceKey, Vec<(LedgerEffect, ActorTag)>>,
    failing_reads: BTreeSet<ResourceKey>,
    failing_appends: bool,
}

/// Shared in-memory object store for counters whose state is a
/// [`PermissionLedger`], such as [`PermissionLedgerCounter`].
///
/// Reads and appends can be made to fail to exercise error paths.
#[derive(Default)]
pub struct MemoryCounterStore {
    state: Mutex<StoreState>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the allocations of `key`.
    pub fn set_allocations<I, R>(&self, key: ResourceKey, allocations: I)
    where
        I: IntoIterator<Item = (R, u64)>,
        R: Into<ReplicaId>,
    {
        self.state
            .lock()
            .objects
            .insert(key, PermissionLedger::from_allocations(allocations));
    }

    pub fn snapshot(&self, key: &ResourceKey) -> PermissionLedger {
        self.state
            .lock()
            .objects
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn available(&self, key: &ResourceKey, replica: &ReplicaId) -> u64 {
        self.snapshot(key).available(replica)
    }

    pub fn total(&self, key: &ResourceKey) -> u64 {
        self.snapshot(key).total()
    }

    /// Effects appended to `key`, oldest first.
    pub fn appended(&self, key: &ResourceKey) -> Vec<(LedgerEffect, ActorTag)> {
        self.state.lock().log.get(key).cloned().unwrap_or_default()
    }

    pub fn fail_reads_for(&self, key: ResourceKey, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_reads.insert(key);
        } else {
            state.failing_reads.remove(&key);
        }
    }

    pub fn fail_appends(&self, failing: bool) {
        self.state.lock().failing_appends = failing;
    }
}

#[async_trait]
impl<B> CounterStoreEffects<B> for MemoryCounterStore
where
    B: BoundedCounterCrdt<Snapshot = PermissionLedger, Effect = LedgerEffect>,
{
    async fn read(&self, key: &ResourceKey) -> Result<PermissionLedger, StoreError> {
        let state = self.state.lock();
        if state.failing_reads.contains(key) {
            return Err(StoreError::ReadFailed {
                key: key.clone(),
                reason: "injected read failure".to_string(),
            });
        }
        Ok(state.objects.get(key).cloned().unwrap_or_default())
    }

    async fn append(
        &self,
        key: &ResourceKey,
        effect: LedgerEffect,
        actor: ActorTag,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.failing_appends {
            return Err(StoreError::AppendFailed {
                key: key.clone(),
                reason: "injected append failure".to_string(),
            });
        }
        state.objects.entry(key.clone()).or_default().apply(&effect);
        state.log.entry(key.clone()).or_default().push((effect, actor));
        Ok(())
    }
}

// =============================================================================
// Topology
// =============================================================================

/// Topology with a fixed local id and a replaceable peer set.
pub struct StaticTopology {
    local: ReplicaId,
    peers: Mutex<BTreeSet<ReplicaId>>,
}

impl StaticTopology {
    pub fn new<I, R>(local: impl Into<ReplicaId>, peers: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ReplicaId>,
    {
        Self {
            local: local.into(),
            peers: Mutex::new(peers.into_iter().map(Into::into).collect()),
        }
    }

    /// Replace the peer set, as a membership change would.
    pub fn set_peers<I, R>(&self, peers: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<ReplicaId>,
    {
        *self.peers.lock() = peers.into_iter().map(Into::into).collect();
    }
}

impl TopologyEffects for StaticTopology {
    fn local_replica_id(&self) -> ReplicaId {
        self.local.clone()
    }

    fn peer_replica_ids(&self) -> BTreeSet<ReplicaId> {
        self.peers.lock().clone()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A transfer request observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransfer {
    pub donor: ReplicaId,
    pub key: ResourceKey,
    pub operation: TransferOperation,
}

/// Routes transfer requests to registered coordinators and records them.
///
/// Requests to donors without a registered handle are recorded and reported
/// as delivered.
pub struct MemoryTransport<B: BoundedCounterCrdt> {
    routes: Mutex<BTreeMap<ReplicaId, CoordinatorHandle<B>>>,
    unreachable: Mutex<BTreeSet<ReplicaId>>,
    sent: Mutex<Vec<SentTransfer>>,
}

impl<B: BoundedCounterCrdt> Default for MemoryTransport<B> {
    fn default() -> Self {
        Self {
            routes: Mutex::new(BTreeMap::new()),
            unreachable: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl<B: BoundedCounterCrdt> MemoryTransport<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver requests addressed to `replica` to `handle`.
    pub fn register(&self, replica: ReplicaId, handle: CoordinatorHandle<B>) {
        self.routes.lock().insert(replica, handle);
    }

    pub fn set_unreachable(&self, replica: ReplicaId, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(replica);
        } else {
            set.remove(&replica);
        }
    }

    /// Every request attempted so far, including undeliverable ones.
    pub fn sent(&self) -> Vec<SentTransfer> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl<B: BoundedCounterCrdt> TransferTransportEffects for MemoryTransport<B> {
    async fn request_transfer(
        &self,
        donor: &ReplicaId,
        key: &ResourceKey,
        operation: TransferOperation,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(SentTransfer {
            donor: donor.clone(),
            key: key.clone(),
            operation: operation.clone(),
        });

        if self.unreachable.lock().contains(donor) {
            return Err(TransportError::PeerUnreachable(donor.clone()));
        }
        let route = self.routes.lock().get(donor).cloned();
        match route {
            Some(handle) => handle
                .request_transfer(key.clone(), operation)
                .map_err(|e| TransportError::Rejected {
                    peer: donor.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Clocks
// =============================================================================

/// Clock whose time only moves when told to.
///
/// Sleeps use the default Tokio timer, so paused-clock tests drive them.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now_ms: AtomicU64::new(start.as_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> Timestamp {
        Timestamp(self.now_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl PhysicalClockEffects for ManualClock {
    async fn physical_time(&self) -> Timestamp {
        self.now()
    }
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl PhysicalClockEffects for SystemClock {
    #[allow(clippy::disallowed_methods)]
    async fn physical_time(&self) -> Timestamp {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Timestamp(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_transfer_conserves_total() {
        let mut ledger = PermissionLedger::from_allocations([("dc1", 7), ("dc2", 3)]);
        ledger.apply(&LedgerEffect::Transfer {
            source: "dc1".into(),
            target: "dc2".into(),
            amount: 5,
        });

        assert_eq!(ledger.available(&"dc1".into()), 2);
        assert_eq!(ledger.available(&"dc2".into()), 8);
        assert_eq!(ledger.total(), 10);
    }

    #[test]
    fn decrement_beyond_local_share_is_refused() {
        let ledger = PermissionLedger::from_allocations([("dc1", 2), ("dc2", 30)]);
        let result = PermissionLedgerCounter::generate_downstream(
            &CounterOperation::Decrement(5),
            &"dc1".into(),
            &ledger,
        );

        assert_eq!(
            result,
            Err(CounterError::InsufficientPermissions {
                requested: 5,
                available: 2
            })
        );
    }

    #[tokio::test]
    async fn store_applies_appended_effects() {
        let store = MemoryCounterStore::new();
        let key = ResourceKey::from("stock");
        store.set_allocations(key.clone(), [("dc1", 4)]);

        CounterStoreEffects::<PermissionLedgerCounter>::append(
            &store,
            &key,
            LedgerEffect::Decrement {
                replica: "dc1".into(),
                amount: 3,
            },
            ActorTag::Client("alice".into()),
        )
        .await
        .unwrap();

        assert_eq!(store.available(&key, &"dc1".into()), 1);
        assert_eq!(store.appended(&key).len(), 1);
    }

    #[tokio::test]
    async fn injected_read_failure_is_reported() {
        let store = MemoryCounterStore::new();
        let key = ResourceKey::from("stock");
        store.fail_reads_for(key.clone(), true);

        let result = CounterStoreEffects::<PermissionLedgerCounter>::read(&store, &key).await;
        assert!(matches!(result, Err(StoreError::ReadFailed { .. })));
    }

    #[tokio::test]
    async fn system_clock_reports_unix_millis() {
        // 2020-09-13, well before any plausible test run.
        let floor = Timestamp(1_600_000_000_000);

        let first = SystemClock.physical_time().await;
        let second = SystemClock.physical_time().await;

        assert!(first > floor);
        assert!(second >= first);
    }

    #[test]
    fn topology_peer_set_can_change() {
        let topology = StaticTopology::new("dc1", ["dc2"]);
        topology.set_peers(["dc2", "dc3"]);

        assert_eq!(topology.local_replica_id(), ReplicaId::from("dc1"));
        assert_eq!(topology.peer_replica_ids().len(), 2);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Timestamp(100));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp(350));
    }
}
