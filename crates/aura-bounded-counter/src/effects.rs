//! Effect traits for the collaborators the coordinator consumes.
//!
//! The coordinator never talks to storage, the network or the clock directly.
//! Each concern sits behind one of these traits so that production handlers
//! and the in-memory handlers in [`crate::memory`] are interchangeable.
//!
//! - [`BoundedCounterCrdt`]: counter arithmetic (downstream effects, availability)
//! - [`CounterStoreEffects`]: causal reads and effect appends on the object store
//! - [`TopologyEffects`]: local replica identity and the current peer set
//! - [`TransferTransportEffects`]: delivery of transfer requests to donors
//! - [`PhysicalClockEffects`]: wall-clock time for grace periods and queue ages

use crate::errors::{CounterError, StoreError, TransportError};
use crate::types::{
    ActorTag, CounterOperation, ReplicaId, ResourceKey, Timestamp, TransferOperation,
};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Arithmetic of the replicated bounded counter.
///
/// Implementations are pure: they inspect a snapshot and produce an effect
/// without touching the store.
pub trait BoundedCounterCrdt: Send + Sync + 'static {
    /// Causal snapshot of one counter object.
    type Snapshot: Send + Sync + 'static;
    /// Replica-independent effect that converges all replicas.
    type Effect: Clone + fmt::Debug + Send + Sync + 'static;

    /// Produce the downstream effect of `operation` issued at `local`.
    ///
    /// Returns [`CounterError::InsufficientPermissions`] when `local` does not
    /// own enough permissions for the operation.
    fn generate_downstream(
        operation: &CounterOperation,
        local: &ReplicaId,
        snapshot: &Self::Snapshot,
    ) -> Result<Self::Effect, CounterError>;

    /// Permissions currently owned by `replica` according to `snapshot`.
    fn available_permissions(replica: &ReplicaId, snapshot: &Self::Snapshot) -> u64;
}

/// Replicated object store holding bounded-counter objects.
#[async_trait]
pub trait CounterStoreEffects<B: BoundedCounterCrdt>: Send + Sync {
    async fn read(&self, key: &ResourceKey) -> Result<B::Snapshot, StoreError>;

    async fn append(
        &self,
        key: &ResourceKey,
        effect: B::Effect,
        actor: ActorTag,
    ) -> Result<(), StoreError>;
}

/// Replica identity and topology metadata.
pub trait TopologyEffects: Send + Sync {
    fn local_replica_id(&self) -> ReplicaId;

    /// Known peer replicas. May or may not include the local replica.
    fn peer_replica_ids(&self) -> BTreeSet<ReplicaId>;
}

/// Delivery of transfer requests to donor replicas.
#[async_trait]
pub trait TransferTransportEffects: Send + Sync {
    /// Ask `donor` to apply `operation` for `key`.
    async fn request_transfer(
        &self,
        donor: &ReplicaId,
        key: &ResourceKey,
        operation: TransferOperation,
    ) -> Result<(), TransportError>;
}

/// Wall-clock time source and timer.
#[async_trait]
pub trait PhysicalClockEffects: Send + Sync {
    async fn physical_time(&self) -> Timestamp;

    /// Suspend the caller for `ms` milliseconds.
    ///
    /// The coordinator's rebalance timer runs through this, so a simulated
    /// clock controls when passes fire.
    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// Handlers the coordinator is constructed with.
pub struct CoordinatorEffects<B: BoundedCounterCrdt> {
    pub store: Arc<dyn CounterStoreEffects<B>>,
    pub topology: Arc<dyn TopologyEffects>,
    pub transport: Arc<dyn TransferTransportEffects>,
    pub clock: Arc<dyn PhysicalClockEffects>,
}

impl<B: BoundedCounterCrdt> Clone for CoordinatorEffects<B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            topology: self.topology.clone(),
            transport: self.transport.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<B: BoundedCounterCrdt> fmt::Debug for CoordinatorEffects<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorEffects")
            .field("store", &"<Arc<dyn CounterStoreEffects>>")
            .field("topology", &"<Arc<dyn TopologyEffects>>")
            .field("transport", &"<Arc<dyn TransferTransportEffects>>")
            .field("clock", &"<Arc<dyn PhysicalClockEffects>>")
            .finish()
    }
}
