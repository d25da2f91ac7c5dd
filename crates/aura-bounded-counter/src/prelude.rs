//! Aura bounded counter prelude.
//!
//! Curated re-exports for wiring a coordinator into a write path.

pub use crate::memory::{
    LedgerEffect, ManualClock, MemoryCounterStore, MemoryTransport, PermissionLedger,
    PermissionLedgerCounter, StaticTopology, SystemClock,
};
pub use crate::{
    ActorTag, BoundedCounterConfig, BoundedCounterCoordinator, BoundedCounterCrdt,
    CoordinatorEffects, CoordinatorError, CoordinatorHandle, CounterOperation,
    CounterStoreEffects, RebalanceReport, ReplicaId, ResourceKey, TransferOperation,
};
