#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
#![allow(missing_docs)]
//! # Aura Bounded Counter - Permission Coordination
//!
//! A bounded counter lets each replica decrement only up to the permissions it
//! owns locally. This crate provides the per-replica coordinator that sits in
//! front of the counter's write path:
//! - Admits increments and decrements that the local share can cover
//! - Queues the shortfall of operations it cannot cover
//! - Periodically asks peers with spare permissions to transfer them here
//! - Applies inbound transfer requests, suppressing duplicates per grace period
//!
//! ## Design Principles
//!
//! - **Serialized Actor**: one Tokio task owns all mutable state; callers hold a
//!   [`CoordinatorHandle`]
//! - **Effect Seams**: store, topology, transport and clock are injected traits
//!   (see [`effects`]); in-memory handlers live in [`memory`]
//! - **Best Effort**: failed reads, appends and deliveries are logged and retried
//!   by the next rebalance pass; nothing is fatal to the coordinator

pub mod config;
pub mod coordinator;
pub mod effects;
pub mod errors;
pub mod grace;
pub mod memory;
pub mod pending;
pub mod preference;
pub mod prelude;
pub mod transfer;
pub mod types;

pub use config::BoundedCounterConfig;
pub use coordinator::{
    BoundedCounterCoordinator, CoordinatorHandle, CoordinatorStats, RebalanceReport,
};
pub use effects::{
    BoundedCounterCrdt, CoordinatorEffects, CounterStoreEffects, PhysicalClockEffects,
    TopologyEffects, TransferTransportEffects,
};
pub use errors::{ConfigError, CoordinatorError, CounterError, StoreError, TransportError};
pub use grace::GracePeriodTracker;
pub use pending::PendingRequestQueue;
pub use preference::{build_preference_list, plan_transfers, TransferPlan};
pub use transfer::{TransferExecutor, TransferOutcome};
pub use types::{
    ActorTag, CounterOperation, PendingRequest, PreferenceEntry, ReplicaId, ResourceKey,
    Timestamp, TransferOperation, TransferRequest,
};
