//! Timer-driven rebalancing on a paused Tokio clock.

use async_trait::async_trait;
use aura_bounded_counter::prelude::*;
use aura_bounded_counter::{PhysicalClockEffects, StoreError, Timestamp};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store whose reads take `latency` and which tracks read concurrency.
struct SlowStore {
    inner: Arc<MemoryCounterStore>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    reads: AtomicUsize,
}

impl SlowStore {
    fn new(inner: Arc<MemoryCounterStore>, latency: Duration) -> Self {
        Self {
            inner,
            latency,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CounterStoreEffects<PermissionLedgerCounter> for SlowStore {
    async fn read(&self, key: &ResourceKey) -> Result<PermissionLedger, StoreError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.reads.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.latency).await;
        let result =
            CounterStoreEffects::<PermissionLedgerCounter>::read(self.inner.as_ref(), key).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn append(
        &self,
        key: &ResourceKey,
        effect: LedgerEffect,
        actor: ActorTag,
    ) -> Result<(), StoreError> {
        CounterStoreEffects::<PermissionLedgerCounter>::append(
            self.inner.as_ref(),
            key,
            effect,
            actor,
        )
        .await
    }
}

/// Clock that records every timer it is asked to run.
#[derive(Default)]
struct RecordingClock {
    inner: ManualClock,
    sleeps: Mutex<Vec<u64>>,
}

#[async_trait]
impl PhysicalClockEffects for RecordingClock {
    async fn physical_time(&self) -> Timestamp {
        self.inner.now()
    }

    async fn sleep_ms(&self, ms: u64) {
        self.sleeps.lock().push(ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn effects(
    store: Arc<dyn CounterStoreEffects<PermissionLedgerCounter>>,
    transport: Arc<MemoryTransport<PermissionLedgerCounter>>,
) -> CoordinatorEffects<PermissionLedgerCounter> {
    CoordinatorEffects {
        store,
        topology: Arc::new(StaticTopology::new("dc1", ["dc2"])),
        transport,
        clock: Arc::new(ManualClock::new(Timestamp(0))),
    }
}

#[tokio::test(start_paused = true)]
async fn deficits_are_requested_without_an_explicit_pass() {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryCounterStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let key = ResourceKey::from("stock");
    store.set_allocations(key.clone(), [("dc1", 0), ("dc2", 10)]);

    let config = BoundedCounterConfig::default();
    let (handle, _task) =
        BoundedCounterCoordinator::spawn(config, effects(store.clone(), transport.clone()))
            .unwrap();

    let _ = handle
        .apply_operation(key.clone(), CounterOperation::Decrement(4), store.snapshot(&key))
        .await;
    assert!(transport.sent().is_empty());

    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].operation, TransferOperation::new("dc2".into(), "dc1".into(), 4));
    assert_eq!(handle.stats().await.unwrap().rebalance_passes, 1);
    assert_eq!(handle.pending_deficit(key).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn slow_passes_never_overlap() {
    let _ = tracing_subscriber::fmt::try_init();
    let inner = Arc::new(MemoryCounterStore::new());
    let key = ResourceKey::from("stock");
    // No peer holds anything, so the deficit stays queued and every pass reads.
    inner.set_allocations(key.clone(), [("dc1", 0), ("dc2", 0)]);
    let store = Arc::new(SlowStore::new(inner.clone(), Duration::from_secs(3)));

    let config = BoundedCounterConfig::default().with_rebalance_period(Duration::from_secs(1));
    let (handle, _task) = BoundedCounterCoordinator::spawn(
        config,
        effects(store.clone(), Arc::new(MemoryTransport::new())),
    )
    .unwrap();

    let _ = handle
        .apply_operation(key.clone(), CounterOperation::Decrement(2), inner.snapshot(&key))
        .await;
    // A manual pass queued behind the timer-driven ones.
    let manual = handle.rebalance_now();

    let (report, ()) = tokio::join!(manual, tokio::time::sleep(Duration::from_millis(20_500)));
    let report = report.unwrap();

    assert_eq!(report.residuals[&key], 2);
    assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);

    let stats = handle.stats().await.unwrap();
    let reads = store.reads.load(Ordering::SeqCst) as u64;
    assert_eq!(stats.rebalance_passes, reads);
    // Each pass spends three seconds reading and waits one second after it ends.
    assert!(stats.rebalance_passes <= 6, "passes: {}", stats.rebalance_passes);
    assert_eq!(handle.pending_deficit(key).await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn timer_is_armed_through_the_clock_effect() {
    let store = Arc::new(MemoryCounterStore::new());
    let clock = Arc::new(RecordingClock::default());
    let mut wiring = effects(store, Arc::new(MemoryTransport::new()));
    wiring.clock = clock.clone();

    let config = BoundedCounterConfig::default().with_rebalance_period(Duration::from_secs(2));
    let (handle, _task) = BoundedCounterCoordinator::spawn(config, wiring).unwrap();

    tokio::time::sleep(Duration::from_millis(4_500)).await;
    let stats = handle.stats().await.unwrap();

    assert_eq!(stats.rebalance_passes, 2);
    assert_eq!(*clock.sleeps.lock(), vec![2_000, 2_000, 2_000]);
}
