//! # Bounded Counter Coordinator
//!
//! Per-replica actor that admits bounded-counter operations and moves
//! permissions between replicas when the local share runs out.
//!
//! The coordinator is a single Tokio task that owns the pending deficit queue
//! and the transfer grace-period table. Nothing else can reach that state:
//! callers hold a [`CoordinatorHandle`] and talk to the task over its command
//! channel, so every mutation happens inside one message loop.
//!
//! Three kinds of message reach the loop:
//! - calls ([`CoordinatorHandle::apply_operation`] and the inspection calls),
//!   answered over a oneshot channel
//! - casts ([`CoordinatorHandle::request_transfer`]), fire-and-forget
//! - the rebalance timer
//!
//! The timer is rearmed only once a rebalance pass has finished, so at most one
//! pass is ever in flight.
//!
//! ## Example
//!
//! ```ignore
//! let (handle, task) = BoundedCounterCoordinator::spawn(config, effects)?;
//!
//! match handle.apply_operation(key, CounterOperation::Decrement(3), snapshot).await {
//!     Ok(effect) => store.append(&key, effect, actor).await?,
//!     Err(CoordinatorError::InsufficientPermissions { .. }) => {
//!         // Deficit is queued; a later pass asks peers for permissions.
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use crate::config::BoundedCounterConfig;
use crate::effects::{BoundedCounterCrdt, CoordinatorEffects};
use crate::errors::{ConfigError, CoordinatorError, CounterError};
use crate::grace::GracePeriodTracker;
use crate::pending::PendingRequestQueue;
use crate::preference::{build_preference_list, plan_transfers};
use crate::transfer::{TransferExecutor, TransferOutcome};
use crate::types::{
    CounterOperation, ReplicaId, ResourceKey, TransferOperation, TransferRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Counters describing what the coordinator has done since it started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub operations_admitted: u64,
    pub operations_rejected: u64,
    pub transfers_applied: u64,
    pub transfers_suppressed: u64,
    pub transfers_rejected: u64,
    pub transfer_store_failures: u64,
    pub transfer_requests_sent: u64,
    pub transfer_request_failures: u64,
    pub rebalance_passes: u64,
    pub rebalance_read_failures: u64,
}

/// Summary of one rebalance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Transfer requests delivered to donors, per key, in issue order.
    pub requests: BTreeMap<ResourceKey, Vec<TransferRequest>>,
    /// Deficits still queued after the pass.
    pub residuals: BTreeMap<ResourceKey, u64>,
    /// Keys skipped because their counter could not be read.
    pub failed_keys: Vec<ResourceKey>,
    /// Grace-period records swept at the start of the pass.
    pub swept_transfers: usize,
    /// Deficit dropped because it exceeded the maximum pending age.
    pub expired_deficit: u64,
}

impl RebalanceReport {
    pub fn total_requested(&self) -> u64 {
        self.requests
            .values()
            .flat_map(|requests| requests.iter().map(|r| r.amount))
            .sum()
    }
}

enum Command<B: BoundedCounterCrdt> {
    Apply {
        key: ResourceKey,
        operation: CounterOperation,
        snapshot: B::Snapshot,
        reply: oneshot::Sender<Result<B::Effect, CoordinatorError>>,
    },
    Transfer {
        key: ResourceKey,
        operation: TransferOperation,
    },
    Rebalance {
        reply: oneshot::Sender<RebalanceReport>,
    },
    PendingDeficit {
        key: ResourceKey,
        reply: oneshot::Sender<u64>,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
    Shutdown,
}

/// Cloneable handle to a running [`BoundedCounterCoordinator`].
pub struct CoordinatorHandle<B: BoundedCounterCrdt> {
    local: ReplicaId,
    commands: mpsc::Sender<Command<B>>,
}

impl<B: BoundedCounterCrdt> Clone for CoordinatorHandle<B> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            commands: self.commands.clone(),
        }
    }
}

impl<B: BoundedCounterCrdt> fmt::Debug for CoordinatorHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("local", &self.local)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<B: BoundedCounterCrdt> CoordinatorHandle<B> {
    /// Replica this coordinator acts for.
    pub fn local_replica(&self) -> &ReplicaId {
        &self.local
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Generate the downstream effect of `operation` against `snapshot`.
    ///
    /// Increments and decrements the local replica cannot cover fail with
    /// [`CoordinatorError::InsufficientPermissions`]; the shortfall is queued
    /// for the next rebalance pass before the error is returned. Whether to
    /// retry or abort the write is up to the caller.
    pub async fn apply_operation(
        &self,
        key: ResourceKey,
        operation: CounterOperation,
        snapshot: B::Snapshot,
    ) -> Result<B::Effect, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Apply {
                key,
                operation,
                snapshot,
                reply,
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        response.await.map_err(|_| CoordinatorError::Stopped)?
    }

    /// Ask this replica to apply a transfer of its own permissions.
    ///
    /// Never waits: the request is dropped with [`CoordinatorError::Overloaded`]
    /// when the mailbox is full.
    pub fn request_transfer(
        &self,
        key: ResourceKey,
        operation: TransferOperation,
    ) -> Result<(), CoordinatorError> {
        self.commands
            .try_send(Command::Transfer { key, operation })
            .map_err(|e| match e {
                TrySendError::Full(_) => CoordinatorError::Overloaded,
                TrySendError::Closed(_) => CoordinatorError::Stopped,
            })
    }

    /// Run a rebalance pass now, serialized with the timer-driven passes.
    pub async fn rebalance_now(&self) -> Result<RebalanceReport, CoordinatorError> {
        self.call(|reply| Command::Rebalance { reply }).await
    }

    /// Total deficit currently queued for `key`.
    pub async fn pending_deficit(&self, key: ResourceKey) -> Result<u64, CoordinatorError> {
        self.call(|reply| Command::PendingDeficit { key, reply }).await
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, CoordinatorError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Stop the coordinator after the messages already queued ahead of this one.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command<B>,
    ) -> Result<T, CoordinatorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| CoordinatorError::Stopped)?;
        response.await.map_err(|_| CoordinatorError::Stopped)
    }
}

/// Serialized actor owning the deficit queue and the grace-period table.
pub struct BoundedCounterCoordinator<B: BoundedCounterCrdt> {
    config: BoundedCounterConfig,
    local: ReplicaId,
    effects: CoordinatorEffects<B>,
    executor: TransferExecutor<B>,
    grace: GracePeriodTracker,
    pending: PendingRequestQueue,
    stats: CoordinatorStats,
    commands: mpsc::Receiver<Command<B>>,
}

impl<B: BoundedCounterCrdt> BoundedCounterCoordinator<B> {
    /// Create a coordinator and its handle. The coordinator does nothing
    /// until [`run`](Self::run) is polled.
    ///
    /// Fails if `config` does not pass [`BoundedCounterConfig::validate`].
    pub fn new(
        config: BoundedCounterConfig,
        effects: CoordinatorEffects<B>,
    ) -> Result<(Self, CoordinatorHandle<B>), ConfigError> {
        config.validate()?;
        let local = effects.topology.local_replica_id();
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let coordinator = Self {
            executor: TransferExecutor::new(local.clone(), effects.store.clone()),
            grace: GracePeriodTracker::new(local.clone(), config.grace_period()),
            pending: PendingRequestQueue::new(),
            stats: CoordinatorStats::default(),
            commands: command_rx,
            local: local.clone(),
            effects,
            config,
        };
        let handle = CoordinatorHandle {
            local,
            commands: command_tx,
        };
        Ok((coordinator, handle))
    }

    /// Create a coordinator and run it on the current Tokio runtime.
    pub fn spawn(
        config: BoundedCounterConfig,
        effects: CoordinatorEffects<B>,
    ) -> Result<(CoordinatorHandle<B>, JoinHandle<()>), ConfigError> {
        let (coordinator, handle) = Self::new(config, effects)?;
        let task = tokio::spawn(coordinator.run());
        Ok((handle, task))
    }

    /// Message loop. Returns on [`CoordinatorHandle::shutdown`] or once every
    /// handle has been dropped.
    pub async fn run(mut self) {
        tracing::info!(
            replica = %self.local,
            rebalance_period = ?self.config.rebalance_period(),
            grace_period = ?self.config.grace_period(),
            "bounded counter coordinator starting"
        );

        // Effect-based sleep so a simulated clock controls the timer.
        let clock = self.effects.clock.clone();
        let period_ms = self.config.rebalance_period_ms;
        let mut timer = clock.sleep_ms(period_ms);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                () = &mut timer => {
                    let report = self.periodic_rebalance().await;
                    log_report(&self.local, &report);
                    timer = clock.sleep_ms(period_ms);
                }
            }
        }

        tracing::info!(replica = %self.local, "bounded counter coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command<B>) {
        match command {
            Command::Apply {
                key,
                operation,
                snapshot,
                reply,
            } => {
                let result = self.apply_operation(key, operation, snapshot).await;
                let _ = reply.send(result);
            }
            Command::Transfer { key, operation } => {
                self.execute_transfer(key, operation).await;
            }
            Command::Rebalance { reply } => {
                let report = self.periodic_rebalance().await;
                let _ = reply.send(report);
            }
            Command::PendingDeficit { key, reply } => {
                let _ = reply.send(self.pending.required_sum(&key));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats.clone());
            }
            Command::Shutdown => {}
        }
    }

    async fn apply_operation(
        &mut self,
        key: ResourceKey,
        operation: CounterOperation,
        snapshot: B::Snapshot,
    ) -> Result<B::Effect, CoordinatorError> {
        let result = B::generate_downstream(&operation, &self.local, &snapshot);
        if !operation.requires_permissions() {
            return result.map_err(CoordinatorError::from);
        }

        match result {
            Ok(effect) => {
                self.stats.operations_admitted += 1;
                Ok(effect)
            }
            Err(CounterError::InsufficientPermissions {
                requested,
                available,
            }) => {
                let deficit = requested.saturating_sub(available);
                let now = self.effects.clock.physical_time().await;
                self.pending.enqueue(key.clone(), deficit, now);
                self.stats.operations_rejected += 1;
                tracing::debug!(
                    key = %key,
                    operation = operation.kind(),
                    requested,
                    available,
                    deficit,
                    "queued permission deficit"
                );
                Err(CoordinatorError::InsufficientPermissions {
                    key,
                    requested,
                    available,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute_transfer(&mut self, key: ResourceKey, operation: TransferOperation) {
        let now = self.effects.clock.physical_time().await;
        let outcome = self
            .executor
            .execute(&mut self.grace, &key, operation, now)
            .await;
        match outcome {
            TransferOutcome::Applied => self.stats.transfers_applied += 1,
            TransferOutcome::SuppressedSelfTarget | TransferOutcome::SuppressedGracePeriod => {
                self.stats.transfers_suppressed += 1;
            }
            TransferOutcome::Rejected(_) => self.stats.transfers_rejected += 1,
            TransferOutcome::StoreFailed(_) => self.stats.transfer_store_failures += 1,
        }
    }

    /// One rebalance pass over every key with a queued deficit.
    ///
    /// For each key: read the counter, rank peers by availability, ask donors
    /// greedily for `min(remaining, available)` and collapse the queue to
    /// whatever could not be requested. A failed read skips the key for this
    /// pass only.
    async fn periodic_rebalance(&mut self) -> RebalanceReport {
        let now = self.effects.clock.physical_time().await;
        let mut report = RebalanceReport {
            swept_transfers: self.grace.sweep(now),
            ..RebalanceReport::default()
        };
        if let Some(max_age) = self.config.max_pending_age() {
            report.expired_deficit = self.pending.expire_older_than(max_age, now);
        }
        self.stats.rebalance_passes += 1;

        let peers = self.effects.topology.peer_replica_ids();
        for key in self.pending.keys() {
            let required = self.pending.required_sum(&key);

            let snapshot = match self.effects.store.read(&key).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping rebalance for key");
                    self.stats.rebalance_read_failures += 1;
                    report.failed_keys.push(key);
                    continue;
                }
            };

            let preferences = build_preference_list::<B>(&self.local, &peers, &snapshot);
            let plan = plan_transfers(required, &preferences);
            let mut residual = plan.residual;

            for request in plan.requests {
                let operation = TransferOperation::new(
                    request.donor.clone(),
                    self.local.clone(),
                    request.amount,
                );
                match self
                    .effects
                    .transport
                    .request_transfer(&request.donor, &key, operation)
                    .await
                {
                    Ok(()) => {
                        self.stats.transfer_requests_sent += 1;
                        tracing::debug!(
                            key = %key,
                            donor = %request.donor,
                            amount = request.amount,
                            "requested permissions"
                        );
                        report.requests.entry(key.clone()).or_default().push(request);
                    }
                    Err(e) => {
                        self.stats.transfer_request_failures += 1;
                        tracing::warn!(
                            key = %key,
                            donor = %request.donor,
                            amount = request.amount,
                            error = %e,
                            "failed to request permissions"
                        );
                        residual = residual.saturating_add(request.amount);
                    }
                }
            }

            self.pending.replace_with_residual(&key, residual, now);
            if residual > 0 {
                report.residuals.insert(key, residual);
            }
        }

        report
    }
}

fn log_report(local: &ReplicaId, report: &RebalanceReport) {
    if report.requests.is_empty() && report.failed_keys.is_empty() {
        tracing::trace!(replica = %local, "rebalance pass found nothing to do");
        return;
    }
    tracing::info!(
        replica = %local,
        keys = report.requests.len(),
        requested = report.total_requested(),
        residual_keys = report.residuals.len(),
        failed_keys = report.failed_keys.len(),
        "rebalance pass complete"
    );
}
