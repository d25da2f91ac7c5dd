//! Per-key backlog of unmet permission deficits.

use crate::types::{PendingRequest, ResourceKey, Timestamp};
use std::collections::BTreeMap;
use std::time::Duration;

/// Deficits waiting for a rebalance pass, keyed by resource.
///
/// A key with no entry is satisfied. Entries only ever hold positive
/// deficits; order within a key is insertion order but only the sum matters.
#[derive(Debug, Clone, Default)]
pub struct PendingRequestQueue {
    requests: BTreeMap<ResourceKey, Vec<PendingRequest>>,
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `deficit` for `key`. Zero deficits are ignored.
    pub fn enqueue(&mut self, key: ResourceKey, deficit: u64, now: Timestamp) {
        if deficit == 0 {
            return;
        }
        self.requests.entry(key).or_default().push(PendingRequest {
            deficit,
            enqueued_at: now,
        });
    }

    /// Sum of every queued deficit for `key`, saturating at `u64::MAX`.
    pub fn required_sum(&self, key: &ResourceKey) -> u64 {
        self.requests
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .fold(0u64, |sum, r| sum.saturating_add(r.deficit))
            })
            .unwrap_or(0)
    }

    /// Collapse the backlog of `key` into a single residual request.
    ///
    /// The residual keeps the oldest enqueue time of the entries it replaces.
    /// A zero residual removes the key.
    pub fn replace_with_residual(&mut self, key: &ResourceKey, residual: u64, now: Timestamp) {
        if residual == 0 {
            self.requests.remove(key);
            return;
        }
        let enqueued_at = self
            .requests
            .get(key)
            .and_then(|entries| entries.iter().map(|r| r.enqueued_at).min())
            .unwrap_or(now);
        self.requests.insert(
            key.clone(),
            vec![PendingRequest {
                deficit: residual,
                enqueued_at,
            }],
        );
    }

    /// Discard requests queued at least `max_age` before `now`.
    ///
    /// Returns the total deficit dropped.
    pub fn expire_older_than(&mut self, max_age: Duration, now: Timestamp) -> u64 {
        let mut dropped: u64 = 0;
        self.requests.retain(|_, entries| {
            entries.retain(|r| {
                let expired = now.elapsed_since(r.enqueued_at) >= max_age;
                if expired {
                    dropped = dropped.saturating_add(r.deficit);
                }
                !expired
            });
            !entries.is_empty()
        });
        dropped
    }

    /// Keys that currently carry a deficit.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.requests.keys().cloned().collect()
    }

    pub fn entries(&self, key: &ResourceKey) -> &[PendingRequest] {
        self.requests.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
