//! Donor ranking and the greedy transfer plan.

use crate::effects::BoundedCounterCrdt;
use crate::types::{PreferenceEntry, ReplicaId, TransferRequest};
use std::collections::BTreeSet;

/// Rank every peer except `local` by the permissions it has available.
///
/// The list is sorted ascending by availability, ties broken by replica id,
/// so the smallest surplus holders are drained first and a deficit is spread
/// across many donors instead of exhausting one. Peers with nothing available
/// are kept in the list.
pub fn build_preference_list<B: BoundedCounterCrdt>(
    local: &ReplicaId,
    peers: &BTreeSet<ReplicaId>,
    snapshot: &B::Snapshot,
) -> Vec<PreferenceEntry> {
    let mut entries: Vec<PreferenceEntry> = peers
        .iter()
        .filter(|peer| *peer != local)
        .map(|peer| PreferenceEntry {
            replica: peer.clone(),
            available: B::available_permissions(peer, snapshot),
        })
        .collect();
    entries.sort_by(|a, b| {
        a.available
            .cmp(&b.available)
            .then_with(|| a.replica.cmp(&b.replica))
    });
    entries
}

/// Result of walking a preference list for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    pub requests: Vec<TransferRequest>,
    /// Part of the deficit no donor could cover.
    pub residual: u64,
}

/// Greedily cover `required` from `preferences` in order.
///
/// Each donor is asked for `min(remaining, available)`; donors with nothing
/// available are skipped and no donor is asked for more than it reported.
pub fn plan_transfers(required: u64, preferences: &[PreferenceEntry]) -> TransferPlan {
    let mut remaining = required;
    let mut requests = Vec::new();

    for entry in preferences {
        if remaining == 0 {
            break;
        }
        if entry.available == 0 {
            continue;
        }
        let amount = remaining.min(entry.available);
        requests.push(TransferRequest {
            donor: entry.replica.clone(),
            amount,
        });
        remaining -= amount;
    }

    TransferPlan {
        requests,
        residual: remaining,
    }
}
