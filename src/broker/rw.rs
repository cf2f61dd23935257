//! Running-Work recomputation against the live task table.
//!
//! The metadata carries seed per-cloud accumulators computed by the caller;
//! this pass folds in the current assignment of every peer task so the
//! decision sees committed load as of now. `rws` counts peers at or above
//! this task's priority within the same process group; `full_rws` counts
//! every assigned peer and feeds the storage-headroom calculation.

use std::collections::HashMap;

use crate::broker::metadata::TaskMetadata;
use crate::external::TaskStore;
use crate::process_group::process_group;

/// Recomputed per-cloud Running-Work totals.
#[derive(Debug, Clone, Default)]
pub struct RwTotals {
    /// Peer load at or above self priority, same process group.
    pub rws: HashMap<String, f64>,
    /// Total committed peer load.
    pub full_rws: HashMap<String, f64>,
}

impl RwTotals {
    /// Ensures both accumulators carry an entry for `cloud`.
    pub fn ensure_cloud(&mut self, cloud: &str) {
        self.rws.entry(cloud.to_string()).or_insert(0.0);
        self.full_rws.entry(cloud.to_string()).or_insert(0.0);
    }

    /// RW for a cloud, defaulting to zero.
    #[must_use]
    pub fn rw(&self, cloud: &str) -> f64 {
        self.rws.get(cloud).copied().unwrap_or(0.0)
    }

    /// Full RW for a cloud, defaulting to zero.
    #[must_use]
    pub fn full_rw(&self, cloud: &str) -> f64 {
        self.full_rws.get(cloud).copied().unwrap_or(0.0)
    }
}

/// Recomputes the per-cloud accumulators from the peer task table.
///
/// Peer-lookup failures are swallowed and skipped: a single unreadable peer
/// degrades accuracy, not the decision. Peers without a priority entry, or
/// outside this task's process group, contribute to `full_rws` only.
pub async fn recompute(store: &dyn TaskStore, task_id: u64, meta: &TaskMetadata) -> RwTotals {
    let mut totals = RwTotals {
        rws: meta.rws.clone(),
        full_rws: meta.full_rws.clone(),
    };
    let my_priority = meta.prio_map.get(&task_id).copied();
    let my_group = process_group(meta.own_group_type(task_id));

    for (&other_id, &exp_rw) in &meta.exp_rws {
        if other_id == task_id {
            continue;
        }
        let assigned = match store.see_cloud_task(other_id).await {
            Ok(cloud) => cloud,
            Err(err) => {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    peer = other_id,
                    error = %err,
                    "peer lookup failed, skipping"
                );
                continue;
            }
        };
        if assigned.is_empty() {
            continue;
        }
        *totals.full_rws.entry(assigned.clone()).or_insert(0.0) += exp_rw;
        let Some(other_priority) = meta.prio_map.get(&other_id) else {
            continue;
        };
        if my_priority.is_some_and(|mine| *other_priority < mine) {
            continue;
        }
        let other_group = meta
            .task_group_map
            .get(&other_id)
            .map_or("", |t| process_group(t));
        if other_group != my_group {
            continue;
        }
        *totals.rws.entry(assigned).or_insert(0.0) += exp_rw;
    }
    totals
}
