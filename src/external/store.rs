//! Task store seam: claim rows, peer assignments, pilot statistics.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::broker::task::CloudTask;
use crate::error::BrokerError;

/// Pilot activity counters for one site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PilotCounts {
    /// Job-get requests seen recently.
    pub get_job: u64,
    /// Job-update requests seen recently.
    pub update_job: u64,
}

impl PilotCounts {
    /// Combined pilot activity for load weighting.
    #[must_use]
    pub const fn total(self) -> u64 {
        self.get_job + self.update_job
    }
}

/// Access to the persisted task state shared between assigner instances.
///
/// Commits to the claim table are serialised per task by the backing store:
/// a second concurrent commit for the same task either observes `assigned`
/// and backs off, or is rejected.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Loads the cloud-task claim row, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on a store read failure.
    async fn get_cloud_task(&self, task_id: u64) -> Result<Option<CloudTask>, BrokerError>;

    /// Persists the claim row, flipping it to `assigned`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] when the write is rejected.
    async fn set_cloud_task(&self, row: CloudTask) -> Result<CloudTask, BrokerError>;

    /// Returns the assigned cloud of a peer task, or `""` when unassigned.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on a store read failure; callers
    /// aggregating over many peers swallow and skip.
    async fn see_cloud_task(&self, task_id: u64) -> Result<String, BrokerError>;

    /// Current per-site pilot statistics.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on a store read failure.
    async fn current_site_data(&self) -> Result<HashMap<String, PilotCounts>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pilot_counts_total() {
        let counts = PilotCounts {
            get_job: 12,
            update_job: 30,
        };
        assert_eq!(counts.total(), 42);
    }
}
