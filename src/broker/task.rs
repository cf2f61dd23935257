//! Task data model: decision inputs and the cloud-task claim.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Replica statistics for one dataset at one storage endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReplicaStat {
    /// Total files in the dataset; `-1` means unknown.
    pub total: i64,
    /// Files found at this endpoint; `None` means unknown.
    pub found: Option<i64>,
    /// `0` while the dataset is still open to appends.
    pub immutable: i64,
}

impl ReplicaStat {
    /// Returns `true` when the replica listing must be refreshed before it
    /// can be trusted.
    #[must_use]
    pub const fn needs_refresh(&self) -> bool {
        self.total == -1 || self.found.is_none()
    }

    /// Returns `true` when the dataset is still open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.immutable == 0
    }

    /// Returns `true` when every file of the dataset is present here.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.found.is_some_and(|f| f >= self.total) && self.total >= 0
    }
}

/// Replica map: dataset → storage endpoint → statistics.
///
/// `BTreeMap` keeps dataset iteration order stable, which keeps log output
/// and sampled probes reproducible.
pub type DatasetLocations = BTreeMap<String, BTreeMap<String, ReplicaStat>>;

/// A task awaiting cloud assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task identifier.
    pub task_id: u64,
    /// Production source label (e.g. `"managed"`, `"validation"`).
    pub prod_source_label: String,
    /// Per-job input footprint in GB; 0 means no constraint.
    #[serde(default)]
    pub max_disk_count_gb: u32,
    /// Logical file names of the task inputs.
    pub lfns: Vec<String>,
    /// File GUIDs, index-aligned with `lfns`.
    pub guids: Vec<String>,
    /// Known replica locations of the input datasets.
    #[serde(default)]
    pub locations: DatasetLocations,
}

impl TaskSpec {
    /// Validates structural invariants of the decision input.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BadMetadata`] when `lfns` and `guids`
    /// disagree in length.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.lfns.len() != self.guids.len() {
            return Err(BrokerError::BadMetadata {
                task_id: self.task_id,
                message: format!(
                    "lfns/guids length mismatch: {} vs {}",
                    self.lfns.len(),
                    self.guids.len()
                ),
            });
        }
        Ok(())
    }
}

/// Assignment state of a cloud-task claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Claimed but not yet brokered.
    Unassigned,
    /// Brokered; the claim row is immutable from here on.
    Assigned,
}

impl ClaimStatus {
    /// Returns the wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unassigned => "unassigned",
            Self::Assigned => "assigned",
        }
    }
}

/// Persisted cloud-task claim row. At most one row exists per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudTask {
    /// Task this claim belongs to.
    pub task_id: u64,
    /// Assigned cloud, set exactly once.
    #[serde(default)]
    pub cloud: Option<String>,
    /// Claim state; `unassigned → assigned` is one-shot.
    pub status: ClaimStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_stat_refresh() {
        let stat = ReplicaStat {
            total: -1,
            found: Some(3),
            immutable: 1,
        };
        assert!(stat.needs_refresh());
        let stat = ReplicaStat {
            total: 10,
            found: None,
            immutable: 1,
        };
        assert!(stat.needs_refresh());
        let stat = ReplicaStat {
            total: 10,
            found: Some(10),
            immutable: 1,
        };
        assert!(!stat.needs_refresh());
    }

    #[test]
    fn test_replica_stat_complete() {
        let full = ReplicaStat {
            total: 10,
            found: Some(10),
            immutable: 1,
        };
        assert!(full.is_complete());
        let partial = ReplicaStat {
            total: 10,
            found: Some(7),
            immutable: 1,
        };
        assert!(!partial.is_complete());
        let unknown = ReplicaStat {
            total: 10,
            found: None,
            immutable: 1,
        };
        assert!(!unknown.is_complete());
    }

    #[test]
    fn test_task_validate_length_mismatch() {
        let task = TaskSpec {
            task_id: 1,
            prod_source_label: "managed".to_string(),
            max_disk_count_gb: 0,
            lfns: vec!["a".to_string()],
            guids: vec![],
            locations: DatasetLocations::new(),
        };
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_claim_status_str() {
        assert_eq!(ClaimStatus::Unassigned.as_str(), "unassigned");
        assert_eq!(ClaimStatus::Assigned.as_str(), "assigned");
    }
}
