//! Typed decoding of the brokerage metadata payload.
//!
//! The payload is a semicolon-delimited six-tuple: the task type followed by
//! five JSON objects. The first and fourth maps are keyed by cloud name
//! (seed values for the Running-Work accumulators); the others are keyed by
//! task id. Malformed input is rejected explicitly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Parsed per-decision metadata bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Task type (e.g. `"evgen"`, `"simul"`).
    pub task_type: String,
    /// Seed Running-Work per cloud at or above this task's priority.
    pub rws: HashMap<String, f64>,
    /// Expected Running-Work per task, self included.
    pub exp_rws: HashMap<u64, f64>,
    /// Priority per task, self included.
    pub prio_map: HashMap<u64, i64>,
    /// Seed total committed Running-Work per cloud.
    pub full_rws: HashMap<String, f64>,
    /// Task type per task, used for process-group comparison.
    pub task_group_map: HashMap<u64, String>,
}

impl TaskMetadata {
    /// Parses the semicolon-delimited payload.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BadMetadata`] when the payload does not have
    /// six segments, a segment is not a JSON object of the expected shape,
    /// or a task-id key is not an unsigned integer.
    pub fn parse(task_id: u64, payload: &str) -> Result<Self, BrokerError> {
        let bad = |message: String| BrokerError::BadMetadata { task_id, message };
        let parts: Vec<&str> = payload.split(';').collect();
        if parts.len() != 6 {
            return Err(bad(format!(
                "expected 6 metadata segments, got {}",
                parts.len()
            )));
        }
        Ok(Self {
            task_type: parts[0].trim().to_string(),
            rws: cloud_map(task_id, "RW", parts[1])?,
            exp_rws: task_map(task_id, "expectedRW", parts[2])?,
            prio_map: task_map(task_id, "priority", parts[3])?,
            full_rws: cloud_map(task_id, "fullRW", parts[4])?,
            task_group_map: task_map(task_id, "taskGroup", parts[5])?,
        })
    }

    /// Checks that the decision-critical self entries are present.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BadMetadata`] when `expectedRW` or `priority`
    /// lacks an entry for `task_id`.
    pub fn require_self(&self, task_id: u64) -> Result<(f64, i64), BrokerError> {
        let exp_rw = *self
            .exp_rws
            .get(&task_id)
            .ok_or_else(|| BrokerError::BadMetadata {
                task_id,
                message: "expectedRW entry for this task missing".to_string(),
            })?;
        let priority = *self
            .prio_map
            .get(&task_id)
            .ok_or_else(|| BrokerError::BadMetadata {
                task_id,
                message: "priority entry for this task missing".to_string(),
            })?;
        Ok((exp_rw, priority))
    }

    /// Task type of this task as recorded in the group map, falling back to
    /// the payload task type.
    #[must_use]
    pub fn own_group_type(&self, task_id: u64) -> &str {
        self.task_group_map
            .get(&task_id)
            .map_or(self.task_type.as_str(), String::as_str)
    }
}

/// Parses a JSON object keyed by cloud name.
fn cloud_map(task_id: u64, field: &str, raw: &str) -> Result<HashMap<String, f64>, BrokerError> {
    serde_json::from_str(raw.trim()).map_err(|err| BrokerError::BadMetadata {
        task_id,
        message: format!("{field} map: {err}"),
    })
}

/// Parses a JSON object keyed by task id.
fn task_map<V>(task_id: u64, field: &str, raw: &str) -> Result<HashMap<u64, V>, BrokerError>
where
    V: for<'de> Deserialize<'de>,
{
    let keyed: HashMap<String, V> =
        serde_json::from_str(raw.trim()).map_err(|err| BrokerError::BadMetadata {
            task_id,
            message: format!("{field} map: {err}"),
        })?;
    keyed
        .into_iter()
        .map(|(key, value)| {
            key.parse::<u64>()
                .map(|id| (id, value))
                .map_err(|_| BrokerError::BadMetadata {
                    task_id,
                    message: format!("{field} map: non-integer task id {key:?}"),
                })
        })
        .collect()
}
