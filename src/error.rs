//! Error types for the task brokerage pipeline.
//!
//! One variant per decision-fatal failure kind, plus boundary variants for
//! collaborator transport failures and snapshot loading. A decision that
//! merely finds no viable cloud is not an error (`assign` returns `Ok(None)`).

use thiserror::Error;

/// Errors raised while brokering a task to a cloud.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No cloud-task claim row exists for the task. The caller must create
    /// the claim before invoking the assigner.
    #[error("task {task_id}: no cloud-task claim row")]
    MissingClaim {
        /// Task whose claim is missing.
        task_id: u64,
    },

    /// Required per-task metadata is missing or malformed. Recoverable on
    /// retry once the caller repairs the payload.
    #[error("task {task_id}: bad metadata: {message}")]
    BadMetadata {
        /// Task the metadata belongs to.
        task_id: u64,
        /// What was missing or malformed.
        message: String,
    },

    /// The replica catalogue probe failed after exhausting retries. Fatal
    /// for this decision; the task is retried later by the caller.
    #[error("task {task_id}: replica lookup failed at {catalogue}: {message}")]
    LocatorFailed {
        /// Task being brokered.
        task_id: u64,
        /// Catalogue URL that failed.
        catalogue: String,
        /// Final failure from the catalogue.
        message: String,
    },

    /// The weighted draw degenerated to a total weight of zero. This is a
    /// bug path: candidates should never all carry zero weight.
    #[error("task {task_id}: total candidate weight is zero")]
    ZeroWeight {
        /// Task being brokered.
        task_id: u64,
    },

    /// A Tier-2-backed cloud was chosen but the subscription planner could
    /// not issue the replication orders the placement depends on.
    #[error("task {task_id}: subscription required for {cloud} but planner failed")]
    SubscriptionRequired {
        /// Task being brokered.
        task_id: u64,
        /// Cloud that needed the subscriptions.
        cloud: String,
    },

    /// The final claim write was rejected by the task store.
    #[error("task {task_id}: cloud-task commit failed: {message}")]
    CommitFailed {
        /// Task being brokered.
        task_id: u64,
        /// Store-side failure description.
        message: String,
    },

    /// A collaborator call failed at the transport level.
    #[error("{call} failed: {message}")]
    External {
        /// Collaborator call that failed (e.g. `"listSubscriptions"`).
        call: &'static str,
        /// Transport-level failure description.
        message: String,
    },

    /// A cloud named by the decision inputs is not in the site directory.
    #[error("unknown cloud: {name}")]
    UnknownCloud {
        /// Cloud name that failed to resolve.
        name: String,
    },

    /// A site named by the decision inputs is not in the site directory.
    #[error("unknown site: {name}")]
    UnknownSite {
        /// Site name that failed to resolve.
        name: String,
    },

    /// Broker configuration failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Which field was rejected and why.
        message: String,
    },

    /// A world snapshot could not be loaded or decoded.
    #[error("snapshot error: {message}")]
    Snapshot {
        /// Load or decode failure description.
        message: String,
    },
}
