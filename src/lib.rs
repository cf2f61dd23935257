//! Task-to-cloud assignment for a distributed production workload grid.
//!
//! Given a newly submitted task whose input datasets are scattered across
//! federated storage sites grouped into clouds, decide which cloud should
//! execute it. The decision jointly weighs data locality, free Tier-1
//! storage, committed Running Work, pilot availability, priority ordering,
//! and policy flags. When no cloud is locally viable it falls back to
//! ordering dataset replications so a later decision can succeed.
//!
//! # Architecture
//!
//! ```text
//! TaskAssigner (per task)
//!   ├── TaskStore        claim row, peer assignments, pilot counters
//!   ├── RW recompute     committed load per cloud, at/above own priority
//!   ├── SiteDirectory    policy filters: online / validation / fast-track / disk
//!   ├── ReplicaLocator   sampled, retried file counting at T1, then T2
//!   ├── weighted draw    MC share, or pilots per unit RW
//!   ├── SubscriptionPlanner   replication orders when data is missing
//!   └── commit           claim flips to assigned, once
//! ```
//!
//! All external systems sit behind async trait seams; the
//! [`snapshot`] module replays a serialised world in memory for dry runs
//! and tests.

pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod external;
pub mod process_group;
pub mod replica;
pub mod snapshot;

// Re-export key types
pub use broker::{
    ClaimStatus, CloudTask, Collaborators, DatasetLocations, ReplicaStat, TaskAssigner,
    TaskMetadata, TaskSpec,
};
pub use config::BrokerConfig;
pub use directory::{CloudSpec, InMemorySiteDirectory, SiteDirectory, SiteSpec};
pub use error::BrokerError;
pub use snapshot::WorldSnapshot;
