//! The brokerage core: decision data model, metadata decoding, Running-Work
//! accounting, scoring, the subscription fallback, and the controller that
//! sequences them.

pub mod assigner;
pub mod metadata;
pub mod rw;
pub mod subscription;
pub mod task;
pub mod weights;

pub use assigner::{Collaborators, TaskAssigner};
pub use metadata::TaskMetadata;
pub use rw::RwTotals;
pub use subscription::{SubscribeRequest, SubscriptionPlanner};
pub use task::{ClaimStatus, CloudTask, DatasetLocations, ReplicaStat, TaskSpec};
pub use weights::WeightParams;
