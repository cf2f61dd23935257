//! Distributed data management seam: dataset subscriptions and listings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Source-selection policy bits for new subscriptions. The value is defined
/// by the data management layer; preserve the literal.
pub const SOURCES_POLICY_SECONDARY: u32 = 0o1000 | 0o10000;

/// One file entry from a dataset content listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetFile {
    /// File GUID.
    pub guid: String,
    /// Logical file name.
    pub lfn: String,
    /// File size in bytes.
    pub filesize: u64,
}

/// Options attached to a subscription registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Dataset version to subscribe; 0 means latest.
    pub version: u32,
    /// Whether the subscription is archived on creation.
    pub archived: u32,
    /// Source-selection policy bitmask.
    pub sources_policy: u32,
    /// Whether registration blocks until sources resolve.
    pub wait_for_sources: u32,
    /// Whether the transfer layer may look for additional sources.
    pub query_more_sources: u32,
    /// Share the transfer runs under.
    pub sshare: String,
    /// ACL alias applied to the destination replica.
    pub acl_alias: String,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            version: 0,
            archived: 0,
            sources_policy: SOURCES_POLICY_SECONDARY,
            wait_for_sources: 0,
            query_more_sources: 0,
            sshare: "production".to_string(),
            acl_alias: "secondary".to_string(),
        }
    }
}

/// Result of a subscription-owner listing at one endpoint.
#[derive(Debug, Clone)]
pub enum SubscriptionInfo {
    /// Canonical owner identities of subscriptions at the endpoint.
    Owners(Vec<String>),
    /// The endpoint is not a known destination; treated as "no
    /// subscription".
    UnknownDestination,
}

/// Result of a subscription registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// A new subscription was registered.
    Registered,
    /// An identical subscription already existed; the data management layer
    /// is the authoritative deduplicator.
    AlreadyExists,
}

/// Access to the dataset subscription and replication layer.
#[async_trait]
pub trait DdmClient: Send + Sync {
    /// Lists the endpoints with a subscription to `dataset`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on transport failure.
    async fn list_subscriptions(&self, dataset: &str) -> Result<Vec<String>, BrokerError>;

    /// Lists the owners of subscriptions to `dataset` at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on transport failure.
    async fn list_subscription_info(
        &self,
        dataset: &str,
        endpoint: &str,
    ) -> Result<SubscriptionInfo, BrokerError>;

    /// Lists the files of `dataset` for sizing.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on transport failure.
    async fn list_files_in_dataset(&self, dataset: &str) -> Result<Vec<DatasetFile>, BrokerError>;

    /// Registers a replication subscription of `dataset` to `endpoint`.
    ///
    /// An already-existing identical subscription is reported as
    /// [`SubscribeOutcome::AlreadyExists`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on transport failure.
    async fn register_subscription(
        &self,
        dataset: &str,
        endpoint: &str,
        options: &SubscriptionOptions,
    ) -> Result<SubscribeOutcome, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sources_policy_literal() {
        // 0o1000 | 0o10000 == 4608 decimal
        assert_eq!(SOURCES_POLICY_SECONDARY, 4_608);
    }

    #[test]
    fn test_default_options() {
        let options = SubscriptionOptions::default();
        assert_eq!(options.sources_policy, SOURCES_POLICY_SECONDARY);
        assert_eq!(options.sshare, "production");
        assert_eq!(options.acl_alias, "secondary");
        assert_eq!(options.version, 0);
        assert_eq!(options.wait_for_sources, 0);
    }
}
