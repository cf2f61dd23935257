//! Replica catalogue seam (LFC/LRC lookups).

use async_trait::async_trait;

use crate::error::BrokerError;

/// Access to a replica catalogue mapping logical file names to physical
/// replicas.
#[async_trait]
pub trait ReplicaCatalogue: Send + Sync {
    /// Returns the subset of `lfns` with a replica on any of
    /// `storage_hosts` as seen by the catalogue at `catalogue_url`.
    ///
    /// `guids` is index-aligned with `lfns`; catalogues that key by GUID use
    /// it instead of the name. An empty `storage_hosts` list means "any
    /// endpoint known to the catalogue".
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on catalogue failure; the caller
    /// owns the retry envelope.
    async fn files_present(
        &self,
        lfns: &[String],
        guids: &[String],
        catalogue_url: &str,
        storage_hosts: &[String],
    ) -> Result<Vec<String>, BrokerError>;

    /// Triggers a server-side replica re-listing of `dataset` at `sites`.
    ///
    /// Stale listings only degrade decision accuracy, so callers treat
    /// failures here as non-fatal.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::External`] on catalogue failure.
    async fn refresh_replicas(&self, dataset: &str, sites: &[String]) -> Result<(), BrokerError>;
}
