//! Batched, sampled, retried replica counting.
//!
//! A probe over a large input list is split into fixed-size batches; when
//! the batch count exceeds the sampling cap, a random subset is probed
//! instead. The batch plan is computed once per brokerage decision and
//! reused for every catalogue, so all clouds are scored against the same
//! sample.

use std::sync::Arc;

use rand::rngs::StdRng;

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::external::ReplicaCatalogue;
use crate::replica::endpoint::CatalogueEndpoint;

/// Batch offsets selected for probing, shared across all catalogues of one
/// decision.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Start offsets of the probed batches, ascending.
    offsets: Vec<usize>,
    /// Files per batch; the final batch may be shorter.
    batch_size: usize,
    /// Total number of input files.
    n_files: usize,
}

impl BatchPlan {
    /// Plans the probe batches for `n_files` inputs.
    ///
    /// All batches are probed when their count is within `max_batches`;
    /// otherwise a uniform random subset of `max_batches` offsets is drawn
    /// without replacement and sorted ascending.
    #[must_use]
    pub fn new(n_files: usize, batch_size: usize, max_batches: usize, rng: &mut StdRng) -> Self {
        let n_batches = n_files.div_ceil(batch_size);
        let mut offsets: Vec<usize> = (0..n_batches).map(|i| i * batch_size).collect();
        if offsets.len() > max_batches {
            let picked = rand::seq::index::sample(rng, offsets.len(), max_batches);
            let mut sampled: Vec<usize> = picked.iter().map(|i| offsets[i]).collect();
            sampled.sort_unstable();
            offsets = sampled;
        }
        Self {
            offsets,
            batch_size,
            n_files,
        }
    }

    /// Start offsets of the probed batches.
    #[must_use]
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Number of files covered by the probed batches.
    #[must_use]
    pub fn sampled_files(&self) -> usize {
        self.offsets
            .iter()
            .map(|&off| self.batch_size.min(self.n_files - off))
            .sum()
    }

    /// Slice bounds of the batch starting at `offset`.
    #[must_use]
    pub fn bounds(&self, offset: usize) -> (usize, usize) {
        (offset, (offset + self.batch_size).min(self.n_files))
    }
}

/// Replica file counting with the brokerage retry envelope.
#[derive(Clone)]
pub struct ReplicaLocator {
    catalogue: Arc<dyn ReplicaCatalogue>,
    retries: u32,
    backoff: std::time::Duration,
    refresh_deadline: std::time::Duration,
}

impl ReplicaLocator {
    /// Creates a locator over a catalogue with the configured envelope.
    #[must_use]
    pub fn new(catalogue: Arc<dyn ReplicaCatalogue>, config: &BrokerConfig) -> Self {
        Self {
            catalogue,
            retries: config.locator_retries,
            backoff: config.locator_backoff,
            refresh_deadline: config.refresh_deadline,
        }
    }

    /// Counts the input files with a replica at `endpoint`, probing the
    /// batches of `plan`.
    ///
    /// Each batch is retried with linear backoff; exhausting the retries
    /// fails the whole count.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::LocatorFailed`] when a batch probe fails
    /// definitively.
    pub async fn count_files(
        &self,
        task_id: u64,
        lfns: &[String],
        guids: &[String],
        endpoint: &CatalogueEndpoint,
        plan: &BatchPlan,
    ) -> Result<usize, BrokerError> {
        let mut n_found = 0;
        for (i, &offset) in plan.offsets().iter().enumerate() {
            let (start, end) = plan.bounds(offset);
            let present = self
                .probe_batch(task_id, &lfns[start..end], &guids[start..end], endpoint)
                .await?;
            n_found += present;
            if i % 10 == 1 {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    total = lfns.len(),
                    offset,
                    "probe progress"
                );
            }
        }
        Ok(n_found)
    }

    /// Probes one batch with the retry envelope.
    async fn probe_batch(
        &self,
        task_id: u64,
        lfns: &[String],
        guids: &[String],
        endpoint: &CatalogueEndpoint,
    ) -> Result<usize, BrokerError> {
        let mut attempt = 0;
        loop {
            match self
                .catalogue
                .files_present(lfns, guids, &endpoint.url, &endpoint.storage_hosts)
                .await
            {
                Ok(present) => return Ok(present.len()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.retries {
                        return Err(BrokerError::LocatorFailed {
                            task_id,
                            catalogue: endpoint.url.clone(),
                            message: err.to_string(),
                        });
                    }
                    tracing::warn!(
                        target: "taskbrokerage",
                        task_id,
                        catalogue = %endpoint.url,
                        attempt,
                        error = %err,
                        "replica probe retry"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }

    /// Fires a replica re-listing for sites whose statistics are stale.
    ///
    /// Bounded by the refresh deadline; failures are logged and swallowed
    /// since stale data only degrades accuracy.
    pub async fn refresh(&self, task_id: u64, dataset: &str, sites: &[String]) {
        tracing::debug!(
            target: "taskbrokerage",
            task_id,
            dataset,
            ?sites,
            "refreshing replica listing"
        );
        let refresh = self.catalogue.refresh_replicas(dataset, sites);
        match tokio::time::timeout(self.refresh_deadline, refresh).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    dataset,
                    error = %err,
                    "replica refresh failed"
                );
            }
            Err(_) => {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    dataset,
                    "replica refresh deadline exceeded"
                );
            }
        }
    }
}

impl std::fmt::Debug for ReplicaLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaLocator")
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}
