//! Fallback dataset subscription planning.
//!
//! When no cloud holds a complete local replica, the planner picks a
//! destination cloud with headroom and issues replication orders, guarding
//! against duplicate in-flight subscriptions by the same identity. The
//! listing-then-registering race cannot be fully closed here; the data
//! management layer's "already exists" response is the authoritative
//! deduplicator.

use std::collections::BTreeMap;
use std::future::Future;

use crate::broker::rw::RwTotals;
use crate::broker::weights::space_budget;
use crate::config::BrokerConfig;
use crate::directory::SiteDirectory;
use crate::error::BrokerError;
use crate::external::identity::strip_proxy_suffixes;
use crate::external::{
    DdmClient, IdentityProvider, SubscribeOutcome, SubscriptionInfo, SubscriptionOptions,
};

/// One fallback-subscription request.
#[derive(Debug)]
pub struct SubscribeRequest<'a> {
    /// Dataset → clouds lacking a complete replica.
    pub removed: &'a BTreeMap<String, Vec<String>>,
    /// Clouds that passed the policy filters and may receive data.
    pub eligible_clouds: &'a [String],
    /// Recomputed Running-Work accumulators.
    pub totals: &'a RwTotals,
    /// Expected Running Work of the task being brokered.
    pub exp_rw_self: f64,
    /// Accept a destination even when its RW ratio exceeds 1.
    pub no_empty_check: bool,
    /// Skip the duplicate in-flight subscription guard.
    pub accept_in_process: bool,
}

/// Plans and issues fallback dataset subscriptions.
pub struct SubscriptionPlanner<'a> {
    directory: &'a dyn SiteDirectory,
    ddm: &'a dyn DdmClient,
    identity: &'a dyn IdentityProvider,
    config: &'a BrokerConfig,
    task_id: u64,
}

impl<'a> SubscriptionPlanner<'a> {
    /// Creates a planner for one task.
    #[must_use]
    pub fn new(
        directory: &'a dyn SiteDirectory,
        ddm: &'a dyn DdmClient,
        identity: &'a dyn IdentityProvider,
        config: &'a BrokerConfig,
        task_id: u64,
    ) -> Self {
        Self {
            directory,
            ddm,
            identity,
            config,
            task_id,
        }
    }

    /// Runs the planner; returns `true` when every required order was
    /// issued (or already existed).
    ///
    /// All failure modes are logged and reported as `false`: the decision
    /// layer decides whether that aborts the assignment or merely leaves
    /// the task unassigned.
    pub async fn subscribe(&self, req: &SubscribeRequest<'_>) -> bool {
        match self.try_subscribe(req).await {
            Ok(done) => done,
            Err(err) => {
                tracing::error!(
                    target: "taskbrokerage",
                    task_id = self.task_id,
                    error = %err,
                    "subscription planning failed"
                );
                false
            }
        }
    }

    async fn try_subscribe(&self, req: &SubscribeRequest<'_>) -> Result<bool, BrokerError> {
        let task_id = self.task_id;
        tracing::debug!(
            target: "taskbrokerage",
            task_id,
            eligible = ?req.eligible_clouds,
            "possible clouds for subscription"
        );
        let candidates = self.candidate_clouds(req);
        tracing::debug!(
            target: "taskbrokerage",
            task_id,
            ?candidates,
            "candidates for subscription"
        );
        if candidates.is_empty() {
            tracing::debug!(target: "taskbrokerage", task_id, "no candidates for subscription");
            return Ok(false);
        }

        if !req.accept_in_process && self.in_flight_elsewhere(req).await? {
            return Ok(false);
        }

        let sizes = self.dataset_sizes(req).await?;
        let Some(chosen) = self.pick_destination(req, &candidates, &sizes) else {
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                "no candidates left for subscription"
            );
            return Ok(false);
        };
        self.issue_orders(req, &chosen).await
    }

    /// Clouds missing data, restricted to the policy-eligible set.
    fn candidate_clouds(&self, req: &SubscribeRequest<'_>) -> Vec<String> {
        let mut candidates = Vec::new();
        for clouds in req.removed.values() {
            for cloud in clouds {
                if !candidates.contains(cloud) && req.eligible_clouds.contains(cloud) {
                    candidates.push(cloud.clone());
                }
            }
        }
        candidates
    }

    /// Checks for an in-flight subscription by this identity on any Tier-1
    /// endpoint. A hit means another assignment already ordered the data.
    async fn in_flight_elsewhere(&self, req: &SubscribeRequest<'_>) -> Result<bool, BrokerError> {
        let task_id = self.task_id;
        let raw_dn = self.identity.subject_dn().await?;
        let stripped = strip_proxy_suffixes(&raw_dn);
        let dn = self.identity.parse_dn(&stripped).await?;
        tracing::debug!(target: "taskbrokerage", task_id, %dn, "duplicate-subscription guard");

        for dataset in req.removed.keys() {
            let endpoints = self
                .retry_ddm("listSubscriptions", || {
                    self.ddm.list_subscriptions(dataset)
                })
                .await?;
            tokio::time::sleep(self.config.throttle).await;
            for endpoint in &endpoints {
                let Some(owning_cloud) = self.tier1_owner(endpoint) else {
                    continue;
                };
                let info = self
                    .retry_ddm("listSubscriptionInfo", || {
                        self.ddm.list_subscription_info(dataset, endpoint)
                    })
                    .await?;
                tokio::time::sleep(self.config.throttle).await;
                let owners = match info {
                    SubscriptionInfo::Owners(owners) => owners,
                    SubscriptionInfo::UnknownDestination => {
                        tracing::debug!(
                            target: "taskbrokerage",
                            task_id,
                            endpoint,
                            "unknown destination, ignoring"
                        );
                        continue;
                    }
                };
                if owners.iter().any(|owner| owner == &dn) {
                    tracing::debug!(
                        target: "taskbrokerage",
                        task_id,
                        dataset,
                        cloud = owning_cloud,
                        "subscription already in process"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Cloud owning `endpoint` as a Tier-1 storage endpoint, if any.
    fn tier1_owner(&self, endpoint: &str) -> Option<String> {
        self.directory.cloud_list().into_iter().find(|name| {
            self.directory
                .cloud(name)
                .is_some_and(|cloud| cloud.tier1_se.iter().any(|se| se == endpoint))
        })
    }

    /// Dataset sizes in GB, from the content listings.
    async fn dataset_sizes(
        &self,
        req: &SubscribeRequest<'_>,
    ) -> Result<BTreeMap<String, u64>, BrokerError> {
        let mut sizes = BTreeMap::new();
        for dataset in req.removed.keys() {
            let files = self
                .retry_ddm("listFilesInDataset", || {
                    self.ddm.list_files_in_dataset(dataset)
                })
                .await?;
            let bytes: u64 = files.iter().map(|f| f.filesize).sum();
            let gb = bytes / (1024 * 1024 * 1024);
            tracing::debug!(
                target: "taskbrokerage",
                task_id = self.task_id,
                dataset,
                bytes,
                gb,
                "dataset size"
            );
            sizes.insert(dataset.clone(), gb);
        }
        Ok(sizes)
    }

    /// Picks the least-loaded destination with storage headroom.
    #[allow(clippy::cast_precision_loss)]
    fn pick_destination(
        &self,
        req: &SubscribeRequest<'_>,
        candidates: &[String],
        sizes: &BTreeMap<String, u64>,
    ) -> Option<String> {
        let task_id = self.task_id;
        let mut best: Option<(f64, String)> = None;
        for cloud_name in candidates {
            let Some(cloud) = self.directory.cloud(cloud_name) else {
                continue;
            };
            let Some(t1) = self.directory.site(&cloud.source) else {
                continue;
            };
            let full_rw = req.totals.full_rw(cloud_name);
            let mut budget = space_budget(
                t1.space_gb,
                full_rw,
                req.exp_rw_self,
                self.config.space_per_rw,
            );
            for (dataset, clouds) in req.removed {
                if clouds.contains(cloud_name) {
                    budget.available -= sizes.get(dataset).copied().unwrap_or(0) as f64;
                }
            }
            if budget.available < self.config.space_low_gb {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    available = budget.available,
                    total = t1.space_gb,
                    "skip: not enough space for subscription"
                );
                continue;
            }
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = cloud_name.as_str(),
                available = budget.available,
                total = t1.space_gb,
                "pass: space"
            );
            if cloud.mcshare == 0.0 {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    "skip: mcshare is zero"
                );
                continue;
            }
            let rw = req.totals.rw(cloud_name);
            let threshold = self.config.rw_sub * cloud.mcshare;
            let ratio = rw / threshold;
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = cloud_name.as_str(),
                rw,
                threshold,
                "subscription ranking"
            );
            if best.as_ref().is_none_or(|(min, _)| ratio < *min) {
                best = Some((ratio, cloud_name.clone()));
            }
        }
        let (min_ratio, chosen) = best?;
        if min_ratio > 1.0 && !req.no_empty_check {
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = chosen.as_str(),
                ratio = min_ratio,
                "no empty cloud for subscription"
            );
            return None;
        }
        tracing::debug!(
            target: "taskbrokerage",
            task_id,
            cloud = chosen.as_str(),
            ratio = min_ratio,
            "destination for subscription"
        );
        Some(chosen)
    }

    /// Issues one order per dataset still missing at the chosen cloud.
    async fn issue_orders(
        &self,
        req: &SubscribeRequest<'_>,
        chosen: &str,
    ) -> Result<bool, BrokerError> {
        let task_id = self.task_id;
        let endpoint = self
            .directory
            .cloud(chosen)
            .and_then(|cloud| self.directory.site(&cloud.source))
            .map(|t1| t1.ddm.clone())
            .ok_or_else(|| BrokerError::UnknownCloud {
                name: chosen.to_string(),
            })?;
        let options = SubscriptionOptions::default();
        for (dataset, clouds) in req.removed {
            if !clouds.contains(&chosen.to_string()) {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    dataset,
                    cloud = chosen,
                    "dataset already present at destination"
                );
                continue;
            }
            let outcome = self
                .retry_ddm("registerDatasetSubscription", || {
                    self.ddm.register_subscription(dataset, &endpoint, &options)
                })
                .await?;
            if outcome == SubscribeOutcome::AlreadyExists {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    dataset,
                    endpoint,
                    "subscription already exists"
                );
            }
            tracing::info!(
                target: "taskbrokerage",
                task_id,
                dataset,
                cloud = chosen,
                endpoint,
                "registered subscription"
            );
            tokio::time::sleep(self.config.throttle).await;
        }
        Ok(true)
    }

    /// Retries a data-management call with the configured envelope.
    async fn retry_ddm<T, F, Fut>(&self, call: &'static str, run: F) -> Result<T, BrokerError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match run().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.config.ddm_retries {
                        return Err(err);
                    }
                    tracing::warn!(
                        target: "taskbrokerage",
                        task_id = self.task_id,
                        call,
                        attempt,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(self.config.ddm_backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{CloudSpec, InMemorySiteDirectory, SiteSpec};
    use crate::external::DatasetFile;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedIdentity(&'static str);

    #[async_trait]
    impl IdentityProvider for FixedIdentity {
        async fn subject_dn(&self) -> Result<String, BrokerError> {
            Ok(format!("{}/CN=proxy", self.0))
        }

        async fn parse_dn(&self, dn: &str) -> Result<String, BrokerError> {
            Ok(dn.to_string())
        }
    }

    /// In-memory DDM recording registered orders and reflecting them back
    /// through the subscription listings.
    #[derive(Default)]
    struct RecordingDdm {
        /// dataset -> (endpoint, owner)
        subs: Mutex<Vec<(String, String, String)>>,
        owner: String,
        file_gb: u64,
    }

    impl RecordingDdm {
        fn new(owner: &str, file_gb: u64) -> Self {
            Self {
                subs: Mutex::new(Vec::new()),
                owner: owner.to_string(),
                file_gb,
            }
        }

        fn registered(&self) -> Vec<(String, String)> {
            self.subs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .map(|(ds, ep, _)| (ds.clone(), ep.clone()))
                .collect()
        }
    }

    #[async_trait]
    impl DdmClient for RecordingDdm {
        async fn list_subscriptions(&self, dataset: &str) -> Result<Vec<String>, BrokerError> {
            Ok(self
                .subs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .filter(|(ds, _, _)| ds == dataset)
                .map(|(_, ep, _)| ep.clone())
                .collect())
        }

        async fn list_subscription_info(
            &self,
            dataset: &str,
            endpoint: &str,
        ) -> Result<SubscriptionInfo, BrokerError> {
            let owners = self
                .subs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .iter()
                .filter(|(ds, ep, _)| ds == dataset && ep == endpoint)
                .map(|(_, _, owner)| owner.clone())
                .collect();
            Ok(SubscriptionInfo::Owners(owners))
        }

        async fn list_files_in_dataset(
            &self,
            _dataset: &str,
        ) -> Result<Vec<DatasetFile>, BrokerError> {
            Ok(vec![DatasetFile {
                guid: "guid-1".to_string(),
                lfn: "file-1".to_string(),
                filesize: self.file_gb * 1024 * 1024 * 1024,
            }])
        }

        async fn register_subscription(
            &self,
            dataset: &str,
            endpoint: &str,
            _options: &SubscriptionOptions,
        ) -> Result<SubscribeOutcome, BrokerError> {
            let mut subs = self
                .subs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if subs
                .iter()
                .any(|(ds, ep, _)| ds == dataset && ep == endpoint)
            {
                return Ok(SubscribeOutcome::AlreadyExists);
            }
            subs.push((
                dataset.to_string(),
                endpoint.to_string(),
                self.owner.clone(),
            ));
            Ok(SubscribeOutcome::Registered)
        }
    }

    fn directory(space_gb: f64, mcshare: f64) -> InMemorySiteDirectory {
        let clouds = vec![CloudSpec {
            name: "IT".to_string(),
            status: "online".to_string(),
            validation: false,
            fasttrack: false,
            mcshare,
            source: "IT-T1".to_string(),
            sites: vec!["IT-T1".to_string()],
            tier1_se: vec!["IT_DATADISK".to_string()],
        }];
        let sites = vec![SiteSpec {
            name: "IT-T1".to_string(),
            status: "online".to_string(),
            max_input_size_gb: 0,
            space_gb,
            lfc_host: None,
            se: None,
            ddm: "IT_DATADISK".to_string(),
            dq2_url: None,
        }];
        InMemorySiteDirectory::new(clouds, sites)
    }

    fn config() -> BrokerConfig {
        BrokerConfig::builder()
            .ddm_backoff(std::time::Duration::from_millis(1))
            .throttle(std::time::Duration::from_millis(1))
            .build()
            .unwrap_or_else(|_| unreachable!())
    }

    fn removed_it() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([("mc20.dataset".to_string(), vec!["IT".to_string()])])
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_guard_suppresses_second_order() {
        let dir = directory(10_000.0, 1.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let eligible = vec!["IT".to_string()];
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        assert!(planner.subscribe(&req).await);
        // Second invocation sees the in-flight order and declines.
        assert!(!planner.subscribe(&req).await);
        assert_eq!(
            ddm.registered(),
            vec![("mc20.dataset".to_string(), "IT_DATADISK".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_in_process_bypasses_guard() {
        let dir = directory(10_000.0, 1.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let eligible = vec!["IT".to_string()];
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: true,
            accept_in_process: true,
        };
        assert!(planner.subscribe(&req).await);
        // The repeat register resolves as already-exists, still a success.
        assert!(planner.subscribe(&req).await);
        assert_eq!(ddm.registered().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eligible_clouds() {
        let dir = directory(10_000.0, 1.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &[],
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        assert!(!planner.subscribe(&req).await);
        assert!(ddm.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dataset_size_consumes_headroom() {
        // 2000 GB free, dataset of 1500 GB leaves less than the floor.
        let dir = directory(2_000.0, 1.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1_500);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let eligible = vec!["IT".to_string()];
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        assert!(!planner.subscribe(&req).await);
        assert!(ddm.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_mcshare_rejected() {
        let dir = directory(10_000.0, 0.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let eligible = vec!["IT".to_string()];
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        assert!(!planner.subscribe(&req).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loaded_cloud_needs_no_empty_check() {
        let dir = directory(10_000.0, 1.0);
        let ddm = RecordingDdm::new("/DC=org/CN=Robot", 1);
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let mut totals = RwTotals::default();
        // RW above rw_sub * mcshare puts the ratio over 1.
        totals.rws.insert("IT".to_string(), 900.0);
        let eligible = vec!["IT".to_string()];
        let mut req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        assert!(!planner.subscribe(&req).await);
        req.no_empty_check = true;
        assert!(planner.subscribe(&req).await);
    }

    /// DDM whose info listing reports an unknown destination.
    struct UnknownDestDdm {
        inner: RecordingDdm,
    }

    #[async_trait]
    impl DdmClient for UnknownDestDdm {
        async fn list_subscriptions(&self, dataset: &str) -> Result<Vec<String>, BrokerError> {
            self.inner.list_subscriptions(dataset).await
        }

        async fn list_subscription_info(
            &self,
            _dataset: &str,
            _endpoint: &str,
        ) -> Result<SubscriptionInfo, BrokerError> {
            Ok(SubscriptionInfo::UnknownDestination)
        }

        async fn list_files_in_dataset(
            &self,
            dataset: &str,
        ) -> Result<Vec<DatasetFile>, BrokerError> {
            self.inner.list_files_in_dataset(dataset).await
        }

        async fn register_subscription(
            &self,
            dataset: &str,
            endpoint: &str,
            options: &SubscriptionOptions,
        ) -> Result<SubscribeOutcome, BrokerError> {
            self.inner
                .register_subscription(dataset, endpoint, options)
                .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_destination_counts_as_no_subscription() {
        let dir = directory(10_000.0, 1.0);
        let ddm = UnknownDestDdm {
            inner: RecordingDdm::new("/DC=org/CN=Robot", 1),
        };
        let identity = FixedIdentity("/DC=org/CN=Robot");
        let cfg = config();
        let planner = SubscriptionPlanner::new(&dir, &ddm, &identity, &cfg, 1);
        let removed = removed_it();
        let totals = RwTotals::default();
        let eligible = vec!["IT".to_string()];
        let req = SubscribeRequest {
            removed: &removed,
            eligible_clouds: &eligible,
            totals: &totals,
            exp_rw_self: 0.0,
            no_empty_check: false,
            accept_in_process: false,
        };
        // First pass registers; the second would normally hit the guard,
        // but the info listing cannot name owners, so it registers again
        // and the DDM layer dedupes.
        assert!(planner.subscribe(&req).await);
        assert!(planner.subscribe(&req).await);
        assert_eq!(ddm.inner.registered().len(), 1);
    }
}
