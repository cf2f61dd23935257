//! The task-to-cloud assignment state machine.
//!
//! Drives one brokerage decision end to end: claim check, metadata and
//! Running-Work recomputation, policy filtering, replica freshness, data
//! locality scoring at Tier-1 with a Tier-2 fallback, the weighted draw,
//! and the commit. When no cloud is locally viable the decision falls
//! through to the subscription planner instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;

use crate::broker::metadata::TaskMetadata;
use crate::broker::rw::{self, RwTotals};
use crate::broker::subscription::{SubscribeRequest, SubscriptionPlanner};
use crate::broker::task::{ClaimStatus, CloudTask, TaskSpec};
use crate::broker::weights::{WeightParams, space_budget, weighted_draw};
use crate::config::BrokerConfig;
use crate::directory::{CloudSpec, SiteDirectory};
use crate::error::BrokerError;
use crate::external::{DdmClient, IdentityProvider, PilotCounts, ReplicaCatalogue, TaskStore};
use crate::replica::endpoint::{CatalogueEndpoint, lfc_url, se_hosts};
use crate::replica::locator::{BatchPlan, ReplicaLocator};

/// The external interfaces one brokerage decision consumes.
#[derive(Clone)]
pub struct Collaborators {
    /// Topology snapshot.
    pub directory: Arc<dyn SiteDirectory>,
    /// Persisted task state.
    pub store: Arc<dyn TaskStore>,
    /// Replica catalogue.
    pub catalogue: Arc<dyn ReplicaCatalogue>,
    /// Data management layer.
    pub ddm: Arc<dyn DdmClient>,
    /// Caller identity.
    pub identity: Arc<dyn IdentityProvider>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Per-task assignment driver.
///
/// One assigner is constructed per task; concurrent tasks run independent
/// assigners sharing only the directory snapshot and the task store.
pub struct TaskAssigner {
    collab: Collaborators,
    config: BrokerConfig,
    task: TaskSpec,
    rng: StdRng,
    cloud_task: Option<CloudTask>,
    clouds_for_subs: Vec<String>,
}

impl TaskAssigner {
    /// Creates an assigner for one task.
    ///
    /// The random source drives both the probe-batch sampling and the
    /// weighted draw; seed it for reproducible decisions.
    #[must_use]
    pub fn new(collab: Collaborators, config: BrokerConfig, task: TaskSpec, rng: StdRng) -> Self {
        Self {
            collab,
            config,
            task,
            rng,
            cloud_task: None,
            clouds_for_subs: Vec::new(),
        }
    }

    /// The task this assigner decides for.
    #[must_use]
    pub fn task(&self) -> &TaskSpec {
        &self.task
    }

    /// Loads the claim and reports an existing assignment.
    ///
    /// Returns `Some(cloud)` when the task is already assigned (the claim
    /// is immutable from then on) and `None` when the claim exists but is
    /// still open.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MissingClaim`] when no claim row exists.
    pub async fn check_cloud(&mut self) -> Result<Option<String>, BrokerError> {
        let task_id = self.task.task_id;
        tracing::debug!(target: "taskbrokerage", task_id, "checking cloud claim");
        let row = self.collab.store.get_cloud_task(task_id).await?;
        let Some(row) = row else {
            tracing::error!(target: "taskbrokerage", task_id, "cannot get cloud-task claim");
            return Err(BrokerError::MissingClaim { task_id });
        };
        let assigned = (row.status == ClaimStatus::Assigned).then(|| row.cloud.clone()).flatten();
        self.cloud_task = Some(row);
        if let Some(cloud) = &assigned {
            tracing::debug!(target: "taskbrokerage", task_id, cloud, "already assigned");
        } else {
            tracing::debug!(target: "taskbrokerage", task_id, "claim open, cloud to be set");
        }
        Ok(assigned)
    }

    /// Runs the full assignment decision.
    ///
    /// Returns `Ok(Some(cloud))` on commit, `Ok(None)` when every cloud was
    /// filtered out (the task stays unassigned, possibly with replication
    /// orders in flight).
    ///
    /// # Errors
    ///
    /// Returns the decision-fatal [`BrokerError`] kinds: missing claim, bad
    /// metadata, locator failure, zero weight, required-but-failed
    /// subscription, or commit rejection.
    #[allow(clippy::too_many_lines)]
    pub async fn assign(&mut self, meta: &TaskMetadata) -> Result<Option<String>, BrokerError> {
        let task_id = self.task.task_id;
        tracing::debug!(target: "taskbrokerage", task_id, "assigning cloud");

        // Idempotence: an assigned claim short-circuits with no side effects.
        if self.cloud_task.is_none() {
            if let Some(cloud) = self.check_cloud().await? {
                return Ok(Some(cloud));
            }
        } else if let Some(row) = &self.cloud_task
            && row.status == ClaimStatus::Assigned
        {
            return Ok(row.cloud.clone());
        }

        self.task.validate()?;
        let (exp_rw_self, priority) = match meta.require_self(task_id) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(target: "taskbrokerage", task_id, error = %err, "skipping task");
                return Err(err);
            }
        };
        let disk_count = self.task.max_disk_count_gb;
        tracing::debug!(
            target: "taskbrokerage",
            task_id,
            task_type = meta.task_type.as_str(),
            priority,
            expected_rw = exp_rw_self,
            disk_count,
            "decision input"
        );

        let pilots = self.collab.store.current_site_data().await?;
        let totals = rw::recompute(self.collab.store.as_ref(), task_id, meta).await;
        tracing::debug!(target: "taskbrokerage", task_id, rws = ?totals.rws, "recomputed RW");
        tracing::debug!(target: "taskbrokerage", task_id, full_rws = ?totals.full_rws, "recomputed full RW");

        let mut cloud_list = self.filter_clouds(meta, priority, disk_count);

        let using_open_ds = self.refresh_stale_replicas().await;

        let (removed_map, t2_for_missing) = self.apply_location_filter(&mut cloud_list);
        tracing::debug!(target: "taskbrokerage", task_id, ?cloud_list, "locations after replica filter");

        if cloud_list.is_empty() {
            tracing::error!(target: "taskbrokerage", task_id, "no input data locations");
            self.fallback_subscription(meta, &removed_map, &totals, exp_rw_self)
                .await;
            return Ok(None);
        }
        tracing::debug!(target: "taskbrokerage", task_id, ?cloud_list, "input data locations");

        let plan = BatchPlan::new(
            self.task.guids.len(),
            self.config.batch_size,
            self.config.max_batches,
            &mut self.rng,
        );
        // Open datasets accept any Tier-1 match.
        let max_n_files = if using_open_ds { 0 } else { plan.sampled_files() };

        let ctx = ScoreContext {
            totals: &totals,
            exp_rw_self,
            plan: &plan,
            max_n_files,
            pilots: &pilots,
        };
        let (weight_params, found_t1, cands_t2) =
            self.score_clouds(&cloud_list, &t2_for_missing, &ctx).await?;

        let mut max_clouds = if found_t1.is_empty() {
            cands_t2.clone()
        } else {
            found_t1
        };
        tracing::debug!(target: "taskbrokerage", task_id, "checking file counts");
        for (cloud_name, params) in &weight_params {
            if !max_clouds.contains(cloud_name) {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    n_files = params.n_files,
                    needed = max_n_files,
                    "skip: not enough files"
                );
            }
        }

        // Clouds far below their RW share take priority regardless of
        // pilot pressure.
        if !self.config.uses_mc_share(&meta.task_type) {
            let infinite: Vec<String> = max_clouds
                .iter()
                .filter(|name| {
                    let mcshare = weight_params.get(*name).map_or(0.0, |p| p.mcshare);
                    let promoted = totals.rw(name) < self.config.rw_low * mcshare;
                    if promoted {
                        tracing::debug!(
                            target: "taskbrokerage",
                            task_id,
                            cloud = name.as_str(),
                            rw = totals.rw(name),
                            threshold = self.config.rw_low * mcshare,
                            "infinite weight"
                        );
                    }
                    promoted
                })
                .cloned()
                .collect();
            if !infinite.is_empty() {
                tracing::debug!(target: "taskbrokerage", task_id, "using low-RW clouds only");
                max_clouds = infinite;
            }
        }

        if max_clouds.is_empty() {
            tracing::error!(target: "taskbrokerage", task_id, "no candidates left");
            let made = self
                .fallback_subscription(meta, &removed_map, &totals, exp_rw_self)
                .await;
            if self.config.subscribes(&meta.task_type) {
                if made {
                    tracing::info!(target: "taskbrokerage", task_id, "made subscription");
                } else {
                    tracing::warn!(target: "taskbrokerage", task_id, "didn't make subscription");
                }
            }
            return Ok(None);
        }

        tracing::debug!(target: "taskbrokerage", task_id, candidates = ?max_clouds, "candidates");
        let chosen = self.choose(meta, &totals, &weight_params, &max_clouds)?;

        if cands_t2.contains(&chosen) {
            self.subscribe_for_t2(&removed_map, &totals, exp_rw_self, &chosen)
                .await?;
        }

        self.commit(&chosen).await
    }

    /// Applies the policy filters: online status, validation, fast-track,
    /// and per-job disk footprint. Survivors are also recorded as the
    /// subscription-eligible set.
    fn filter_clouds(&mut self, meta: &TaskMetadata, priority: i64, disk_count: u32) -> Vec<String> {
        let task_id = self.task.task_id;
        let fasttrack_needed = (meta.task_type == "evgen"
            && priority >= self.config.evgen_fasttrack_prio)
            || (meta.task_type == "simul" && priority >= self.config.simul_fasttrack_prio);
        let mut kept = Vec::new();
        self.clouds_for_subs.clear();
        for name in self.collab.directory.cloud_list() {
            let Some(cloud) = self.collab.directory.cloud(&name) else {
                continue;
            };
            if !cloud.is_online() {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = name.as_str(),
                    status = cloud.status.as_str(),
                    "skip: cloud not online"
                );
                continue;
            }
            if self.task.prod_source_label == "validation" && !cloud.validation {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = name.as_str(),
                    "skip: not a validation cloud"
                );
                continue;
            }
            if fasttrack_needed && !cloud.fasttrack {
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = name.as_str(),
                    "skip: not a fast-track cloud"
                );
                continue;
            }
            if disk_count > 0 && !self.cloud_fits_disk(cloud, disk_count) {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = name.as_str(),
                    disk_count,
                    "skip: no online site has enough space per job"
                );
                continue;
            }
            kept.push(name.clone());
            self.clouds_for_subs.push(name);
        }
        kept
    }

    /// Returns `true` when any online member site can stage the per-job
    /// input. Scratch/test sites are ignored; an unset limit passes.
    fn cloud_fits_disk(&self, cloud: &CloudSpec, disk_count: u32) -> bool {
        cloud.sites.iter().any(|site_name| {
            if site_name.to_lowercase().contains("test") {
                return false;
            }
            self.collab
                .directory
                .site(site_name)
                .is_some_and(|site| site.is_online() && site.fits_input(disk_count))
        })
    }

    /// Fires refresh requests for stale replica listings and reports
    /// whether any input dataset is still open.
    async fn refresh_stale_replicas(&self) -> bool {
        let task_id = self.task.task_id;
        let locator = ReplicaLocator::new(Arc::clone(&self.collab.catalogue), &self.config);
        let mut using_open_ds = false;
        for (dataset, sites) in &self.task.locations {
            let mut stale: Vec<String> = Vec::new();
            for (site, stat) in sites {
                if stat.needs_refresh() {
                    stale.push(site.clone());
                } else if stat.is_open() {
                    using_open_ds = true;
                    tracing::debug!(target: "taskbrokerage", task_id, dataset, "open dataset");
                }
            }
            if !stale.is_empty() {
                locator.refresh(task_id, dataset, &stale).await;
            }
        }
        using_open_ds
    }

    /// Removes clouds with neither a Tier-1 nor a Tier-2 replica of some
    /// dataset. Returns the map of incomplete locations (for subscription
    /// planning) and the Tier-2 holders per cloud (for the fallback probe).
    fn apply_location_filter(
        &self,
        cloud_list: &mut Vec<String>,
    ) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let task_id = self.task.task_id;
        let mut removed_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut t2_for_missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if self.task.locations.is_empty() {
            return (removed_map, t2_for_missing);
        }
        let mut removed_clouds: Vec<String> = Vec::new();
        for (dataset, sites) in &self.task.locations {
            let lacking = removed_map.entry(dataset.clone()).or_default();
            tracing::debug!(target: "taskbrokerage", task_id, dataset, "replica filter");
            for cloud_name in cloud_list.iter() {
                let Some(cloud) = self.collab.directory.cloud(cloud_name) else {
                    continue;
                };
                // Tier-1 endpoint holding the most files; an unknown count
                // ranks below any concrete one.
                let mut min_found = -1_i64;
                let mut found_se: Option<&String> = None;
                for se in &cloud.tier1_se {
                    let Some(stat) = sites.get(se) else { continue };
                    match stat.found {
                        None => {
                            if min_found == -1 {
                                found_se = Some(se);
                            }
                        }
                        Some(f) => {
                            if min_found < f {
                                min_found = f;
                                found_se = Some(se);
                            }
                        }
                    }
                }
                let t2_list = self.t2_holders(sites, cloud);
                if let Some(se) = found_se {
                    let stat = &sites[se];
                    let incomplete =
                        stat.found.is_none() || stat.found.is_some_and(|f| f < stat.total);
                    if incomplete && !lacking.contains(cloud_name) {
                        lacking.push(cloud_name.clone());
                    }
                } else {
                    if t2_list.is_empty() && !removed_clouds.contains(cloud_name) {
                        tracing::debug!(
                            target: "taskbrokerage",
                            task_id,
                            cloud = cloud_name.as_str(),
                            dataset,
                            "removed: no replica in cloud"
                        );
                        removed_clouds.push(cloud_name.clone());
                    }
                    if !lacking.contains(cloud_name) {
                        lacking.push(cloud_name.clone());
                    }
                }
                let holders = t2_for_missing.entry(cloud_name.clone()).or_default();
                for t2 in t2_list {
                    if !holders.contains(&t2) {
                        holders.push(t2);
                    }
                }
            }
        }
        cloud_list.retain(|name| !removed_clouds.contains(name));
        (removed_map, t2_for_missing)
    }

    /// Online Tier-2 member sites whose storage holds a complete replica.
    fn t2_holders(
        &self,
        sites: &BTreeMap<String, crate::broker::task::ReplicaStat>,
        cloud: &CloudSpec,
    ) -> Vec<String> {
        cloud
            .sites
            .iter()
            .filter(|name| **name != cloud.source)
            .filter_map(|name| self.collab.directory.site(name))
            .filter(|site| site.is_online())
            .filter(|site| sites.get(&site.ddm).is_some_and(|stat| stat.is_complete()))
            .map(|site| site.name.clone())
            .collect()
    }

    /// Scores every surviving cloud: pilots, storage headroom, RW ceiling,
    /// then the Tier-1 replica probe with the Tier-2 fallback.
    #[allow(clippy::too_many_lines)]
    async fn score_clouds(
        &self,
        cloud_list: &[String],
        t2_for_missing: &BTreeMap<String, Vec<String>>,
        ctx: &ScoreContext<'_>,
    ) -> Result<ScoreOutcome, BrokerError> {
        let task_id = self.task.task_id;
        let locator = ReplicaLocator::new(Arc::clone(&self.collab.catalogue), &self.config);
        let mut weight_params: BTreeMap<String, WeightParams> = BTreeMap::new();
        let mut found_t1: Vec<String> = Vec::new();
        let mut cands_t2: Vec<String> = Vec::new();

        for cloud_name in cloud_list {
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = cloud_name.as_str(),
                "calculating weight"
            );
            let cloud =
                self.collab
                    .directory
                    .cloud(cloud_name)
                    .ok_or_else(|| BrokerError::UnknownCloud {
                        name: cloud_name.clone(),
                    })?;
            let t1 = self.collab.directory.site(&cloud.source).ok_or_else(|| {
                BrokerError::UnknownSite {
                    name: cloud.source.clone(),
                }
            })?;
            // Floor at 1 to avoid dividing by zero in the weight.
            let n_pilot = 1 + cloud
                .sites
                .iter()
                .filter_map(|site| ctx.pilots.get(site))
                .map(|counts| counts.total())
                .sum::<u64>();
            let params = WeightParams {
                n_pilot,
                space_gb: t1.space_gb,
                mcshare: cloud.mcshare,
                n_files: 0,
            };
            tracing::debug!(target: "taskbrokerage", task_id, cloud = cloud_name.as_str(), n_pilot, "pilots");
            tracing::debug!(target: "taskbrokerage", task_id, cloud = cloud_name.as_str(), space = t1.space_gb, "T1 space");
            tracing::debug!(target: "taskbrokerage", task_id, cloud = cloud_name.as_str(), mcshare = cloud.mcshare, "MC share");

            let budget = space_budget(
                params.space_gb,
                ctx.totals.full_rw(cloud_name),
                ctx.exp_rw_self,
                self.config.space_per_rw,
            );
            if budget.available < self.config.space_low_gb {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    available = budget.available,
                    total = params.space_gb,
                    assigned = budget.size_cloud,
                    this = budget.size_this,
                    floor = self.config.space_low_gb,
                    "skip: space"
                );
                continue;
            }
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = cloud_name.as_str(),
                available = budget.available,
                total = params.space_gb,
                assigned = budget.size_cloud,
                this = budget.size_this,
                "pass: space"
            );
            let rw = ctx.totals.rw(cloud_name);
            if rw > self.config.rw_high * params.mcshare {
                tracing::warn!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    rw,
                    ceiling = self.config.rw_high * params.mcshare,
                    "skip: RW too high"
                );
                continue;
            }

            let mut endpoint = CatalogueEndpoint::for_tier1(t1);
            if let Some(extra_sites) = self.config.extra_tier1_endpoint_sites.get(cloud_name) {
                for extra in extra_sites {
                    if let Some(site) = self.collab.directory.site(extra) {
                        endpoint.add_split_site(site);
                    }
                }
            }
            let mut params = params;
            params.n_files = locator
                .count_files(
                    task_id,
                    &self.task.lfns,
                    &self.task.guids,
                    &endpoint,
                    ctx.plan,
                )
                .await?;
            tracing::debug!(
                target: "taskbrokerage",
                task_id,
                cloud = cloud_name.as_str(),
                n_files = params.n_files,
                "files at T1"
            );
            if params.n_files >= ctx.max_n_files {
                found_t1.push(cloud_name.clone());
            } else if found_t1.is_empty()
                && t2_for_missing
                    .get(cloud_name)
                    .is_some_and(|t2| !t2.is_empty())
            {
                self.probe_t2(
                    &locator,
                    cloud_name,
                    &t2_for_missing[cloud_name],
                    ctx,
                    &mut params,
                    &mut cands_t2,
                )
                .await;
            }
            weight_params.insert(cloud_name.clone(), params);
        }
        Ok((weight_params, found_t1, cands_t2))
    }

    /// Probes the Tier-2 holders of a cloud, grouped by catalogue, keeping
    /// the best count. A catalogue that stays unreachable is skipped: the
    /// Tier-2 path only ever improves a cloud's standing.
    async fn probe_t2(
        &self,
        locator: &ReplicaLocator,
        cloud_name: &str,
        t2_sites: &[String],
        ctx: &ScoreContext<'_>,
        params: &mut WeightParams,
        cands_t2: &mut Vec<String>,
    ) {
        let task_id = self.task.task_id;
        let mut by_catalogue: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for t2_name in t2_sites {
            let Some(site) = self.collab.directory.site(t2_name) else {
                continue;
            };
            let Some(lfc) = site.lfc_host.as_deref().filter(|h| !h.is_empty()) else {
                continue;
            };
            let hosts = site.se.as_deref().map(se_hosts).unwrap_or_default();
            by_catalogue.entry(lfc_url(lfc)).or_default().extend(hosts);
        }
        for (url, storage_hosts) in by_catalogue {
            let endpoint = CatalogueEndpoint {
                url,
                storage_hosts,
            };
            match locator
                .count_files(
                    task_id,
                    &self.task.lfns,
                    &self.task.guids,
                    &endpoint,
                    ctx.plan,
                )
                .await
            {
                Ok(n_files) => {
                    tracing::debug!(
                        target: "taskbrokerage",
                        task_id,
                        cloud = cloud_name,
                        catalogue = endpoint.url.as_str(),
                        n_files,
                        "files at T2"
                    );
                    if n_files > params.n_files {
                        params.n_files = n_files;
                        if params.n_files >= ctx.max_n_files {
                            cands_t2.push(cloud_name.to_string());
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target: "taskbrokerage",
                        task_id,
                        cloud = cloud_name,
                        catalogue = endpoint.url.as_str(),
                        error = %err,
                        "T2 catalogue unreachable, skipping"
                    );
                }
            }
        }
    }

    /// Picks the destination: single survivor directly, otherwise a draw
    /// weighted by MC share (MC-share tasks) or pilot pressure per unit RW.
    fn choose(
        &mut self,
        meta: &TaskMetadata,
        totals: &RwTotals,
        weight_params: &BTreeMap<String, WeightParams>,
        max_clouds: &[String],
    ) -> Result<String, BrokerError> {
        let task_id = self.task.task_id;
        if let [only] = max_clouds {
            return Ok(only.clone());
        }
        let mut candidates: Vec<(String, f64)> = Vec::with_capacity(max_clouds.len());
        for cloud_name in max_clouds {
            let params = weight_params.get(cloud_name);
            let weight = if self.config.uses_mc_share(&meta.task_type) {
                let mcshare = params.map_or(0.0, |p| p.mcshare);
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    weight = mcshare,
                    "weight from MC share"
                );
                mcshare
            } else {
                #[allow(clippy::cast_precision_loss)]
                let n_pilot = params.map_or(1, |p| p.n_pilot) as f64;
                let rw = totals.rw(cloud_name);
                tracing::debug!(
                    target: "taskbrokerage",
                    task_id,
                    cloud = cloud_name.as_str(),
                    n_pilot,
                    rw,
                    "weight from pilots per RW"
                );
                n_pilot / (1.0 + rw)
            };
            candidates.push((cloud_name.clone(), weight));
        }
        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        tracing::debug!(target: "taskbrokerage", task_id, ?candidates, total, "weighted draw");
        weighted_draw(&mut self.rng, &candidates)
            .map(str::to_string)
            .ok_or_else(|| {
                tracing::error!(target: "taskbrokerage", task_id, "total weight is zero");
                BrokerError::ZeroWeight { task_id }
            })
    }

    /// Runs the subscription planner on the empty-candidate paths; the
    /// decision outcome does not depend on the result.
    async fn fallback_subscription(
        &self,
        meta: &TaskMetadata,
        removed_map: &BTreeMap<String, Vec<String>>,
        totals: &RwTotals,
        exp_rw_self: f64,
    ) -> bool {
        let task_id = self.task.task_id;
        if !self.config.subscribes(&meta.task_type) {
            return false;
        }
        tracing::debug!(target: "taskbrokerage", task_id, "starting fallback subscription");
        let planner = SubscriptionPlanner::new(
            self.collab.directory.as_ref(),
            self.collab.ddm.as_ref(),
            self.collab.identity.as_ref(),
            &self.config,
            task_id,
        );
        let made = planner
            .subscribe(&SubscribeRequest {
                removed: removed_map,
                eligible_clouds: &self.clouds_for_subs,
                totals,
                exp_rw_self,
                no_empty_check: false,
                accept_in_process: false,
            })
            .await;
        tracing::debug!(target: "taskbrokerage", task_id, made, "fallback subscription finished");
        made
    }

    /// Orders the datasets a Tier-2-backed choice depends on to the chosen
    /// cloud's Tier-1.
    async fn subscribe_for_t2(
        &self,
        removed_map: &BTreeMap<String, Vec<String>>,
        totals: &RwTotals,
        exp_rw_self: f64,
        chosen: &str,
    ) -> Result<(), BrokerError> {
        let task_id = self.task.task_id;
        let restricted: BTreeMap<String, Vec<String>> = removed_map
            .iter()
            .filter(|(_, clouds)| clouds.contains(&chosen.to_string()))
            .map(|(dataset, _)| (dataset.clone(), vec![chosen.to_string()]))
            .collect();
        if restricted.is_empty() {
            tracing::error!(
                target: "taskbrokerage",
                task_id,
                cloud = chosen,
                "no subscription map to back the Tier-2 choice"
            );
            return Err(BrokerError::SubscriptionRequired {
                task_id,
                cloud: chosen.to_string(),
            });
        }
        tracing::debug!(target: "taskbrokerage", task_id, cloud = chosen, "subscribing for Tier-2 use");
        let planner = SubscriptionPlanner::new(
            self.collab.directory.as_ref(),
            self.collab.ddm.as_ref(),
            self.collab.identity.as_ref(),
            &self.config,
            task_id,
        );
        let made = planner
            .subscribe(&SubscribeRequest {
                removed: &restricted,
                eligible_clouds: &self.clouds_for_subs,
                totals,
                exp_rw_self,
                no_empty_check: true,
                accept_in_process: true,
            })
            .await;
        if !made {
            tracing::error!(
                target: "taskbrokerage",
                task_id,
                cloud = chosen,
                "subscription for Tier-2 use failed"
            );
            return Err(BrokerError::SubscriptionRequired {
                task_id,
                cloud: chosen.to_string(),
            });
        }
        Ok(())
    }

    /// Persists the decision, flipping the claim to `assigned`.
    async fn commit(&mut self, chosen: &str) -> Result<Option<String>, BrokerError> {
        let task_id = self.task.task_id;
        let row = CloudTask {
            task_id,
            cloud: Some(chosen.to_string()),
            status: ClaimStatus::Assigned,
        };
        let stored = self
            .collab
            .store
            .set_cloud_task(row)
            .await
            .map_err(|err| {
                tracing::error!(target: "taskbrokerage", task_id, error = %err, "cannot set cloud-task");
                BrokerError::CommitFailed {
                    task_id,
                    message: err.to_string(),
                }
            })?;
        tracing::info!(target: "taskbrokerage", task_id, cloud = chosen, "cloud set");
        let cloud = stored.cloud.clone();
        self.cloud_task = Some(stored);
        Ok(cloud)
    }
}

impl std::fmt::Debug for TaskAssigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskAssigner")
            .field("task_id", &self.task.task_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Borrowed decision context threaded through the scoring loop.
struct ScoreContext<'a> {
    totals: &'a RwTotals,
    exp_rw_self: f64,
    plan: &'a BatchPlan,
    max_n_files: usize,
    pilots: &'a std::collections::HashMap<String, PilotCounts>,
}

/// Weight table plus the Tier-1 and Tier-2 candidate sets.
type ScoreOutcome = (BTreeMap<String, WeightParams>, Vec<String>, Vec<String>);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::task::{DatasetLocations, ReplicaStat};
    use crate::directory::SiteSpec;
    use crate::snapshot::{WorldSnapshot, SubscriptionRecord};
    use std::collections::HashMap;

    const DS: &str = "mc20.123456.evgen.dataset";

    fn lfns() -> Vec<String> {
        (1..=4).map(|i| format!("f{i}")).collect()
    }

    fn guids() -> Vec<String> {
        (1..=4).map(|i| format!("g{i}")).collect()
    }

    fn cloud(name: &str, mcshare: f64) -> CloudSpec {
        CloudSpec {
            name: name.to_string(),
            status: "online".to_string(),
            validation: false,
            fasttrack: false,
            mcshare,
            source: format!("{name}-T1"),
            sites: vec![format!("{name}-T1")],
            tier1_se: vec![format!("{name}_DATADISK")],
        }
    }

    fn t1_site(cloud: &str, space_gb: f64) -> SiteSpec {
        let lower = cloud.to_lowercase();
        SiteSpec {
            name: format!("{cloud}-T1"),
            status: "online".to_string(),
            max_input_size_gb: 0,
            space_gb,
            lfc_host: Some(format!("lfc.{lower}.example.org")),
            se: Some(format!("srm://se.{lower}.example.org:8446/srm/v2")),
            ddm: format!("{cloud}_DATADISK"),
            dq2_url: None,
        }
    }

    fn stat(total: i64, found: Option<i64>) -> ReplicaStat {
        ReplicaStat {
            total,
            found,
            immutable: 1,
        }
    }

    fn metadata(task_type: &str, task_id: u64, exp_rw: f64, priority: i64, rws: &str) -> String {
        format!(
            r#"{task_type};{rws};{{"{task_id}": {exp_rw}}};{{"{task_id}": {priority}}};{{}};{{"{task_id}": "{task_type}"}}"#
        )
    }

    /// Scenario base: clouds US, CA, DE online with one dataset fully at
    /// the US Tier-1 and partially at the CA Tier-1.
    fn happy_world() -> WorldSnapshot {
        let mut locations = DatasetLocations::new();
        locations.insert(
            DS.to_string(),
            [
                ("US_DATADISK".to_string(), stat(4, Some(4))),
                ("CA_DATADISK".to_string(), stat(4, Some(2))),
            ]
            .into_iter()
            .collect(),
        );
        WorldSnapshot {
            clouds: vec![cloud("US", 1.0), cloud("CA", 0.5), cloud("DE", 1.0)],
            sites: vec![
                t1_site("US", 5_000.0),
                t1_site("CA", 5_000.0),
                t1_site("DE", 5_000.0),
            ],
            claims: vec![CloudTask {
                task_id: 9001,
                cloud: None,
                status: ClaimStatus::Unassigned,
            }],
            peer_clouds: HashMap::new(),
            pilot_counts: HashMap::new(),
            replicas: HashMap::from([
                ("se.us.example.org".to_string(), lfns()),
                (
                    "se.ca.example.org".to_string(),
                    vec!["f1".to_string(), "f2".to_string()],
                ),
            ]),
            dataset_files: HashMap::new(),
            subscriptions: HashMap::new(),
            caller_dn: "/DC=org/CN=Robot".to_string(),
            task: TaskSpec {
                task_id: 9001,
                prod_source_label: "managed".to_string(),
                max_disk_count_gb: 0,
                lfns: lfns(),
                guids: guids(),
                locations,
            },
            metadata: metadata(
                "evgen",
                9001,
                50.0,
                500,
                r#"{"US": 100.0, "CA": 0.0, "DE": 200.0}"#,
            ),
        }
    }

    async fn run(world: &WorldSnapshot, seed: u64) -> (Result<Option<String>, BrokerError>, crate::snapshot::OfflineState) {
        let (mut assigner, state) = world
            .assigner(seed)
            .unwrap_or_else(|_| unreachable!());
        let meta = TaskMetadata::parse(world.task.task_id, &world.metadata)
            .unwrap_or_else(|_| unreachable!());
        (assigner.assign(&meta).await, state)
    }

    #[tokio::test]
    async fn test_happy_t1_path_picks_complete_cloud() {
        let world = happy_world();
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), Some("US".to_string()));
        let claim = state.claim(9001).unwrap_or_else(|| unreachable!());
        assert_eq!(claim.status, ClaimStatus::Assigned);
        assert_eq!(claim.cloud.as_deref(), Some("US"));
        assert!(state.registered_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_weighted_split_uses_both_clouds() {
        // Inputs fully replicated at US and DE; MC-share task, equal
        // shares, so both clouds must win some decisions.
        let mut world = happy_world();
        world
            .replicas
            .insert("se.de.example.org".to_string(), lfns());
        if let Some(sites) = world.task.locations.get_mut(DS) {
            sites.insert("DE_DATADISK".to_string(), stat(4, Some(4)));
            sites.remove("CA_DATADISK");
        }
        let mut wins: HashMap<String, u32> = HashMap::new();
        for seed in 0..100 {
            let (result, _state) = run(&world, seed).await;
            let cloud = result
                .unwrap_or_else(|_| unreachable!())
                .unwrap_or_else(|| unreachable!());
            *wins.entry(cloud).or_insert(0) += 1;
        }
        let us = wins.get("US").copied().unwrap_or(0);
        let de = wins.get("DE").copied().unwrap_or(0);
        assert_eq!(us + de, 100);
        assert!(us >= 20, "US won only {us} of 100");
        assert!(de >= 20, "DE won only {de} of 100");
    }

    #[tokio::test]
    async fn test_fasttrack_blocks_high_priority_simul() {
        // Only cloud with inputs lacks fast-track; prio 900 simul needs it.
        let mut world = happy_world();
        world.clouds = vec![cloud("XYZ", 1.0)];
        world.sites = vec![t1_site("XYZ", 5_000.0)];
        world.replicas =
            HashMap::from([("se.xyz.example.org".to_string(), lfns())]);
        world.task.locations = DatasetLocations::new();
        world.task.locations.insert(
            DS.to_string(),
            [("XYZ_DATADISK".to_string(), stat(4, Some(4)))]
                .into_iter()
                .collect(),
        );
        world.metadata = metadata("simul", 9001, 50.0, 900, "{}");
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
        assert!(state.registered_subscriptions().is_empty());
        assert!(state.claim(9001).is_some_and(|c| c.status == ClaimStatus::Unassigned));
    }

    /// Scenario: inputs only at a Tier-2 of cloud IT.
    fn t2_world() -> WorldSnapshot {
        let mut world = happy_world();
        world.clouds = vec![CloudSpec {
            name: "IT".to_string(),
            status: "online".to_string(),
            validation: false,
            fasttrack: false,
            mcshare: 1.0,
            source: "IT-T1".to_string(),
            sites: vec!["IT-T1".to_string(), "IT-T2".to_string()],
            tier1_se: vec!["IT_DATADISK".to_string()],
        }];
        world.sites = vec![
            t1_site("IT", 10_000.0),
            SiteSpec {
                name: "IT-T2".to_string(),
                status: "online".to_string(),
                max_input_size_gb: 0,
                space_gb: 1_000.0,
                lfc_host: Some("lfc.it2.example.org".to_string()),
                se: Some("srm://se.it2.example.org:8446/srm/v2".to_string()),
                ddm: "IT-T2_DATADISK".to_string(),
                dq2_url: None,
            },
        ];
        world.replicas = HashMap::from([("se.it2.example.org".to_string(), lfns())]);
        world.task.locations = DatasetLocations::new();
        world.task.locations.insert(
            DS.to_string(),
            [("IT-T2_DATADISK".to_string(), stat(4, Some(4)))]
                .into_iter()
                .collect(),
        );
        world.dataset_files = HashMap::from([(
            DS.to_string(),
            vec![crate::external::DatasetFile {
                guid: "g1".to_string(),
                lfn: "f1".to_string(),
                filesize: 1024 * 1024 * 1024,
            }],
        )]);
        world.metadata = metadata("simul", 9001, 50.0, 500, "{}");
        world
    }

    #[tokio::test]
    async fn test_t2_fallback_subscribes_and_assigns() {
        let world = t2_world();
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), Some("IT".to_string()));
        // Exactly one order, to the chosen cloud's Tier-1 endpoint.
        assert_eq!(
            state.registered_subscriptions(),
            vec![(DS.to_string(), "IT_DATADISK".to_string())]
        );
        assert!(state.claim(9001).is_some_and(|c| c.status == ClaimStatus::Assigned));
    }

    #[tokio::test]
    async fn test_disk_filter_drops_small_sites() {
        // Every online site in US caps per-job input below the requirement.
        let mut world = happy_world();
        world.clouds = vec![cloud("US", 1.0)];
        world.sites = vec![SiteSpec {
            max_input_size_gb: 200,
            ..t1_site("US", 5_000.0)
        }];
        world.task.max_disk_count_gb = 500;
        world.task.locations = DatasetLocations::new();
        world.task.locations.insert(
            DS.to_string(),
            [("US_DATADISK".to_string(), stat(4, Some(4)))]
                .into_iter()
                .collect(),
        );
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
        assert!(state.claim(9001).is_some_and(|c| c.status == ClaimStatus::Unassigned));
    }

    #[tokio::test]
    async fn test_storage_headroom_drops_loaded_cloud() {
        // space 2000, fullRW 9000, expRW 500: available 100 < 1024.
        let mut world = happy_world();
        world.clouds = vec![cloud("RU", 1.0)];
        world.sites = vec![t1_site("RU", 2_000.0)];
        world.replicas = HashMap::from([("se.ru.example.org".to_string(), lfns())]);
        world.task.locations = DatasetLocations::new();
        world.task.locations.insert(
            DS.to_string(),
            [("RU_DATADISK".to_string(), stat(4, Some(4)))]
                .into_iter()
                .collect(),
        );
        world.metadata = metadata("evgen", 9001, 500.0, 500, r#"{"RU": 0.0}"#)
            .replace(r#";{};"#, r#";{"RU": 9000.0};"#);
        let (result, _state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
    }

    #[tokio::test]
    async fn test_assigned_claim_short_circuits() {
        // Idempotence: no probes, no refreshes, same cloud back.
        let mut world = happy_world();
        world.claims = vec![CloudTask {
            task_id: 9001,
            cloud: Some("CA".to_string()),
            status: ClaimStatus::Assigned,
        }];
        // Stale stats would otherwise trigger a refresh.
        if let Some(sites) = world.task.locations.get_mut(DS) {
            sites.insert("US_DATADISK".to_string(), stat(-1, None));
        }
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), Some("CA".to_string()));
        assert!(state.refreshes().is_empty());
        assert!(state.registered_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_missing_claim_is_fatal() {
        let mut world = happy_world();
        world.claims.clear();
        let (result, _state) = run(&world, 1).await;
        assert!(matches!(result, Err(BrokerError::MissingClaim { task_id: 9001 })));
    }

    #[tokio::test]
    async fn test_offline_cloud_never_chosen() {
        // The offline cloud holds all the data; the decision must not pick it.
        let mut world = happy_world();
        for c in &mut world.clouds {
            if c.name == "US" {
                c.status = "offline".to_string();
            }
        }
        let (result, _state) = run(&world, 1).await;
        // CA holds a partial replica only, DE nothing: no candidate.
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
    }

    #[tokio::test]
    async fn test_fasttrack_cloud_survives_any_priority() {
        // A fast-track cloud passes the fast-track filter at every priority.
        let mut world = happy_world();
        for c in &mut world.clouds {
            c.fasttrack = true;
        }
        for priority in [100, 699, 700, 900] {
            world.metadata = metadata(
                "evgen",
                9001,
                50.0,
                priority,
                r#"{"US": 100.0, "CA": 0.0, "DE": 200.0}"#,
            );
            let (result, _state) = run(&world, 1).await;
            assert_eq!(
                result.unwrap_or_else(|_| unreachable!()),
                Some("US".to_string()),
                "priority {priority}"
            );
        }
    }

    #[tokio::test]
    async fn test_stale_replicas_trigger_refresh() {
        let mut world = happy_world();
        if let Some(sites) = world.task.locations.get_mut(DS) {
            sites.insert("DE_DATADISK".to_string(), stat(-1, None));
        }
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), Some("US".to_string()));
        assert_eq!(
            state.refreshes(),
            vec![(DS.to_string(), vec!["DE_DATADISK".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_validation_task_needs_validation_cloud() {
        let mut world = happy_world();
        world.task.prod_source_label = "validation".to_string();
        // Only CA takes validation work; it holds a partial replica, so
        // the decision ends with no candidate rather than picking US.
        for c in &mut world.clouds {
            c.validation = c.name == "CA";
        }
        let (result, _state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
    }

    #[tokio::test]
    async fn test_high_rw_cloud_rejected() {
        // US holds the data but its RW exceeds the ceiling for its share.
        let mut world = happy_world();
        world.metadata = metadata(
            "evgen",
            9001,
            50.0,
            500,
            r#"{"US": 9000.0, "CA": 0.0, "DE": 200.0}"#,
        );
        let (result, _state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
    }

    #[tokio::test]
    async fn test_in_flight_subscription_logged_in_snapshot() {
        // An existing subscription by the same identity suppresses the
        // empty-candidate fallback order.
        let mut world = t2_world();
        // Take away the T2 replica so no candidate survives at all.
        world.replicas.clear();
        world.task.locations = DatasetLocations::new();
        world.task.locations.insert(
            DS.to_string(),
            [("ELSEWHERE_DATADISK".to_string(), stat(4, Some(4)))]
                .into_iter()
                .collect(),
        );
        world.subscriptions = HashMap::from([(
            DS.to_string(),
            vec![SubscriptionRecord {
                endpoint: "IT_DATADISK".to_string(),
                owner: "/DC=org/CN=Robot".to_string(),
            }],
        )]);
        let (result, state) = run(&world, 1).await;
        assert_eq!(result.unwrap_or_else(|_| unreachable!()), None);
        assert!(state.registered_subscriptions().is_empty());
    }
}
